use crate::error::InjectError;
use crate::utils;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub const BACKUP_SUFFIX: &str = ".bak.mose";

/// Pairing of a control file with its `.bak.mose` copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Created,
    AlreadyExists,
}

impl BackupRecord {
    /// `<path>.bak.mose`, or `<backup_dir>/<basename>.bak.mose` when a backup
    /// directory is configured.
    pub fn for_path(original: &Path, backup_dir: Option<&Path>) -> Self {
        let base = match (backup_dir, original.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => original.to_path_buf(),
        };
        let mut backup = base.into_os_string();
        backup.push(BACKUP_SUFFIX);
        BackupRecord {
            original_path: original.to_path_buf(),
            backup_path: PathBuf::from(backup),
        }
    }

    pub fn exists(&self) -> bool {
        self.backup_path.exists()
    }

    /// Copy the original aside. An existing backup is never overwritten.
    pub fn create(&self) -> Result<BackupOutcome, InjectError> {
        if self.exists() {
            warn!(
                "Backup of {} already exists ({}), moving on",
                self.original_path.display(),
                self.backup_path.display()
            );
            return Ok(BackupOutcome::AlreadyExists);
        }
        if let Some(parent) = self.backup_path.parent() {
            fs::create_dir_all(parent).map_err(|e| InjectError::io(parent, e))?;
        }
        fs::copy(&self.original_path, &self.backup_path).map_err(|e| InjectError::io(&self.backup_path, e))?;
        if let Some((uid, gid)) = utils::owner_of(&self.original_path) {
            if let Err(e) = utils::chown(&self.backup_path, uid, gid) {
                debug!("Unable to match backup owner to the original: {e}");
            }
        }
        info!("Backed up {} to {}", self.original_path.display(), self.backup_path.display());
        Ok(BackupOutcome::Created)
    }

    /// Copy the backup over the live file and delete the backup.
    /// Returns `false` when there is no backup to restore.
    pub fn restore(&self) -> Result<bool, InjectError> {
        if !self.exists() {
            info!("Backup file {} does not exist, skipping", self.backup_path.display());
            return Ok(false);
        }
        fs::copy(&self.backup_path, &self.original_path).map_err(|e| InjectError::io(&self.original_path, e))?;
        fs::remove_file(&self.backup_path).map_err(|e| InjectError::io(&self.backup_path, e))?;
        info!("Restored {} from {}", self.original_path.display(), self.backup_path.display());
        Ok(true)
    }
}
