use crate::error::{Cancelled, InjectError};
use crate::prompt::Prompter;
use colored::*;
use log::{debug, error, info};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// Append-only record of every path created or modified by a run.
///
/// One UTF-8 path per line, no header. Cleanup replays it and removes each
/// distinct path once.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Ledger { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `path` to the ledger, creating the ledger if needed.
    pub fn record(&self, path: &Path) -> Result<(), InjectError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| InjectError::io(&self.path, e))?;
        writeln!(file, "{}", path.display()).map_err(|e| InjectError::io(&self.path, e))?;
        debug!("Recorded {} in {}", path.display(), self.path.display());
        Ok(())
    }

    /// Recorded paths in ledger order, duplicates included.
    pub fn entries(&self) -> Result<Vec<PathBuf>, InjectError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(InjectError::io(&self.path, e)),
        }
    }

    /// Replay the ledger. With `destroy_all` every entry is removed without
    /// asking, otherwise the operator confirms each one. The ledger registers
    /// itself first so it is removed along with everything else.
    ///
    /// A failed removal is logged and the replay moves on. Paths that are
    /// already gone count as removed, so replaying twice is harmless.
    pub fn cleanup<R: BufRead, W: Write>(
        &self,
        destroy_all: bool,
        prompter: &mut Prompter<R, W>,
    ) -> Result<CleanupReport, Cancelled> {
        let mut report = CleanupReport::default();

        if !self.path.exists() {
            info!("No ledger at {}, nothing to clean up", self.path.display());
            return Ok(report);
        }
        if let Err(e) = self.record(&self.path) {
            error!("Unable to register the ledger for removal: {e}");
        }

        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Unable to read ledger: {e}");
                return Ok(report);
            }
        };

        let mut seen = HashSet::new();
        for entry in entries {
            if !seen.insert(entry.clone()) {
                continue;
            }
            let remove = destroy_all
                || prompter.ask(&format!("Would you like to remove this file/folder: {}?", entry.display()))?;
            if !remove {
                report.kept.push(entry);
                continue;
            }
            match remove_path(&entry) {
                Ok(()) => {
                    prompter.say(&format!("{} {}", "Removed".green(), entry.display()));
                    report.removed.push(entry);
                }
                Err(e) => {
                    error!("Error removing {}: {e}", entry.display());
                    prompter.say(&format!("{} {}: {e}", "Error removing".red().bold(), entry.display()));
                    report.failed.push(entry);
                }
            }
        }
        Ok(report)
    }
}

/// Recursive delete that treats a missing path as already removed.
fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn prompter(input: &str) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        Prompter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn test_record_appends_lines() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger"));
        ledger.record(Path::new("/etc/puppetlabs/code/modules/my_cmd")).unwrap();
        ledger.record(Path::new("/srv/salt/my_cmd")).unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(content, "/etc/puppetlabs/code/modules/my_cmd\n/srv/salt/my_cmd\n");
    }

    #[test]
    fn test_cleanup_destroys_everything_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger"));
        let role = dir.path().join("roles").join("my_cmd");
        fs::create_dir_all(role.join("tasks")).unwrap();
        fs::write(role.join("tasks").join("main.yml"), "- shell: id\n").unwrap();
        let upload = dir.path().join("payload.sh");
        fs::write(&upload, "#!/bin/sh\n").unwrap();

        ledger.record(&role).unwrap();
        ledger.record(&upload).unwrap();
        ledger.record(&role).unwrap();

        let report = ledger.cleanup(true, &mut prompter("")).unwrap();
        assert!(!role.exists());
        assert!(!upload.exists());
        assert!(!ledger.path().exists());
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed.is_empty());

        let second = ledger.cleanup(true, &mut prompter("")).unwrap();
        assert_eq!(second, CleanupReport::default());
    }

    #[test]
    fn test_cleanup_already_deleted_paths_do_not_fail() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger"));
        ledger.record(&dir.path().join("gone")).unwrap();

        let report = ledger.cleanup(true, &mut prompter("")).unwrap();
        assert!(report.failed.is_empty());
        assert!(report.removed.contains(&dir.path().join("gone")));
    }

    #[test]
    fn test_cleanup_asks_per_distinct_path() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger"));
        let keep = dir.path().join("keep");
        let drop = dir.path().join("drop");
        fs::write(&keep, "").unwrap();
        fs::write(&drop, "").unwrap();
        ledger.record(&keep).unwrap();
        ledger.record(&drop).unwrap();
        ledger.record(&keep).unwrap();

        // keep -> n, drop -> Y, ledger itself -> n
        let report = ledger.cleanup(false, &mut prompter("n\nY\nn\n")).unwrap();
        assert!(keep.exists());
        assert!(!drop.exists());
        assert_eq!(report.removed, vec![drop]);
        assert_eq!(report.kept, vec![keep, ledger.path().to_path_buf()]);
    }

    #[test]
    fn test_cleanup_quit_stops_replay() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger"));
        let first = dir.path().join("first");
        fs::write(&first, "").unwrap();
        ledger.record(&first).unwrap();

        assert_eq!(ledger.cleanup(false, &mut prompter("q\n")), Err(Cancelled));
        assert!(first.exists());
    }

    #[test]
    fn test_missing_ledger_has_no_entries() {
        let ledger = Ledger::new("/nonexistent/mose/ledger");
        assert!(ledger.entries().unwrap().is_empty());
    }
}
