// mose - configuration management injection engine
// Per-tool adapters
//
// Every adapter follows the same shape: locate the control file, parse it,
// plan injection points, ask the operator, mutate, then generate the unit
// (role, module, state or cookbook) that carries the payload. The shared
// pieces live here.

pub mod ansible;
pub mod chef;
pub mod puppet;
pub mod salt;

use crate::backup::BackupRecord;
use crate::config::EngineConfig;
use crate::error::{Cancelled, InjectError};
use crate::ledger::{CleanupReport, Ledger};
use crate::locator::CmTool;
use crate::prompt::Prompter;
use crate::templates::{TemplateFields, TemplateStore};
use crate::utils;
use async_trait::async_trait;
use colored::*;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Entry in a roles or states list: a bare name, or a structured entry such
/// as `{role: ntp, tags: [time]}` or `{match: nodegroup}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitRef {
    Name(String),
    Structured(Mapping),
}

impl UnitRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            UnitRef::Name(name) => Some(name),
            UnitRef::Structured(map) => map.get("role").or_else(|| map.get("name")).and_then(Value::as_str),
        }
    }
}

/// Decode a YAML list of unit references, skipping entries of neither shape.
pub fn unit_refs(list: &[Value]) -> Vec<UnitRef> {
    list.iter()
        .filter_map(|v| serde_yaml::from_value(v.clone()).ok())
        .collect()
}

pub fn references_unit(list: &[Value], payload: &str) -> bool {
    unit_refs(list).iter().any(|r| r.name() == Some(payload))
}

/// Display form of a YAML mapping key.
pub fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).map(|s| s.trim().to_string()).unwrap_or_default(),
    }
}

/// State shared by every step of one invocation.
pub struct Session {
    pub config: EngineConfig,
    pub prompter: Prompter,
    pub ledger: Ledger,
    pub templates: TemplateStore,
    mutated: bool,
}

impl Session {
    pub fn new(config: EngineConfig, prompter: Prompter) -> Self {
        let ledger = Ledger::new(&config.ledger_path);
        Session {
            config,
            prompter,
            ledger,
            templates: TemplateStore::builtin(),
            mutated: false,
        }
    }

    /// Whether anything on disk has been touched during this run.
    pub fn mutated(&self) -> bool {
        self.mutated
    }

    pub fn mark_modified(&mut self) {
        self.mutated = true;
    }

    /// Add a created path to the ledger. A ledger failure is logged, not raised.
    pub fn record(&mut self, path: &Path) {
        self.mutated = true;
        if let Err(e) = self.ledger.record(path) {
            error!("Unable to record {} in the ledger: {e}", path.display());
        }
    }

    pub fn fields(&self) -> TemplateFields {
        TemplateFields::from_config(&self.config)
    }

    pub fn backup_record(&self, path: &Path) -> BackupRecord {
        BackupRecord::for_path(path, self.config.backup_dir.as_deref())
    }

    /// Offer to back up a control file before it is modified.
    pub fn offer_backup(&mut self, path: &Path) -> Result<(), Cancelled> {
        if self.prompter.ask(&format!("Do you want to create a backup of {}?", path.display()))? {
            if let Err(e) = self.backup_record(path).create() {
                error!("Backup of {} failed: {e}", path.display());
            }
        }
        Ok(())
    }

    pub fn payload(&self) -> &str {
        &self.config.payload_name
    }
}

/// Where a generated unit lives on disk.
#[derive(Debug, Clone)]
pub struct UnitLayout {
    pub dir: PathBuf,
    pub body: PathBuf,
    pub files: PathBuf,
}

/// Write the unit body from `plain` (command) or `upload` (file) and copy
/// the upload into the unit's files directory. The unit directory is
/// recorded before anything is written.
pub fn materialize_unit(
    session: &mut Session,
    layout: &UnitLayout,
    plain: &str,
    upload: &str,
) -> Result<(), InjectError> {
    session.record(&layout.dir);

    let template = if session.config.file_upload.is_some() { upload } else { plain };
    let body = session.templates.render(template, &session.fields())?;
    write_file(&layout.body, &body)?;

    if let Some(source) = &session.config.file_upload {
        utils::install_upload(source, &layout.files).map_err(|e| InjectError::io(&layout.files, e))?;
    }
    info!("Generated {} at {}", session.payload(), layout.dir.display());
    Ok(())
}

pub fn write_file(path: &Path, content: &str) -> Result<(), InjectError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| InjectError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| InjectError::io(path, e))?;
    debug!("Wrote {} ({} bytes)", path.display(), content.len());
    Ok(())
}

/// Give generated files the owner of the control file they hang off.
pub fn match_owner(reference: Option<(u32, u32)>, path: &Path) {
    if let Some((uid, gid)) = reference {
        if let Err(e) = utils::chown_recursive(path, uid, gid) {
            debug!("Unable to chown {}: {e}", path.display());
        }
    }
}

/// Result of processing one control file.
#[derive(Debug, Default)]
pub struct FileOutcome {
    pub references: usize,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct InjectSummary {
    pub control_files: Vec<PathBuf>,
    pub references: usize,
    pub artifacts: Vec<PathBuf>,
    pub failures: Vec<String>,
}

impl InjectSummary {
    /// Fold one control file's outcome in. Fatal errors end the run, the
    /// rest only end that file.
    pub fn absorb(&mut self, path: &Path, outcome: Result<FileOutcome, InjectError>) -> Result<(), InjectError> {
        match outcome {
            Ok(outcome) => {
                if outcome.references > 0 {
                    self.control_files.push(path.to_path_buf());
                }
                self.references += outcome.references;
                self.artifacts.extend(outcome.artifacts);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("Giving up on {}: {e}", path.display());
                self.failures.push(format!("{}: {e}", path.display()));
                Ok(())
            }
        }
    }
}

/// Revert a previous run: replay the ledger, then put backups back over the
/// control files.
pub fn cleanup_previous_run(session: &mut Session, control_files: &[PathBuf]) -> Result<CleanupReport, InjectError> {
    let destroy_all = session
        .prompter
        .ask("Would you like to remove all files associated with a previous run?")?;
    let report = session.ledger.cleanup(destroy_all, &mut session.prompter)?;
    if !report.removed.is_empty() {
        session.mark_modified();
    }

    for path in control_files {
        let record = session.backup_record(path);
        if !record.exists() {
            info!("No backup of {} found, leaving it alone", path.display());
            continue;
        }
        if destroy_all || session.prompter.ask(&format!("Overwrite {} with backup?", path.display()))? {
            match record.restore() {
                Ok(_) => {
                    session.mark_modified();
                    session.prompter.say(&format!("{} {}", "Restored".green(), path.display()));
                }
                Err(e) => error!("Unable to restore {}: {e}", path.display()),
            }
        }
    }
    Ok(report)
}

/// One adapter per configuration management tool.
// Single-threaded runtime; futures need not be Send.
#[async_trait(?Send)]
pub trait CmBackend {
    fn tool(&self) -> CmTool;

    async fn inject(&self, session: &mut Session) -> Result<InjectSummary, InjectError>;

    async fn cleanup(&self, session: &mut Session) -> Result<CleanupReport, InjectError>;
}

pub fn backend_for(tool: CmTool) -> Box<dyn CmBackend> {
    match tool {
        CmTool::Ansible => Box::new(ansible::Ansible::default()),
        CmTool::Puppet => Box::new(puppet::Puppet::default()),
        CmTool::Salt => Box::new(salt::Salt::default()),
        CmTool::Chef => Box::new(chef::Chef::default()),
    }
}
