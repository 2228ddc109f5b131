use crate::cli::TargetOptions;
use crate::error::InjectError;
use crate::locator::CmTool;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_LEDGER: &str = "/tmp/.mose_cleanup";
pub const DEFAULT_REMOTE_UPLOAD_PATH: &str = "/root/.mose_upload";

/// Values read from settings.json. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ansible_backup_loc: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub puppet_backup_loc: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt_backup_loc: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_roots: Option<Vec<PathBuf>>,
}

impl Settings {
    fn backup_loc(&self, tool: CmTool) -> Option<&PathBuf> {
        match tool {
            CmTool::Ansible => self.ansible_backup_loc.as_ref(),
            CmTool::Puppet => self.puppet_backup_loc.as_ref(),
            CmTool::Salt => self.salt_backup_loc.as_ref(),
            CmTool::Chef => None,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Settings, String> {
    match path {
        Some(config_path) => {
            if !config_path.exists() {
                return Err(format!("Settings file not found: {config_path:?}"));
            }

            let config_content = match fs::read_to_string(config_path) {
                Ok(content) => content,
                Err(e) => return Err(format!("Failed to read settings file: {e}")),
            };

            match serde_json::from_str(&config_content) {
                Ok(settings) => {
                    debug!("Loaded settings from {config_path:?}");
                    Ok(settings)
                }
                Err(e) => Err(format!("Failed to parse settings file: {e}")),
            }
        }
        None => {
            debug!("No settings file provided, using defaults");
            Ok(Settings::default())
        }
    }
}

/// Everything one invocation needs, merged once from the CLI and settings.json
/// and then handed to each component by reference.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tool: CmTool,
    pub cmd: Option<String>,
    pub file_upload: Option<PathBuf>,
    pub payload_name: String,
    pub remote_upload_path: String,
    pub ledger_path: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub search_roots: Vec<PathBuf>,
    pub cleanup: bool,
    pub specific: bool,
    pub nodes: Vec<String>,
    pub inspect: bool,
}

impl EngineConfig {
    pub fn build(tool: CmTool, opts: &TargetOptions, settings: &Settings) -> Result<Self, InjectError> {
        if !opts.cleanup && opts.cmd.is_none() && opts.file_upload.is_none() {
            return Err(InjectError::Config(
                "a command (--cmd) or a file to upload (--file-upload) is required".to_string(),
            ));
        }
        if !is_valid_payload_name(&opts.payload_name) {
            return Err(InjectError::Config(format!(
                "payload name '{}' must only contain letters, digits, '_' or '-'",
                opts.payload_name
            )));
        }
        if let Some(upload) = &opts.file_upload {
            if !opts.cleanup && !upload.is_file() {
                return Err(InjectError::Config(format!("file to upload {upload:?} does not exist")));
            }
        }

        let search_roots = if !opts.search_roots.is_empty() {
            opts.search_roots.clone()
        } else if let Some(roots) = &settings.search_roots {
            roots.clone()
        } else {
            tool.default_roots().iter().map(PathBuf::from).collect()
        };

        Ok(EngineConfig {
            tool,
            cmd: opts.cmd.clone(),
            file_upload: opts.file_upload.clone(),
            payload_name: opts.payload_name.clone(),
            remote_upload_path: opts
                .remote_upload_path
                .clone()
                .or_else(|| settings.upload_file_path.clone())
                .unwrap_or_else(|| DEFAULT_REMOTE_UPLOAD_PATH.to_string()),
            ledger_path: settings
                .cleanup_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER)),
            backup_dir: opts.backup_dir.clone().or_else(|| settings.backup_loc(tool).cloned()),
            search_roots,
            cleanup: opts.cleanup,
            specific: opts.specific,
            nodes: opts.nodes.clone(),
            inspect: opts.inspect,
        })
    }

    /// Base name of the uploaded file, as it is referenced inside generated units.
    pub fn upload_file_name(&self) -> Option<String> {
        self.file_upload
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
    }

    /// Short human description of what will run on the nodes.
    pub fn payload_description(&self) -> String {
        match (&self.cmd, self.upload_file_name()) {
            (_, Some(file)) => format!("file {file}"),
            (Some(cmd), None) => format!("command `{cmd}`"),
            (None, None) => "nothing".to_string(),
        }
    }
}

fn is_valid_payload_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
