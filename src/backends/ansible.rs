use super::{
    cleanup_previous_run, key_label, match_owner, materialize_unit, references_unit, unit_refs, CmBackend, FileOutcome,
    InjectSummary, Session, UnitLayout,
};
use crate::error::InjectError;
use crate::ledger::CleanupReport;
use crate::locator::{self, CmTool, ControlFile, ControlFormat};
use crate::planner::{self, InjectionPoint, Plan, Selection, TreeModel};
use crate::templates::{ANSIBLE_FILE_UPLOAD_PLAYBOOK, ANSIBLE_PLAYBOOK};
use crate::utils;
use async_trait::async_trait;
use colored::*;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)*$")
        .expect("hostname regex")
});

/// A single play. Kept as a raw mapping so key order and every key we do
/// not touch survive a write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Play(Mapping);

impl Play {
    fn wildcard(payload: &str) -> Self {
        let mut map = Mapping::new();
        map.insert("name".into(), payload.into());
        map.insert("hosts".into(), "all".into());
        map.insert("become".into(), Value::Bool(true));
        map.insert("roles".into(), Value::Sequence(vec![payload.into()]));
        Play(map)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    /// `hosts:` as written; a list of patterns is joined with commas.
    pub fn hosts(&self) -> Option<String> {
        match self.0.get("hosts")? {
            Value::Sequence(items) => Some(items.iter().map(key_label).collect::<Vec<_>>().join(",")),
            other => Some(key_label(other)),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.hosts().as_deref().map(str::trim), Some("all") | Some("*"))
    }

    /// `import_playbook` / `include` entries pull in other files and have no roles of their own.
    pub fn is_import(&self) -> bool {
        self.0.contains_key("import_playbook") || self.0.contains_key("include")
    }

    fn role_list(&self) -> &[Value] {
        self.0
            .get("roles")
            .and_then(Value::as_sequence)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn role_names(&self) -> Vec<String> {
        unit_refs(self.role_list())
            .iter()
            .map(|r| r.name().unwrap_or("?").to_string())
            .collect()
    }

    pub fn references(&self, role: &str) -> bool {
        references_unit(self.role_list(), role)
    }

    fn add_role(&mut self, role: &str) -> bool {
        if self.references(role) {
            return false;
        }
        match self.0.get_mut("roles") {
            None => {
                self.0.insert("roles".into(), Value::Sequence(vec![role.into()]));
            }
            Some(value) => {
                if value.is_null() {
                    *value = Value::Sequence(vec![role.into()]);
                } else if let Some(list) = value.as_sequence_mut() {
                    list.push(role.into());
                } else {
                    warn!("roles of play {:?} is not a list, leaving it alone", self.name());
                    return false;
                }
            }
        }
        true
    }
}

/// Ordered list of plays from a site file.
#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub plays: Vec<Play>,
}

impl Playbook {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Playbook { plays: Vec::new() });
        }
        let plays: Option<Vec<Play>> = serde_yaml::from_str(text)?;
        Ok(Playbook {
            plays: plays.unwrap_or_default(),
        })
    }
}

impl TreeModel for Playbook {
    type Handle = usize;

    fn plan(&self) -> Plan<usize> {
        let points = self
            .plays
            .iter()
            .enumerate()
            .filter(|(_, play)| !play.is_import())
            .filter_map(|(i, play)| {
                let hosts = play.hosts()?;
                Some(InjectionPoint {
                    label: format!(
                        "Name: {}, Hosts: {hosts}, Roles: [{}]",
                        play.name().unwrap_or("-"),
                        play.role_names().join(", ")
                    ),
                    target: i,
                    is_wildcard: play.is_wildcard(),
                })
            })
            .collect();
        Plan::new(points)
    }

    fn inject(&mut self, handle: &usize, payload: &str) -> bool {
        match self.plays.get_mut(*handle) {
            Some(play) => play.add_role(payload),
            None => false,
        }
    }

    fn add_wildcard_group(&mut self, payload: &str) -> bool {
        self.plays.push(Play::wildcard(payload));
        true
    }

    fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.plays)
    }
}

/// Directories named `roles` that are not nested in a role's tasks or vars.
pub fn find_role_dirs(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_dir() || entry.file_name() != "roles" || locator::is_scratch_artifact(path) {
                continue;
            }
            let nested = path
                .components()
                .any(|c| c.as_os_str() == "tasks" || c.as_os_str() == "vars");
            if !nested && !found.iter().any(|f: &PathBuf| f == path) {
                found.push(path.to_path_buf());
            }
        }
    }
    found
}

pub fn find_ansible_cfg(roots: &[PathBuf]) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == "ansible.cfg")
            .map(|e| e.into_path())
    })
}

/// Inventory files: `inventory =` in ansible.cfg, plus anything with
/// `hosts` in its name under `etc_dir`.
pub fn inventory_files(cfg: Option<&Path>, etc_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(cfg) = cfg {
        if let Ok(content) = fs::read_to_string(cfg) {
            for line in content.lines() {
                let Some((key, value)) = line.split_once('=') else { continue };
                if key.trim() == "inventory" {
                    files.extend(value.split(',').map(|v| PathBuf::from(v.trim())).filter(|p| p.is_file()));
                }
            }
        }
    }
    for entry in WalkDir::new(etc_dir).max_depth(2).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().contains("hosts") {
            let path = entry.into_path();
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

/// Hosts listed in an INI style inventory: lines whose first token is an
/// IPv4 address or a hostname.
pub fn managed_systems(inventory: &str) -> Vec<String> {
    let hosts = inventory
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';') && !l.starts_with('['))
        .filter_map(|l| l.split_whitespace().next())
        .filter(|token| token.parse::<Ipv4Addr>().is_ok() || HOSTNAME.is_match(token))
        .map(str::to_string)
        .collect();
    utils::dedup_preserving_order(hosts)
}

#[derive(Debug, Clone)]
pub struct Ansible {
    inventory_dir: PathBuf,
}

impl Default for Ansible {
    fn default() -> Self {
        Ansible {
            inventory_dir: PathBuf::from("/etc/ansible"),
        }
    }
}

impl Ansible {
    fn report_managed_systems(&self, session: &mut Session, cfg: Option<&Path>) {
        for inventory in inventory_files(cfg, &self.inventory_dir) {
            let Ok(content) = fs::read_to_string(&inventory) else { continue };
            let systems = managed_systems(&content);
            if !systems.is_empty() {
                session.prompter.say(&format!(
                    "{} {}: {}",
                    "Managed systems in".bold(),
                    inventory.display(),
                    systems.join(", ")
                ));
            }
        }
    }

    fn inject_site(&self, session: &mut Session, site: &Path, role_dirs: &[PathBuf]) -> Result<FileOutcome, InjectError> {
        session.prompter.say(&format!("{} {}", "Site file:".bold(), site.display()));
        let control = ControlFile::load(site, ControlFormat::AnsibleYaml)?;
        let mut playbook = Playbook::parse(control.text()?).map_err(|e| InjectError::parse(site, e))?;
        let plan = playbook.plan();
        debug!("{} ({}) has {} injection points", site.display(), control.format.describe(), plan.points.len());

        session.offer_backup(site)?;
        let selection = planner::resolve(&plan, &mut session.prompter, session.config.specific)?;
        if selection == Selection::Points(Vec::new()) {
            info!("Nothing selected in {}", site.display());
            return Ok(FileOutcome::default());
        }

        let payload = session.payload().to_string();
        let owner = utils::owner_of(site);
        let references = planner::apply(&mut playbook, &plan, &selection, &payload);
        if references > 0 {
            let text = playbook.to_yaml().map_err(|e| InjectError::parse(site, e))?;
            fs::write(site, text).map_err(|e| InjectError::io(site, e))?;
            session.mark_modified();
            match_owner(owner, site);
        } else {
            info!("{} already runs {payload}", site.display());
        }

        let fallback;
        let dirs = if role_dirs.is_empty() {
            fallback = [site.parent().unwrap_or(Path::new(".")).join("roles")];
            &fallback[..]
        } else {
            role_dirs
        };

        let mut artifacts = Vec::new();
        for roles in dirs {
            let dir = roles.join(&payload);
            let layout = UnitLayout {
                body: dir.join("tasks").join("main.yml"),
                files: dir.join("files"),
                dir,
            };
            materialize_unit(session, &layout, ANSIBLE_PLAYBOOK, ANSIBLE_FILE_UPLOAD_PLAYBOOK)?;
            match_owner(owner, &layout.dir);
            artifacts.push(layout.dir);
        }
        Ok(FileOutcome { references, artifacts })
    }
}

#[async_trait(?Send)]
impl CmBackend for Ansible {
    fn tool(&self) -> CmTool {
        CmTool::Ansible
    }

    async fn inject(&self, session: &mut Session) -> Result<InjectSummary, InjectError> {
        let roots = session.config.search_roots.clone();
        let sites = locator::locate(ControlFormat::AnsibleYaml, &roots)?;

        let cfg = find_ansible_cfg(&roots);
        match &cfg {
            Some(path) => info!("Found ansible.cfg at {}", path.display()),
            None => debug!("No ansible.cfg found"),
        }
        self.report_managed_systems(session, cfg.as_deref());

        let role_dirs = find_role_dirs(&roots);
        let mut summary = InjectSummary::default();
        for site in &sites {
            let outcome = self.inject_site(session, site, &role_dirs);
            summary.absorb(site, outcome)?;
        }
        Ok(summary)
    }

    async fn cleanup(&self, session: &mut Session) -> Result<CleanupReport, InjectError> {
        let sites = locator::locate(ControlFormat::AnsibleYaml, &session.config.search_roots).unwrap_or_else(|e| {
            info!("{e}");
            Vec::new()
        });
        cleanup_previous_run(session, &sites)
    }
}
