use super::{cleanup_previous_run, match_owner, materialize_unit, CmBackend, FileOutcome, InjectSummary, Session, UnitLayout};
use crate::error::InjectError;
use crate::ledger::CleanupReport;
use crate::locator::{self, CmTool, ControlFile, ControlFormat};
use crate::templates::{PUPPET_FILE_UPLOAD_MODULE, PUPPET_MODULE};
use crate::{tools, utils};
use async_trait::async_trait;
use colored::*;
use log::{debug, info, warn};
use regex::{NoExpand, Regex};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#.*").expect("comment regex"));
static BRACE_BEFORE_NODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"}\s*?node\b").expect("node anchor regex"));
static FINAL_BRACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"}\s*?$").expect("final brace regex"));

const PUPPET_BIN_DIRS: &[&str] = &["/opt/puppetlabs/bin", "/opt/puppetlabs/server/bin"];

/// Whether the manifest already has `include <module>` on a line of its own.
pub fn includes(manifest: &str, module: &str) -> bool {
    COMMENT.replace_all(manifest, "").lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.next() == Some("include") && tokens.next() == Some(module) && tokens.next().is_none()
    })
}

/// Insert `include <module>` before the closing brace of every block that
/// is followed by a `node` block, and before the last closing brace of the
/// file. Comments are stripped first. When neither anchor is found the
/// include is appended at the end.
///
/// Returns `None` when the manifest already includes the module.
pub fn inject_include(manifest: &str, module: &str) -> Option<String> {
    if includes(manifest, module) {
        return None;
    }
    let stripped = COMMENT.replace_all(manifest, "");
    if !BRACE_BEFORE_NODE.is_match(&stripped) && !FINAL_BRACE.is_match(&stripped) {
        debug!("No anchor found, appending include {module}");
        let mut out = stripped.into_owned();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("include {module}\n"));
        return Some(out);
    }

    let line = format!("  include {module}\n");
    let with_nodes = BRACE_BEFORE_NODE.replace_all(&stripped, NoExpand(&format!("{line}}}\nnode")));
    let out = FINAL_BRACE.replace(&with_nodes, NoExpand(&format!("{line}}}\n")));
    Some(out.into_owned())
}

/// `<code dir>/modules` for a manifest at `<code dir>/manifests/site.pp`.
pub fn modules_dir(manifest: &Path) -> PathBuf {
    let manifests = manifest.parent().unwrap_or(Path::new("."));
    manifests.parent().unwrap_or(manifests).join("modules")
}

/// Module names from `puppet module list --render-as json`.
pub fn module_names(json: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    if let Some(by_path) = value.get("modules_by_path").and_then(|v| v.as_object()) {
        for modules in by_path.values().filter_map(|v| v.as_array()) {
            for module in modules {
                let name = module
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| module.get("forge_name").and_then(|n| n.as_str()).map(str::to_string));
                names.extend(name);
            }
        }
    }
    names
}

#[derive(Debug, Clone)]
pub struct Puppet {
    bin_dirs: Vec<PathBuf>,
}

impl Default for Puppet {
    fn default() -> Self {
        Puppet {
            bin_dirs: PUPPET_BIN_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl Puppet {
    async fn list_modules(&self, session: &mut Session, modules: &Path) {
        let Some(puppet) = utils::find_binary("puppet", &self.bin_dirs) else {
            debug!("puppet binary not found, not listing modules");
            return;
        };
        let dir = modules.to_string_lossy().to_string();
        let args = ["module", "list", "--modulepath", dir.as_str(), "--render-as", "json"];
        if let Some(out) = tools::run_optional(&puppet, &args, None).await {
            let names = module_names(&out);
            if !names.is_empty() {
                session.prompter.say(&format!("{} {}", "Existing modules:".bold(), names.join(", ")));
            }
        }
    }

    /// Agents known to the CA, via `puppet cert list -a` or `puppetserver ca list --all`.
    async fn list_agents(&self, session: &mut Session) {
        let mut output = None;
        if let Some(puppet) = utils::find_binary("puppet", &self.bin_dirs) {
            output = tools::run_optional(&puppet, &["cert", "list", "-a"], None).await;
        }
        if output.is_none() {
            if let Some(server) = utils::find_binary("puppetserver", &self.bin_dirs) {
                output = tools::run_optional(&server, &["ca", "list", "--all"], None).await;
            }
        }
        match output {
            Some(out) => {
                let agents = tools::scrape_agent_names(&out);
                session.prompter.say(&format!("{} {}", "Puppet agents:".bold(), agents.join(", ")));
            }
            None => warn!("Unable to enumerate Puppet agents"),
        }
    }

    async fn inject_manifest(&self, session: &mut Session, manifest: &Path) -> Result<FileOutcome, InjectError> {
        session.prompter.say(&format!("{} {}", "Manifest:".bold(), manifest.display()));
        let control = ControlFile::load(manifest, ControlFormat::PuppetManifest)?;
        let text = control.text()?;
        let payload = session.payload().to_string();
        let owner = utils::owner_of(manifest);

        session.offer_backup(manifest)?;
        let references = match inject_include(text, &payload) {
            Some(updated) => {
                fs::write(manifest, updated).map_err(|e| InjectError::io(manifest, e))?;
                session.mark_modified();
                match_owner(owner, manifest);
                info!("Added include {payload} to {}", manifest.display());
                1
            }
            None => {
                info!("{} already includes {payload}", manifest.display());
                0
            }
        };

        let modules = modules_dir(manifest);
        self.list_modules(session, &modules).await;

        let dir = modules.join(&payload);
        let layout = UnitLayout {
            body: dir.join("manifests").join("init.pp"),
            files: dir.join("files"),
            dir,
        };
        materialize_unit(session, &layout, PUPPET_MODULE, PUPPET_FILE_UPLOAD_MODULE)?;
        match_owner(owner, &layout.dir);

        Ok(FileOutcome {
            references,
            artifacts: vec![layout.dir],
        })
    }
}

#[async_trait(?Send)]
impl CmBackend for Puppet {
    fn tool(&self) -> CmTool {
        CmTool::Puppet
    }

    async fn inject(&self, session: &mut Session) -> Result<InjectSummary, InjectError> {
        let manifests = locator::locate(ControlFormat::PuppetManifest, &session.config.search_roots)?;
        let mut summary = InjectSummary::default();
        for manifest in &manifests {
            let outcome = self.inject_manifest(session, manifest).await;
            summary.absorb(manifest, outcome)?;
        }
        self.list_agents(session).await;
        Ok(summary)
    }

    async fn cleanup(&self, session: &mut Session) -> Result<CleanupReport, InjectError> {
        let manifests = locator::locate(ControlFormat::PuppetManifest, &session.config.search_roots)
            .unwrap_or_else(|e| {
                info!("{e}");
                Vec::new()
            });
        cleanup_previous_run(session, &manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use tempfile::tempdir;

    fn no_binaries(dir: &Path) -> Puppet {
        Puppet {
            bin_dirs: vec![dir.join("no-bin")],
        }
    }

    #[test]
    fn test_default_block_gets_include_before_final_brace() {
        let manifest = "node default {\n  include base\n}\n";
        assert_eq!(
            inject_include(manifest, "my_cmd").unwrap(),
            "node default {\n  include base\n  include my_cmd\n}\n"
        );
    }

    #[test]
    fn test_every_node_block_gets_include() {
        let manifest = "\
node 'web01.corp.local' {
  include nginx # frontend
}

node default {
  include base
}
";
        let out = inject_include(manifest, "my_cmd").unwrap();
        assert_eq!(out.matches("include my_cmd").count(), 2);
        assert!(!out.contains("frontend"));
        assert!(out.contains("  include nginx \n  include my_cmd\n}\nnode default {"));
        assert!(out.ends_with("  include base\n  include my_cmd\n}\n"));
    }

    #[test]
    fn test_no_braces_appends() {
        assert_eq!(inject_include("include base", "my_cmd").unwrap(), "include base\ninclude my_cmd\n");
        assert_eq!(inject_include("", "my_cmd").unwrap(), "include my_cmd\n");
    }

    #[test]
    fn test_text_after_last_brace_appends() {
        let manifest = "class base {\n  package { 'ntp': }\n}\ninclude base\n";
        assert_eq!(
            inject_include(manifest, "my_cmd").unwrap(),
            "class base {\n  package { 'ntp': }\n}\ninclude base\ninclude my_cmd\n"
        );
    }

    #[test]
    fn test_already_included_is_left_alone() {
        let manifest = "node default {\n  include base\n  include my_cmd\n}\n";
        assert!(inject_include(manifest, "my_cmd").is_none());
        // commented out does not count
        assert!(inject_include("node default {\n  # include my_cmd\n}\n", "my_cmd").is_some());
        // a module with a longer name does not count
        assert!(!includes("include my_cmd_two\n", "my_cmd"));
    }

    #[test]
    fn test_modules_dir_sits_next_to_manifests() {
        let dir = modules_dir(Path::new("/etc/puppetlabs/code/environments/production/manifests/site.pp"));
        assert_eq!(dir, PathBuf::from("/etc/puppetlabs/code/environments/production/modules"));
    }

    #[test]
    fn test_module_names_from_json() {
        let json = r#"{"modules_by_path":{"/etc/puppetlabs/code/modules":["puppetlabs-stdlib (v9.4.1)",{"forge_name":"puppetlabs/ntp"}]}}"#;
        assert_eq!(module_names(json), vec!["puppetlabs-stdlib (v9.4.1)", "puppetlabs/ntp"]);
        assert!(module_names("not json").is_empty());
    }

    #[tokio::test]
    async fn test_inject_every_manifest_and_revert() {
        let dir = tempdir().unwrap();
        let mut sites = Vec::new();
        for env in ["production", "staging"] {
            let manifests = dir.path().join(env).join("manifests");
            fs::create_dir_all(&manifests).unwrap();
            let site = manifests.join("site.pp");
            fs::write(&site, "node default {\n  include base\n}\n").unwrap();
            sites.push(site);
        }

        // backup each manifest
        let mut session = testing::session(CmTool::Puppet, dir.path(), "Y\nY\n", |_| {});
        let backend = no_binaries(dir.path());
        let summary = backend.inject(&mut session).await.unwrap();
        assert_eq!(summary.references, 2);
        assert_eq!(summary.control_files, sites);

        for env in ["production", "staging"] {
            let module = dir.path().join(env).join("modules").join("my_cmd");
            let init = fs::read_to_string(module.join("manifests").join("init.pp")).unwrap();
            assert!(init.starts_with("class my_cmd {"));
            assert!(init.contains("command => 'touch /tmp/mose_test',"));
        }

        // second run: no new includes, no backup prompt answers needed beyond "n"
        let mut again = testing::session(CmTool::Puppet, dir.path(), "n\nn\n", |_| {});
        let summary = backend.inject(&mut again).await.unwrap();
        assert_eq!(summary.references, 0);
        assert_eq!(fs::read_to_string(&sites[0]).unwrap().matches("include my_cmd").count(), 1);

        let mut cleanup = testing::session(CmTool::Puppet, dir.path(), "Y\n", |o| o.cleanup = true);
        backend.cleanup(&mut cleanup).await.unwrap();
        for site in &sites {
            assert_eq!(fs::read_to_string(site).unwrap(), "node default {\n  include base\n}\n");
        }
        assert!(!dir.path().join("production").join("modules").join("my_cmd").exists());
    }
}
