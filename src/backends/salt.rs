use super::{
    cleanup_previous_run, key_label, match_owner, materialize_unit, references_unit, CmBackend, FileOutcome,
    InjectSummary, Session, UnitLayout,
};
use crate::error::InjectError;
use crate::ledger::CleanupReport;
use crate::locator::{self, CmTool, ControlFile, ControlFormat};
use crate::planner::{self, InjectionPoint, Plan, Selection, TreeModel};
use crate::templates::{SALT_FILE_UPLOAD_STATE, SALT_STATE};
use crate::{tools, utils};
use async_trait::async_trait;
use colored::*;
use log::{debug, info, warn};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

const SALT_BIN_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin", "/opt/saltstack/salt"];
const FILE_ROOTS: &str = "file_roots";

/// Coordinates of one host group: environment (fileroot) and target key.
#[derive(Debug, Clone, PartialEq)]
pub struct SaltTarget {
    pub env: Value,
    pub group: Value,
}

fn is_wildcard_key(key: &Value) -> bool {
    matches!(key.as_str(), Some("*") | Some("'*'"))
}

/// A top file: environment -> target -> list of states. Some top files
/// nest all of that under a single `file_roots:` key.
#[derive(Debug, Clone, PartialEq)]
pub struct TopFile {
    root: Mapping,
    wrapped: bool,
}

impl TopFile {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        let root: Mapping = if text.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str::<Option<Mapping>>(text)?.unwrap_or_default()
        };
        let wrapped = root.len() == 1 && root.get(FILE_ROOTS).is_some_and(Value::is_mapping);
        Ok(TopFile { root, wrapped })
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    fn envs(&self) -> Option<&Mapping> {
        if self.wrapped {
            self.root.get(FILE_ROOTS).and_then(Value::as_mapping)
        } else {
            Some(&self.root)
        }
    }

    fn envs_mut(&mut self) -> Option<&mut Mapping> {
        if self.wrapped {
            self.root.get_mut(FILE_ROOTS).and_then(Value::as_mapping_mut)
        } else {
            Some(&mut self.root)
        }
    }

    /// States listed for one target, or `None` if the target does not exist.
    #[cfg(test)]
    pub fn states(&self, env: &str, group: &str) -> Option<Vec<String>> {
        let list = self.envs()?.get(env)?.as_mapping()?.get(group)?;
        Some(
            list.as_sequence()
                .map(|l| super::unit_refs(l).iter().filter_map(|r| r.name().map(str::to_string)).collect())
                .unwrap_or_default(),
        )
    }
}

impl TreeModel for TopFile {
    type Handle = SaltTarget;

    fn plan(&self) -> Plan<SaltTarget> {
        let mut points = Vec::new();
        if let Some(envs) = self.envs() {
            for (env, groups) in envs {
                let Some(groups) = groups.as_mapping() else { continue };
                for (group, _) in groups {
                    points.push(InjectionPoint {
                        label: format!("Fileroot: {} Hosts: {}", key_label(env), key_label(group)),
                        target: SaltTarget {
                            env: env.clone(),
                            group: group.clone(),
                        },
                        is_wildcard: is_wildcard_key(group),
                    });
                }
            }
        }
        Plan::new(points).prefer_wildcard(|t| t.env.as_str() == Some("base"))
    }

    fn inject(&mut self, handle: &SaltTarget, payload: &str) -> bool {
        let Some(states) = self
            .envs_mut()
            .and_then(|envs| envs.get_mut(&handle.env))
            .and_then(Value::as_mapping_mut)
            .and_then(|groups| groups.get_mut(&handle.group))
        else {
            return false;
        };

        if states.is_null() {
            *states = Value::Sequence(vec![payload.into()]);
            return true;
        }
        let Some(list) = states.as_sequence_mut() else {
            warn!("States for {} are not a list, leaving them alone", key_label(&handle.group));
            return false;
        };
        if references_unit(list, payload) {
            return false;
        }
        list.push(payload.into());
        true
    }

    /// Adds `'*': [payload]` to `base`, or to the first environment that
    /// can hold targets. An empty top file gets a fresh `base`.
    fn add_wildcard_group(&mut self, payload: &str) -> bool {
        let Some(envs) = self.envs_mut() else { return false };
        let base = Value::from("base");
        let holds_targets = |v: &Value| v.is_mapping() || v.is_null();
        let env = if envs.is_empty() {
            envs.insert(base.clone(), Value::Mapping(Mapping::new()));
            base
        } else if envs.get(&base).is_some_and(holds_targets) {
            base
        } else {
            match envs.iter().find(|(_, groups)| holds_targets(*groups)) {
                Some((env, _)) => env.clone(),
                None => {
                    warn!("No environment in the top file can hold a '*' target");
                    return false;
                }
            }
        };

        let Some(slot) = envs.get_mut(&env) else { return false };
        if slot.is_null() {
            *slot = Value::Mapping(Mapping::new());
        }
        match slot.as_mapping_mut() {
            Some(groups) => {
                groups.insert("*".into(), Value::Sequence(vec![payload.into()]));
                true
            }
            None => false,
        }
    }

    fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.root)
    }
}

/// Minion ids from `salt-run manage.up` (`- minion1` lines).
pub fn minion_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("- "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Salt {
    bin_dirs: Vec<PathBuf>,
}

impl Default for Salt {
    fn default() -> Self {
        Salt {
            bin_dirs: SALT_BIN_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl Salt {
    async fn list_minions(&self, session: &mut Session) {
        let Some(salt_run) = utils::find_binary("salt-run", &self.bin_dirs) else {
            warn!("salt-run not found, unable to list managed minions");
            return;
        };
        if let Some(out) = tools::run_optional(&salt_run, &["manage.up"], None).await {
            let minions = minion_ids(&out);
            session.prompter.say(&format!("{} {}", "Minions up:".bold(), minions.join(", ")));
        }
    }

    async fn inject_top(&self, session: &mut Session, top: &Path) -> Result<FileOutcome, InjectError> {
        session.prompter.say(&format!("{} {}", "Top file:".bold(), top.display()));
        let control = ControlFile::load(top, ControlFormat::SaltYaml)?;
        let mut top_file = TopFile::parse(control.text()?).map_err(|e| InjectError::parse(top, e))?;
        if top_file.is_wrapped() {
            debug!("{} nests its environments under file_roots", top.display());
        }
        let plan = top_file.plan();

        session.offer_backup(top)?;
        self.list_minions(session).await;
        let selection = planner::resolve(&plan, &mut session.prompter, session.config.specific)?;
        if selection == Selection::Points(Vec::new()) {
            info!("Nothing selected in {}", top.display());
            return Ok(FileOutcome::default());
        }

        let payload = session.payload().to_string();
        let owner = utils::owner_of(top);
        let references = planner::apply(&mut top_file, &plan, &selection, &payload);
        if references > 0 {
            let text = top_file.to_yaml().map_err(|e| InjectError::parse(top, e))?;
            fs::write(top, text).map_err(|e| InjectError::io(top, e))?;
            session.mark_modified();
            match_owner(owner, top);
        } else {
            info!("{} already applies {payload}", top.display());
        }

        let dir = top.parent().unwrap_or(Path::new(".")).join(&payload);
        let layout = UnitLayout {
            body: dir.join("init.sls"),
            files: dir.join("files"),
            dir,
        };
        materialize_unit(session, &layout, SALT_STATE, SALT_FILE_UPLOAD_STATE)?;
        match_owner(owner, &layout.dir);
        Ok(FileOutcome {
            references,
            artifacts: vec![layout.dir],
        })
    }
}

#[async_trait(?Send)]
impl CmBackend for Salt {
    fn tool(&self) -> CmTool {
        CmTool::Salt
    }

    async fn inject(&self, session: &mut Session) -> Result<InjectSummary, InjectError> {
        let tops = locator::locate(ControlFormat::SaltYaml, &session.config.search_roots)?;
        let top = &tops[0];
        if tops.len() > 1 {
            info!("Found {} top files, using {}", tops.len(), top.display());
        }
        let mut summary = InjectSummary::default();
        let outcome = self.inject_top(session, top).await;
        summary.absorb(top, outcome)?;
        Ok(summary)
    }

    async fn cleanup(&self, session: &mut Session) -> Result<CleanupReport, InjectError> {
        let tops: Vec<PathBuf> = locator::locate(ControlFormat::SaltYaml, &session.config.search_roots)
            .map(|t| t.into_iter().take(1).collect())
            .unwrap_or_else(|e| {
                info!("{e}");
                Vec::new()
            });
        cleanup_previous_run(session, &tops)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use tempfile::tempdir;

    const TOP: &str = "\
base:
  '*':
  - webserver
  db:
  - dbserver
  - match: grain
dev:
  '*':
  - tools
";

    fn salt_without_binaries(dir: &Path) -> Salt {
        Salt {
            bin_dirs: vec![dir.join("no-bin")],
        }
    }

    #[test]
    fn test_plan_labels_and_wildcard_preference() {
        let top = TopFile::parse(TOP).unwrap();
        let plan = top.plan();
        let labels = plan.labels();
        assert_eq!(
            labels,
            vec![
                "Fileroot: base Hosts: *",
                "Fileroot: base Hosts: db",
                "Fileroot: dev Hosts: *"
            ]
        );
        assert_eq!(plan.wildcard(), Some(0));
    }

    #[test]
    fn test_base_wildcard_preferred_over_first() {
        let top = TopFile::parse("dev:\n  '*': [tools]\nbase:\n  '*': [web]\n").unwrap();
        let plan = top.plan();
        assert_eq!(plan.wildcard(), Some(1));
    }

    #[test]
    fn test_wildcard_selection_appends_state() {
        let mut top = TopFile::parse("base:\n  '*': [webserver]\n  db: [dbserver]\n").unwrap();
        let plan = top.plan();
        let idx = plan.wildcard().unwrap();
        assert_eq!(planner::apply(&mut top, &plan, &Selection::Wildcard(idx), "my_cmd"), 1);

        let expected = TopFile::parse("base:\n  '*': [webserver, my_cmd]\n  db: [dbserver]\n").unwrap();
        assert_eq!(top, expected);
        assert_eq!(top.states("base", "*"), Some(vec!["webserver".to_string(), "my_cmd".to_string()]));
        assert_eq!(top.states("base", "db"), Some(vec!["dbserver".to_string()]));

        // idempotent
        assert_eq!(planner::apply(&mut top, &plan, &Selection::Wildcard(idx), "my_cmd"), 0);
        assert_eq!(top, expected);
    }

    #[test]
    fn test_synthesized_group_needs_a_mapping_environment() {
        let mut top = TopFile::parse("base:\n- webserver\n").unwrap();
        let before = top.clone();
        let plan = top.plan();
        assert_eq!(planner::apply(&mut top, &plan, &Selection::SynthesizeWildcard, "my_cmd"), 0);
        assert_eq!(top, before);

        let mut top = TopFile::parse("base:\n- webserver\nprod:\n  db: [dbserver]\n").unwrap();
        let plan = top.plan();
        assert_eq!(planner::apply(&mut top, &plan, &Selection::SynthesizeWildcard, "my_cmd"), 1);
        assert_eq!(top.states("prod", "*"), Some(vec!["my_cmd".to_string()]));
        assert_eq!(top.states("prod", "db"), Some(vec!["dbserver".to_string()]));
    }

    #[test]
    fn test_synthesized_group_lands_in_base() {
        let mut top = TopFile::parse("dev:\n  web: [nginx]\nbase:\n  db: [dbserver]\n").unwrap();
        let before = top.clone();
        let plan = top.plan();
        assert_eq!(plan.wildcard(), None);
        planner::apply(&mut top, &plan, &Selection::SynthesizeWildcard, "my_cmd");

        assert_eq!(top.states("base", "*"), Some(vec!["my_cmd".to_string()]));
        assert_eq!(top.states("dev", "web"), before.states("dev", "web"));
        assert_eq!(top.states("base", "db"), before.states("base", "db"));
        assert_eq!(top.plan().points.len(), before.plan().points.len() + 1);
    }

    #[test]
    fn test_file_roots_wrapped_top() {
        let mut top = TopFile::parse("file_roots:\n  base:\n    web: [nginx]\n").unwrap();
        assert!(top.is_wrapped());
        let plan = top.plan();
        assert_eq!(plan.labels(), vec!["Fileroot: base Hosts: web"]);
        planner::apply(&mut top, &plan, &Selection::Points(vec![0]), "my_cmd");

        let reparsed = TopFile::parse(&top.to_yaml().unwrap()).unwrap();
        assert!(reparsed.is_wrapped());
        assert_eq!(reparsed.states("base", "web"), Some(vec!["nginx".to_string(), "my_cmd".to_string()]));
    }

    #[test]
    fn test_round_trip_is_structurally_equal() {
        let top = TopFile::parse(TOP).unwrap();
        let reparsed = TopFile::parse(&top.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, top);
    }

    #[test]
    fn test_null_group_becomes_list() {
        let mut top = TopFile::parse("base:\n  web:\n").unwrap();
        let plan = top.plan();
        assert!(top.inject(&plan.points[0].target, "my_cmd"));
        assert_eq!(top.states("base", "web"), Some(vec!["my_cmd".to_string()]));
    }

    #[test]
    fn test_minion_ids() {
        assert_eq!(minion_ids("- web01\n- db01\n"), vec!["web01", "db01"]);
        assert!(minion_ids("").is_empty());
    }

    #[tokio::test]
    async fn test_inject_specific_group_end_to_end() {
        let dir = tempdir().unwrap();
        let top_path = dir.path().join("top.sls");
        fs::write(&top_path, TOP).unwrap();

        // no backup, pick base/db by index
        let mut session = testing::session(CmTool::Salt, dir.path(), "n\n1\n", |o| o.specific = true);
        let backend = salt_without_binaries(dir.path());
        let summary = backend.inject(&mut session).await.unwrap();
        assert_eq!(summary.references, 1);

        let written = TopFile::parse(&fs::read_to_string(&top_path).unwrap()).unwrap();
        assert_eq!(
            written.states("base", "db"),
            Some(vec!["dbserver".to_string(), "my_cmd".to_string()])
        );
        assert_eq!(written.states("base", "*"), Some(vec!["webserver".to_string()]));

        let state = fs::read_to_string(dir.path().join("my_cmd").join("init.sls")).unwrap();
        assert!(state.contains("- name: \"touch /tmp/mose_test\""));
        assert_eq!(session.ledger.entries().unwrap(), vec![dir.path().join("my_cmd")]);
    }
}
