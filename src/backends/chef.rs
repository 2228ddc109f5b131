use super::{cleanup_previous_run, materialize_unit, write_file, CmBackend, InjectSummary, Session, UnitLayout};
use crate::error::InjectError;
use crate::ledger::CleanupReport;
use crate::locator::{self, CmTool, ControlFormat};
use crate::templates::{CHEF_COOKBOOK, CHEF_FILE_COOKBOOK, CHEF_METADATA};
use crate::{tools, utils};
use async_trait::async_trait;
use colored::*;
use log::{info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const CHEF_BIN_DIRS: &[&str] = &["/opt/chef-workstation/bin", "/opt/chefdk/bin", "/opt/chef/bin", "/opt/opscode/bin"];

/// Prefer the workstation's `.chef/cookbooks`, otherwise the first one found.
pub fn preferred_cookbooks(found: &[PathBuf]) -> Option<&PathBuf> {
    found
        .iter()
        .find(|p| p.to_string_lossy().contains(".chef/cookbooks"))
        .or_else(|| found.first())
}

#[derive(Debug, Clone)]
pub struct Chef {
    bin_dirs: Vec<PathBuf>,
    use_path: bool,
}

impl Default for Chef {
    fn default() -> Self {
        Chef {
            bin_dirs: CHEF_BIN_DIRS.iter().map(PathBuf::from).collect(),
            use_path: true,
        }
    }
}

impl Chef {
    fn find(&self, name: &str) -> Option<PathBuf> {
        if self.use_path {
            utils::find_binary(name, &self.bin_dirs)
        } else {
            utils::find_binary_under(name, &self.bin_dirs)
        }
    }

    /// `knife`, or an error explaining why injection cannot happen from this host.
    fn knife(&self) -> Result<PathBuf, InjectError> {
        if let Some(knife) = self.find("knife") {
            info!("Knife binary found at {}", knife.display());
            return Ok(knife);
        }
        if let Some(server) = self.find("chef-server-ctl") {
            return Err(InjectError::tool(
                server.display().to_string(),
                "this host is a Chef server; run from a workstation with knife configured",
            ));
        }
        Err(InjectError::tool("knife", "not found on PATH or under the Chef install directories"))
    }

    /// Agents to add the cookbook to: `--nodes`, an operator pick, or all of them.
    fn select_nodes(&self, session: &mut Session, nodes: &[String]) -> Result<Vec<String>, InjectError> {
        if !session.config.nodes.is_empty() {
            for node in &session.config.nodes {
                if !nodes.contains(node) {
                    warn!("{node} is not a known Chef node");
                }
            }
            return Ok(session.config.nodes.clone());
        }
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        if !session.prompter.ask("Do you want to target specific chef agents?")? {
            return Ok(nodes.to_vec());
        }

        let print_nodes = |out: &mut dyn std::io::Write| -> std::io::Result<()> {
            for (i, node) in nodes.iter().enumerate() {
                writeln!(out, "  [{}] {node}", i.to_string().yellow())?;
            }
            Ok(())
        };
        for (i, node) in nodes.iter().enumerate() {
            session.prompter.say(&format!("  [{}] {node}", i.to_string().yellow()));
        }
        let valid: BTreeSet<usize> = (0..nodes.len()).collect();
        let chosen = session.prompter.ask_indices(
            "Enter the agents to target, separated by commas (q to quit):",
            &valid,
            Some(&print_nodes),
        )?;
        Ok(chosen.into_iter().map(|i| nodes[i].clone()).collect())
    }

    /// Write recipes/default.rb, metadata.rb and the upload under the cookbooks directory.
    fn create_cookbook(&self, session: &mut Session, cookbooks: &Path) -> Result<PathBuf, InjectError> {
        let dir = cookbooks.join(session.payload());
        let layout = UnitLayout {
            body: dir.join("recipes").join("default.rb"),
            files: dir.join("files").join("default"),
            dir,
        };
        materialize_unit(session, &layout, CHEF_COOKBOOK, CHEF_FILE_COOKBOOK)?;
        let metadata = session.templates.render(CHEF_METADATA, &session.fields())?;
        write_file(&layout.dir.join("metadata.rb"), &metadata)?;
        Ok(layout.dir)
    }
}

#[async_trait(?Send)]
impl CmBackend for Chef {
    fn tool(&self) -> CmTool {
        CmTool::Chef
    }

    async fn inject(&self, session: &mut Session) -> Result<InjectSummary, InjectError> {
        let knife = self.knife()?;
        let found = locator::locate(ControlFormat::ChefDirectory, &session.config.search_roots)?;
        let Some(cookbooks) = preferred_cookbooks(&found).cloned() else {
            return Err(InjectError::NotFound {
                what: ControlFormat::ChefDirectory.describe().to_string(),
                roots: String::new(),
            });
        };
        info!("Using cookbooks directory {}", cookbooks.display());

        // targeting needs the node list, so this one is not optional
        let nodes = tools::split_listing(&tools::run(&knife, &["node", "list"], Some(&cookbooks)).await?);
        session.prompter.say(&format!("{} {}", "Chef nodes:".bold(), nodes.join(", ")));
        if let Some(out) = tools::run_optional(&knife, &["cookbook", "list"], Some(&cookbooks)).await {
            let existing = tools::strip_cookbook_versions(&out);
            session.prompter.say(&format!("{} {}", "Existing cookbooks:".bold(), existing.join(", ")));
        }

        let mut summary = InjectSummary::default();
        if session.config.inspect {
            info!("Inspection only, nothing created");
            return Ok(summary);
        }

        let targets = self.select_nodes(session, &nodes)?;
        if targets.is_empty() {
            warn!("No Chef agents to target");
            return Ok(summary);
        }

        let payload = session.payload().to_string();
        let cookbook = self.create_cookbook(session, &cookbooks)?;
        summary.artifacts.push(cookbook);

        tools::run(&knife, &["upload", payload.as_str()], Some(&cookbooks)).await?;
        session.prompter.say(&format!("{} {payload}", "Uploaded cookbook".green()));

        let recipe = format!("recipe[{payload}]");
        for node in &targets {
            let args = ["node", "run_list", "add", node.as_str(), recipe.as_str()];
            match tools::run(&knife, &args, Some(&cookbooks)).await {
                Ok(_) => {
                    summary.references += 1;
                    info!("Added {recipe} to the run_list of {node}");
                }
                Err(e) => {
                    warn!("Unable to add {recipe} to the run_list of {node}: {e}");
                    summary.failures.push(format!("{node}: {e}"));
                }
            }
        }
        if summary.references > 0 {
            summary.control_files.push(cookbooks);
        }
        Ok(summary)
    }

    async fn cleanup(&self, session: &mut Session) -> Result<CleanupReport, InjectError> {
        let payload = session.payload().to_string();
        match self.knife() {
            Ok(knife) => {
                let cwd = locator::locate(ControlFormat::ChefDirectory, &session.config.search_roots)
                    .ok()
                    .and_then(|found| preferred_cookbooks(&found).cloned());
                let recipe = format!("recipe[{payload}]");
                if let Some(out) = tools::run_optional(&knife, &["node", "list"], cwd.as_deref()).await {
                    for node in tools::split_listing(&out) {
                        info!("Removing {recipe} from the run_list of {node}");
                        let args = ["node", "run_list", "remove", node.as_str(), recipe.as_str()];
                        tools::run_optional(&knife, &args, cwd.as_deref()).await;
                    }
                }
                if tools::run_optional(&knife, &["cookbook", "delete", "-y", payload.as_str()], cwd.as_deref())
                    .await
                    .is_some()
                {
                    session.mark_modified();
                    session.prompter.say(&format!("{} {payload}", "Deleted cookbook".green()));
                }
            }
            Err(e) => warn!("Skipping Chef server cleanup: {e}"),
        }
        cleanup_previous_run(session, &[])
    }
}
