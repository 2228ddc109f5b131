use crate::error::InjectError;
use log::{debug, warn};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tokio::process::Command;

static AGENT_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+\.\w+\.\w+").expect("agent name regex"));
static COOKBOOK_VERSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version regex"));

/// Run a CM tool's own CLI and return its stdout. A spawn failure or a
/// non-zero exit is an `ExternalTool` error carrying stderr.
pub async fn run(bin: &Path, args: &[&str], cwd: Option<&Path>) -> Result<String, InjectError> {
    let tool = bin.display().to_string();
    debug!("Running {tool} {}", args.join(" "));

    let mut command = Command::new(bin);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command
        .output()
        .await
        .map_err(|e| InjectError::tool(&tool, format!("failed to execute: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InjectError::tool(
            &tool,
            format!("exit code {}: {}", output.status.code().unwrap_or(-1), stderr.trim()),
        ));
    }
    Ok(stdout)
}

/// Like [`run`], but a failure is logged as a warning and yields `None`.
pub async fn run_optional(bin: &Path, args: &[&str], cwd: Option<&Path>) -> Option<String> {
    match run(bin, args, cwd).await {
        Ok(out) => Some(out),
        Err(e) => {
            warn!("{e}");
            None
        }
    }
}

/// Fully qualified agent names (`host.domain.tld`) found anywhere in the
/// output, first occurrence order, no duplicates.
pub fn scrape_agent_names(output: &str) -> Vec<String> {
    let names = AGENT_NAME.find_iter(output).map(|m| m.as_str().to_string()).collect();
    crate::utils::dedup_preserving_order(names)
}

/// `knife cookbook list` prints `name version` pairs; keep the names.
pub fn strip_cookbook_versions(output: &str) -> Vec<String> {
    output
        .split_whitespace()
        .filter(|token| !COOKBOOK_VERSION.is_match(token))
        .map(str::to_string)
        .collect()
}

/// Whitespace separated tokens of a listing such as `knife node list`.
pub fn split_listing(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}
