use crate::backends::{self, InjectSummary, Session};
use crate::cli::TargetOptions;
use crate::config::{EngineConfig, Settings};
use crate::error::InjectError;
use crate::ledger::CleanupReport;
use crate::locator::CmTool;
use crate::prompt::Prompter;
use colored::*;
use log::{error, info};

/// List the supported configuration management targets
pub fn list_targets() -> Result<(), String> {
    println!("\n{}", format!("MOSE v{} - Configuration Management Injection", env!("CARGO_PKG_VERSION")).bold().green());
    println!("\n{}", "Supported Targets".bold().underline());

    for tool in CmTool::all() {
        println!(
            "  {} | {} | Search roots: {}",
            tool.name().yellow(),
            tool.format().describe(),
            tool.default_roots().join(", ")
        );
    }

    println!("\n{}", "Usage:".bold());
    println!("  mose <target> --cmd <command> [--payload-name <name>] [--specific]");
    println!("  mose <target> --file-upload <path> [--remote-upload-path <path>]");
    println!("  mose <target> --cleanup");
    println!("  mose chef --inspect");
    Ok(())
}

/// Inject into (or clean up after) one configuration management tool
pub async fn run_target(tool: CmTool, opts: &TargetOptions, settings: &Settings) -> Result<(), String> {
    let config = EngineConfig::build(tool, opts, settings).map_err(|e| e.to_string())?;
    let backend = backends::backend_for(tool);

    println!("\n{}", "Configuration Management Target".bold().underline());
    println!("{}: {}", "Target".bold(), backend.tool().name().yellow());
    if config.cleanup {
        println!("{}: {}", "Mode".bold(), "cleanup".yellow());
    } else {
        println!("{}: {}", "Payload".bold(), config.payload_description());
        println!("{}: {}", "Unit name".bold(), config.payload_name);
    }
    println!("{}: {}", "Ledger".bold(), config.ledger_path.display());

    let cleanup = config.cleanup;
    let mut session = Session::new(config, Prompter::stdio());

    if cleanup {
        match backend.cleanup(&mut session).await {
            Ok(report) => {
                print_cleanup(&report);
                Ok(())
            }
            Err(e) => fail(e, &session),
        }
    } else {
        match backend.inject(&mut session).await {
            Ok(summary) => print_summary(&summary),
            Err(e) => fail(e, &session),
        }
    }
}

/// A quit before anything was written is a clean exit.
fn fail(e: InjectError, session: &Session) -> Result<(), String> {
    if matches!(e, InjectError::QuitRequested) && !session.mutated() {
        info!("Quit requested before any change");
        println!("\n{}", "Quit requested, nothing was modified".yellow().bold());
        return Ok(());
    }
    error!("{e}");
    println!("\n{}: {e}", "Error".red().bold());
    if session.mutated() {
        println!(
            "{} {}",
            "Changes made so far are recorded in".yellow(),
            session.ledger.path().display()
        );
    }
    Err(e.to_string())
}

fn print_summary(summary: &InjectSummary) -> Result<(), String> {
    println!("\n{}", "Injection Summary".bold().underline());
    println!("References added: {}", summary.references.to_string().green());

    if !summary.control_files.is_empty() {
        println!("\n{}", "Modified:".bold());
        for path in &summary.control_files {
            println!("  - {}", path.display());
        }
    }
    if !summary.artifacts.is_empty() {
        println!("\n{}", "Created Artifacts:".bold());
        for path in &summary.artifacts {
            println!("  - {}", path.display());
        }
    }
    if summary.failures.is_empty() {
        println!("\n{}", "Injection completed".bold().green());
        return Ok(());
    }

    println!("\n{}", "Failed:".bold().red());
    for failure in &summary.failures {
        println!("  - {failure}");
    }
    Err(format!("{} step(s) failed", summary.failures.len()))
}

fn print_cleanup(report: &CleanupReport) {
    println!("\n{}", "Cleanup Summary".bold().underline());
    println!("Removed: {}", report.removed.len().to_string().green());
    println!("Kept: {}", report.kept.len());
    println!(
        "Failed: {}",
        if report.failed.is_empty() {
            "0".normal()
        } else {
            report.failed.len().to_string().red()
        }
    );
    for path in &report.failed {
        println!("  - {}", path.display());
    }
}
