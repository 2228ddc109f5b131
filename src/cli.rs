// mose - configuration management injection engine
// CLI command interface

use crate::locator::CmTool;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mose",
    about = "Inject commands into configuration management control files",
    version,
    long_about = "Locates the authoritative control file of a configuration management tool (Ansible site.yml, Puppet site.pp, Chef cookbooks, Salt top.sls), injects a payload reference so the tool itself distributes it to every managed node, and records every change in a ledger so the run can be reverted with --cleanup. For use on systems you are authorised to assess."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Display debug output
    #[arg(short, long, global = true, default_value_t = false)]
    pub debug: bool,

    /// Disable coloured output
    #[arg(long, global = true, default_value_t = false)]
    pub no_color: bool,

    /// JSON settings file (CleanupFile, *BackupLoc, UploadFilePath, SearchRoots)
    #[arg(short, long, global = true)]
    pub settings: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List supported configuration management targets
    List,

    /// Backdoor Ansible site.yml files and generate a rogue role
    Ansible(TargetOptions),

    /// Backdoor Puppet site.pp manifests and generate a rogue module
    Puppet(TargetOptions),

    /// Backdoor the Salt top.sls and generate a rogue state
    Salt(TargetOptions),

    /// Upload a rogue cookbook from a Chef workstation and add it to node run lists
    Chef(TargetOptions),
}

impl Commands {
    pub fn target(&self) -> Option<(CmTool, &TargetOptions)> {
        match self {
            Commands::List => None,
            Commands::Ansible(opts) => Some((CmTool::Ansible, opts)),
            Commands::Puppet(opts) => Some((CmTool::Puppet, opts)),
            Commands::Salt(opts) => Some((CmTool::Salt, opts)),
            Commands::Chef(opts) => Some((CmTool::Chef, opts)),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct TargetOptions {
    /// Command to run on every managed node
    #[arg(short, long)]
    pub cmd: Option<String>,

    /// Local file to ship with the payload and run on the managed nodes
    #[arg(long)]
    pub file_upload: Option<PathBuf>,

    /// Name of the generated role, module, state or cookbook
    #[arg(short = 'm', long, default_value = "my_cmd")]
    pub payload_name: String,

    /// Where the uploaded file is written on the managed nodes
    #[arg(long)]
    pub remote_upload_path: Option<String>,

    /// Directory to search for control files (repeatable, overrides the defaults)
    #[arg(long = "search-root")]
    pub search_roots: Vec<PathBuf>,

    /// Directory to keep control file backups in
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Revert a previous run using the ledger and backups
    #[arg(long, default_value_t = false)]
    pub cleanup: bool,

    /// Choose individual injection points instead of targeting every node
    #[arg(long, default_value_t = false)]
    pub specific: bool,

    /// Chef nodes to target, skips the interactive agent selection
    #[arg(long, num_args = 1..)]
    pub nodes: Vec<String>,

    /// Chef: only enumerate nodes and cookbooks
    #[arg(long, default_value_t = false)]
    pub inspect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_salt_specific() {
        let cli = Cli::parse_from(["mose", "salt", "-c", "id", "--specific", "-m", "pwn"]);
        let (tool, opts) = cli.command.target().unwrap();
        assert_eq!(tool, CmTool::Salt);
        assert_eq!(opts.cmd.as_deref(), Some("id"));
        assert_eq!(opts.payload_name, "pwn");
        assert!(opts.specific);
        assert!(!opts.cleanup);
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "mose", "chef", "--cleanup", "--nodes", "web1", "db1", "--debug", "--search-root", "/root",
        ]);
        assert!(cli.debug);
        let (tool, opts) = cli.command.target().unwrap();
        assert_eq!(tool, CmTool::Chef);
        assert_eq!(opts.nodes, vec!["web1".to_string(), "db1".to_string()]);
        assert_eq!(opts.search_roots, vec![PathBuf::from("/root")]);
        assert_eq!(opts.payload_name, "my_cmd");
    }

    #[test]
    fn test_list_has_no_target() {
        let cli = Cli::parse_from(["mose", "list"]);
        assert!(cli.command.target().is_none());
    }
}
