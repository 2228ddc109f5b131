use crate::utils;
use log::{debug, warn};
use std::path::Path;

/// Preflight checks before touching any control file. Nothing here blocks
/// the run; problems are reported so the operator knows what to expect.
pub fn check_environment() -> Result<(), String> {
    debug!("Performing preflight checks on {}", utils::hostname());

    if !utils::is_root() {
        warn!("Not running as root: control files and CM tool state owned by root may not be writable");
    }

    check_for_running_agents();

    debug!("Preflight checks passed");
    Ok(())
}

/// Lock and pid files of CM daemons or agents that are mid-run.
fn check_for_running_agents() {
    let lock_files = [
        "/opt/puppetlabs/puppet/cache/state/agent_catalog_run.lock",
        "/var/run/salt-master.pid",
        "/var/chef/cache/chef-client-running.pid",
    ];

    for path in &lock_files {
        if Path::new(path).exists() {
            warn!("Detected CM agent activity: {path}");
        }
    }
}
