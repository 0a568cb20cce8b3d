//! Preflight checks run before touching any mounts.
//!
//! A build needs a handful of host tools to assemble and enter the sandbox.
//! Checking for them up front turns a half-composed sandbox into a clear
//! message naming what to install.
//!
//! # Example
//!
//! ```rust,ignore
//! use sandbuild::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("chroot") {
//!     println!("coreutils not installed");
//! }
//!
//! check_required_tools(&[("mount", "util-linux")])?;
//! ```

use anyhow::{bail, Result};

/// Check if a command can be found in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools a sandbox build shells out to, as (command, package) pairs.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("chroot", "coreutils"),
];

/// Check that every tool in `tools` is available.
///
/// The error lists each missing command together with the package that
/// provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Check the tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
