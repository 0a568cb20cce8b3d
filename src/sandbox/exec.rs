//! Running commands inside a sandbox root.

use nix::sched::{unshare, CloneFlags};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use crate::error::{BuildError, BuildResult};

const SANDBOX_PATH: &str = "/usr/bin:/usr/sbin:/bin:/sbin";

/// Process-level operations a build performs against its sandbox.
pub trait Executor: Send + Sync {
    /// Run `command` through `/bin/sh -c` with `root` as the root directory.
    fn chroot_exec(&self, root: &Path, command: &str) -> BuildResult<()>;

    /// Whether the caller may mount filesystems and chroot.
    fn has_privilege(&self) -> bool;

    /// Move this process into a fresh network namespace that only has an
    /// unconfigured loopback device. Children inherit it.
    fn drop_networking(&self) -> BuildResult<()>;
}

/// [`Executor`] using the host `chroot` tool and Linux namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChrootExecutor;

impl Executor for ChrootExecutor {
    fn chroot_exec(&self, root: &Path, command: &str) -> BuildResult<()> {
        debug!(root = %root.display(), command, "Running in sandbox");
        let mut cmd = Command::new("chroot");
        cmd.arg(root)
            .args(["/bin/sh", "-c", command])
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", "/root")
            .env("LANG", "C");
        if let Ok(term) = std::env::var("TERM") {
            cmd.env("TERM", term);
        }

        let status = cmd.status()?;
        if !status.success() {
            return Err(BuildError::command_failed(command, status));
        }
        Ok(())
    }

    fn has_privilege(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn drop_networking(&self) -> BuildResult<()> {
        info!("Dropping network access");
        unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|e| anyhow::anyhow!("unsharing network namespace: {e}"))?;
        Ok(())
    }
}
