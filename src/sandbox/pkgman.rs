//! Driving the package manager inside a sandbox root.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::exec::Executor;
use crate::error::BuildResult;

/// Component that carries the compiler toolchain.
pub const DEVEL_COMPONENT: &str = "system.devel";

/// PID file of the system bus, relative to the sandbox root.
const DBUS_PID_FILE: &str = "run/dbus/pid";

/// Operations a build needs from the in-sandbox package manager.
///
/// Each call blocks until the command inside the root exits.
pub trait PackageManager: Send + Sync {
    /// Bootstrap the package database.
    fn init(&self) -> BuildResult<()>;
    /// Start the system bus the package manager talks to.
    fn start_service(&self) -> BuildResult<()>;
    /// Stop the system bus. A no-op unless it was started.
    fn stop_service(&self) -> BuildResult<()>;
    fn upgrade(&self) -> BuildResult<()>;
    fn install_component(&self, name: &str) -> BuildResult<()>;
    /// Install the build dependencies declared by `descriptor`, a path
    /// inside the root.
    fn install_declared_dependencies(&self, descriptor: &Path) -> BuildResult<()>;
}

/// [`PackageManager`] running `eopkg` in a chroot.
pub struct SandboxPackageManager {
    root: PathBuf,
    executor: Arc<dyn Executor>,
    service_running: AtomicBool,
}

impl SandboxPackageManager {
    pub fn new(root: impl Into<PathBuf>, executor: Arc<dyn Executor>) -> Self {
        Self {
            root: root.into(),
            executor,
            service_running: AtomicBool::new(false),
        }
    }

    fn run(&self, command: &str) -> BuildResult<()> {
        self.executor.chroot_exec(&self.root, command)
    }
}

impl PackageManager for SandboxPackageManager {
    fn init(&self) -> BuildResult<()> {
        info!(root = %self.root.display(), "Initialising package manager");
        self.run("dbus-uuidgen --ensure")?;
        self.run("eopkg configure-pending")
    }

    fn start_service(&self) -> BuildResult<()> {
        info!("Starting system bus");
        fs::create_dir_all(self.root.join("run/dbus"))?;
        let _ = fs::remove_file(self.root.join(DBUS_PID_FILE));
        self.run("dbus-daemon --system")?;
        self.service_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_service(&self) -> BuildResult<()> {
        if !self.service_running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping system bus");

        let pid_file = self.root.join(DBUS_PID_FILE);
        let contents = match fs::read_to_string(&pid_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(pid_file = %pid_file.display(), "System bus pid file missing");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let pid: i32 = contents.trim().parse().map_err(|e| {
            anyhow::anyhow!("invalid pid in '{}': {e}", pid_file.display())
        })?;

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(anyhow::anyhow!("stopping system bus (pid {pid}): {e}").into()),
        }
        debug!(pid, "Signalled system bus");
        fs::remove_file(&pid_file)?;
        Ok(())
    }

    fn upgrade(&self) -> BuildResult<()> {
        info!("Upgrading base packages");
        self.run("eopkg upgrade -y")
    }

    fn install_component(&self, name: &str) -> BuildResult<()> {
        info!(component = name, "Installing component");
        self.run(&format!("eopkg install -c {name} -y"))
    }

    fn install_declared_dependencies(&self, descriptor: &Path) -> BuildResult<()> {
        info!(descriptor = %descriptor.display(), "Installing build dependencies");
        self.run(&format!("ypkg-install-deps -f {}", descriptor.display()))
    }
}
