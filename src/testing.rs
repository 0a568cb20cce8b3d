//! In-memory stand-ins for the privileged parts of a build.

use anyhow::bail;
use nix::errno::Errno;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::sync::{Arc, Mutex};

use crate::error::{BuildError, BuildResult};
use crate::sandbox::{Executor, Mounter};
use crate::source::Fetcher;

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub(crate) fn sha1_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha1::digest(bytes))
}

/// Run `f` with a plain-text subscriber installed and return what it logged.
pub(crate) fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (value, logs)
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MountState {
    active: Vec<PathBuf>,
    calls: Vec<String>,
    busy: HashMap<PathBuf, u32>,
    stuck: HashSet<PathBuf>,
    attempts: HashMap<PathBuf, u32>,
    unmounted: Vec<PathBuf>,
    detached: Vec<PathBuf>,
    fail_on: Option<String>,
}

/// Tracks mounts without touching the kernel.
#[derive(Default)]
pub(crate) struct FakeMounter {
    state: Mutex<MountState>,
}

impl FakeMounter {
    /// Fail any mount whose target path contains `needle`.
    pub fn failing_on(needle: &str) -> Self {
        let mounter = Self::default();
        mounter.state().fail_on = Some(needle.to_string());
        mounter
    }

    /// Report `EBUSY` for the next `times` unmounts of `target`.
    pub fn set_busy(&self, target: &Path, times: u32) {
        self.state().busy.insert(target.to_path_buf(), times);
    }

    /// Refuse every unmount and detach of `target`.
    pub fn set_stuck(&self, target: &Path) {
        self.state().stuck.insert(target.to_path_buf());
    }

    pub fn active(&self) -> Vec<PathBuf> {
        self.state().active.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn unmount_order(&self) -> Vec<PathBuf> {
        self.state().unmounted.clone()
    }

    pub fn detached(&self) -> Vec<PathBuf> {
        self.state().detached.clone()
    }

    pub fn unmount_attempts(&self, target: &Path) -> u32 {
        self.state().attempts.get(target).copied().unwrap_or(0)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MountState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, kind: String, target: &Path) -> BuildResult<()> {
        let mut state = self.state();
        if let Some(needle) = &state.fail_on {
            if target.to_string_lossy().contains(needle.as_str()) {
                return Err(BuildError::MountFailed {
                    target: target.to_path_buf(),
                    reason: "injected failure".to_string(),
                });
            }
        }
        state.calls.push(format!("{kind} {}", target.display()));
        state.active.push(target.to_path_buf());
        Ok(())
    }
}

impl Mounter for FakeMounter {
    fn mount_image(&self, image: &Path, target: &Path, read_only: bool) -> BuildResult<()> {
        let mode = if read_only { "ro" } else { "rw" };
        self.record(format!("image:{mode}:{}", image.display()), target)
    }

    fn mount_overlay(
        &self,
        lower: &Path,
        _upper: &Path,
        _work: &Path,
        target: &Path,
    ) -> BuildResult<()> {
        self.record(format!("overlay:{}", lower.display()), target)
    }

    fn mount_fs(&self, fstype: &str, target: &Path) -> BuildResult<()> {
        self.record(format!("fs:{fstype}"), target)
    }

    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> BuildResult<()> {
        let mode = if read_only { "ro" } else { "rw" };
        self.record(format!("bind:{mode}:{}", source.display()), target)
    }

    fn unmount(&self, target: &Path) -> Result<(), Errno> {
        let mut state = self.state();
        *state.attempts.entry(target.to_path_buf()).or_insert(0) += 1;
        if state.stuck.contains(target) {
            return Err(Errno::EPERM);
        }
        if let Some(remaining) = state.busy.get_mut(target) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Errno::EBUSY);
            }
        }
        match state.active.iter().rposition(|active| active == target) {
            Some(index) => {
                state.active.remove(index);
                state.unmounted.push(target.to_path_buf());
                Ok(())
            }
            None => Err(Errno::EINVAL),
        }
    }

    fn detach(&self, target: &Path) -> Result<(), Errno> {
        let mut state = self.state();
        if state.stuck.contains(target) {
            return Err(Errno::EPERM);
        }
        match state.active.iter().rposition(|active| active == target) {
            Some(index) => {
                state.active.remove(index);
                state.detached.push(target.to_path_buf());
                Ok(())
            }
            None => Err(Errno::EINVAL),
        }
    }

    fn mounts_under(&self, dir: &Path) -> BuildResult<Vec<PathBuf>> {
        Ok(self
            .state()
            .active
            .iter()
            .filter(|path| path.starts_with(dir))
            .cloned()
            .collect())
    }
}

type CommandHook = Box<dyn Fn(&Path, &str) + Send + Sync>;

/// Records sandbox commands instead of running them.
pub(crate) struct FakeExecutor {
    privileged: bool,
    fail_on: Option<String>,
    hook: Option<CommandHook>,
    commands: Mutex<Vec<String>>,
    network_dropped: AtomicBool,
}

impl FakeExecutor {
    pub fn privileged() -> Self {
        Self {
            privileged: true,
            fail_on: None,
            hook: None,
            commands: Mutex::new(Vec::new()),
            network_dropped: AtomicBool::new(false),
        }
    }

    pub fn unprivileged() -> Self {
        Self {
            privileged: false,
            ..Self::privileged()
        }
    }

    /// Fail any command containing `needle`.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    /// Call `hook` with the root and command before each successful command.
    pub fn with_hook(mut self, hook: impl Fn(&Path, &str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|command| command.contains(needle))
    }

    pub fn network_dropped(&self) -> bool {
        self.network_dropped.load(Ordering::SeqCst)
    }
}

impl Executor for FakeExecutor {
    fn chroot_exec(&self, root: &Path, command: &str) -> BuildResult<()> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());
        if let Some(needle) = &self.fail_on {
            if command.contains(needle.as_str()) {
                return Err(BuildError::CommandFailed {
                    command: command.to_string(),
                    code: Some(1),
                });
            }
        }
        if let Some(hook) = &self.hook {
            hook(root, command);
        }
        Ok(())
    }

    fn has_privilege(&self) -> bool {
        self.privileged
    }

    fn drop_networking(&self) -> BuildResult<()> {
        self.network_dropped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Serves fixed contents per URI and counts requests.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    files: HashMap<String, Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn with_file(mut self, uri: &str, contents: &[u8]) -> Self {
        self.files.insert(uri.to_string(), contents.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, uri: &str, dest: &Path) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(uri.to_string());
        match self.files.get(uri) {
            Some(contents) => {
                fs::write(dest, contents)?;
                Ok(())
            }
            None => bail!("404 Not Found"),
        }
    }
}
