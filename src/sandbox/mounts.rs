//! Mount plumbing for sandboxes.
//!
//! [`Mounter`] is the narrow interface the rest of the crate uses to mount
//! and unmount things; [`SystemMounter`] implements it with `nix::mount` and
//! the host `mount` tool for loop images. [`MountStack`] records what one
//! owner acquired so it can be released in reverse order.

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::error::{BuildError, BuildResult};

/// How often an unmount is attempted while the target reports `EBUSY`.
pub const UNMOUNT_ATTEMPTS: u32 = 4;

/// Pause between busy unmount attempts.
pub const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// API filesystems mounted into every sandbox root, in mount order.
pub const API_FILESYSTEMS: &[(&str, &str)] = &[
    ("proc", "proc"),
    ("sysfs", "sys"),
    ("devtmpfs", "dev"),
    ("devpts", "dev/pts"),
];

/// Mount operations needed to build and tear down a sandbox.
pub trait Mounter: Send + Sync {
    /// Loop mount a filesystem image.
    fn mount_image(&self, image: &Path, target: &Path, read_only: bool) -> BuildResult<()>;

    /// Mount an overlay of `lower` and `upper` at `target`.
    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path, target: &Path)
        -> BuildResult<()>;

    /// Mount a kernel filesystem (`proc`, `sysfs`, ...) at `target`.
    fn mount_fs(&self, fstype: &str, target: &Path) -> BuildResult<()>;

    /// Bind mount `source` over `target`.
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> BuildResult<()>;

    /// Unmount `target` once.
    fn unmount(&self, target: &Path) -> Result<(), Errno>;

    /// Lazily detach `target`.
    fn detach(&self, target: &Path) -> Result<(), Errno>;

    /// Every active mount point at or below `dir`.
    fn mounts_under(&self, dir: &Path) -> BuildResult<Vec<PathBuf>>;
}

/// [`Mounter`] backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount_image(&self, image: &Path, target: &Path, read_only: bool) -> BuildResult<()> {
        let options = if read_only { "loop,ro" } else { "loop,rw" };
        debug!(image = %image.display(), target = %target.display(), options, "Mounting image");
        let status = Command::new("mount")
            .args(["-o", options])
            .arg(image)
            .arg(target)
            .status()
            .map_err(|e| BuildError::MountFailed {
                target: target.to_path_buf(),
                reason: format!("running mount: {e}"),
            })?;
        if !status.success() {
            return Err(BuildError::MountFailed {
                target: target.to_path_buf(),
                reason: format!("mount -o {options} exited with {status}"),
            });
        }
        Ok(())
    }

    fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> BuildResult<()> {
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        trace!(options = %options, "Overlay mount options");
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| BuildError::MountFailed {
            target: target.to_path_buf(),
            reason: format!("overlay mount failed: {e}"),
        })
    }

    fn mount_fs(&self, fstype: &str, target: &Path) -> BuildResult<()> {
        let (flags, data) = match fstype {
            "proc" | "sysfs" => (
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None,
            ),
            "devpts" => (
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                Some("gid=5,mode=620"),
            ),
            _ => (MsFlags::MS_NOSUID, None),
        };
        mount(Some(fstype), target, Some(fstype), flags, data).map_err(|e| {
            BuildError::MountFailed {
                target: target.to_path_buf(),
                reason: format!("{fstype} mount failed: {e}"),
            }
        })
    }

    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> BuildResult<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| BuildError::MountFailed {
            target: target.to_path_buf(),
            reason: format!("bind mount of '{}' failed: {e}", source.display()),
        })?;

        if read_only {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| BuildError::MountFailed {
                target: target.to_path_buf(),
                reason: format!("read-only remount failed: {e}"),
            })?;
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), Errno> {
        umount2(target, MntFlags::empty())
    }

    fn detach(&self, target: &Path) -> Result<(), Errno> {
        umount2(target, MntFlags::MNT_DETACH)
    }

    fn mounts_under(&self, dir: &Path) -> BuildResult<Vec<PathBuf>> {
        let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
        Ok(parse_mountinfo(&mountinfo, dir))
    }
}

/// Mount points listed in a `mountinfo` table at or below `dir`, in table
/// order (parents before children).
pub fn parse_mountinfo(mountinfo: &str, dir: &Path) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .filter(|path| path.starts_with(dir))
        .collect()
}

// The kernel escapes space, tab, newline and backslash as three-digit octal.
fn unescape_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Unmount `target`, retrying while it is busy and detaching lazily as a
/// last resort. A target that is not mounted counts as unmounted.
pub fn unmount_with_retry(mounter: &dyn Mounter, target: &Path) -> BuildResult<()> {
    for attempt in 1..=UNMOUNT_ATTEMPTS {
        match mounter.unmount(target) {
            Ok(()) => {
                debug!(target = %target.display(), "Unmounted");
                return Ok(());
            }
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                trace!(target = %target.display(), "Not mounted");
                return Ok(());
            }
            Err(Errno::EBUSY) => {
                debug!(target = %target.display(), attempt, "Mount busy, retrying");
                thread::sleep(UNMOUNT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(BuildError::UnmountFailed {
                    target: target.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
    }

    warn!(target = %target.display(), "Mount still busy, detaching lazily");
    mounter
        .detach(target)
        .map_err(|e| BuildError::UnmountFailed {
            target: target.to_path_buf(),
            reason: format!("lazy unmount failed: {e}"),
        })
}

#[derive(Debug, Default)]
struct StackState {
    targets: Vec<PathBuf>,
    sealed: bool,
}

/// Mounts acquired by one owner, released last-in first-out.
///
/// Once sealed the stack refuses new mounts, so a teardown running on
/// another thread cannot be outrun by a late mount.
#[derive(Debug, Default)]
pub struct MountStack {
    state: Mutex<StackState>,
}

impl MountStack {
    /// Run `mount` and record `target` if it succeeds.
    ///
    /// The stack stays locked for the duration of the mount: a concurrent
    /// [`MountStack::seal`] waits until the new mount is recorded.
    pub fn acquire(
        &self,
        target: &Path,
        mount: impl FnOnce() -> BuildResult<()>,
    ) -> BuildResult<()> {
        let mut state = self.lock();
        if state.sealed {
            return Err(BuildError::MountFailed {
                target: target.to_path_buf(),
                reason: "sandbox is being torn down".to_string(),
            });
        }
        mount()?;
        state.targets.push(target.to_path_buf());
        Ok(())
    }

    /// Refuse every later [`MountStack::acquire`].
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().targets.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().targets.is_empty()
    }

    /// Unmount everything in reverse order of acquisition.
    ///
    /// Failures are logged and returned; every target is attempted and the
    /// stack is empty afterwards.
    pub fn release_all(&self, mounter: &dyn Mounter) -> Vec<BuildError> {
        let targets = std::mem::take(&mut self.lock().targets);
        let mut failures = Vec::new();
        for target in targets.into_iter().rev() {
            if let Err(e) = unmount_with_retry(mounter, &target) {
                error!(target = %target.display(), error = %e, "Failed to unmount");
                failures.push(e);
            }
        }
        failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mount the [`API_FILESYSTEMS`] below `root`, recording each on `stack`.
pub fn mount_api_filesystems(
    mounter: &dyn Mounter,
    root: &Path,
    stack: &MountStack,
) -> BuildResult<()> {
    for (fstype, relative) in API_FILESYSTEMS {
        let target = root.join(relative);
        fs::create_dir_all(&target)?;
        debug!(fstype, target = %target.display(), "Mounting API filesystem");
        stack.acquire(&target, || mounter.mount_fs(fstype, &target))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMounter;

    #[test]
    fn parse_mountinfo_filters_and_unescapes() {
        let table = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 0:35 / /var/cache/sandbuild/main/img ro - ext4 /dev/loop0 ro
41 22 0:36 / /var/cache/sandbuild/main/union rw - overlay overlay rw
42 41 0:5 / /var/cache/sandbuild/main/union/proc rw - proc proc rw
43 22 0:37 / /home/user/my\\040dir rw - tmpfs tmpfs rw
";
        let mounts = parse_mountinfo(table, Path::new("/var/cache/sandbuild/main"));
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/var/cache/sandbuild/main/img"),
                PathBuf::from("/var/cache/sandbuild/main/union"),
                PathBuf::from("/var/cache/sandbuild/main/union/proc"),
            ]
        );

        let spaced = parse_mountinfo(table, Path::new("/home/user"));
        assert_eq!(spaced, vec![PathBuf::from("/home/user/my dir")]);
    }

    #[test]
    fn unmount_retries_busy_targets() {
        let mounter = FakeMounter::default();
        let target = Path::new("/sandbox/union");
        mounter.bind_mount(Path::new("/src"), target, false).unwrap();
        mounter.set_busy(target, 2);

        unmount_with_retry(&mounter, target).unwrap();
        assert!(mounter.active().is_empty());
        assert_eq!(mounter.unmount_attempts(target), 3);
    }

    #[test]
    fn unmount_of_unmounted_target_is_ok() {
        let mounter = FakeMounter::default();
        unmount_with_retry(&mounter, Path::new("/never/mounted")).unwrap();
    }

    #[test]
    fn persistent_busy_falls_back_to_detach() {
        let mounter = FakeMounter::default();
        let target = Path::new("/sandbox/union");
        mounter.bind_mount(Path::new("/src"), target, false).unwrap();
        mounter.set_busy(target, UNMOUNT_ATTEMPTS + 1);

        unmount_with_retry(&mounter, target).unwrap();
        assert!(mounter.active().is_empty());
        assert!(mounter.detached().contains(&target.to_path_buf()));
    }

    #[test]
    fn stack_releases_in_reverse_order() {
        let mounter = FakeMounter::default();
        let stack = MountStack::default();
        for target in ["/r/img", "/r/union", "/r/union/proc"] {
            stack
                .acquire(Path::new(target), || {
                    mounter.bind_mount(Path::new("/src"), Path::new(target), false)
                })
                .unwrap();
        }

        let failures = stack.release_all(&mounter);
        assert!(failures.is_empty());
        assert!(stack.is_empty());
        assert_eq!(
            mounter.unmount_order(),
            vec![
                PathBuf::from("/r/union/proc"),
                PathBuf::from("/r/union"),
                PathBuf::from("/r/img"),
            ]
        );
    }

    #[test]
    fn api_filesystems_are_recorded() {
        let temp = tempfile::TempDir::new().unwrap();
        let mounter = FakeMounter::default();
        let stack = MountStack::default();
        mount_api_filesystems(&mounter, temp.path(), &stack).unwrap();
        assert_eq!(stack.len(), API_FILESYSTEMS.len());
        assert!(temp.path().join("dev/pts").is_dir());
    }

    #[test]
    fn sealed_stack_refuses_new_mounts() {
        let mounter = FakeMounter::default();
        let stack = MountStack::default();
        stack
            .acquire(Path::new("/r/union"), || {
                mounter.bind_mount(Path::new("/src"), Path::new("/r/union"), false)
            })
            .unwrap();

        stack.seal();
        let late = stack.acquire(Path::new("/r/union/src"), || {
            mounter.bind_mount(Path::new("/src"), Path::new("/r/union/src"), true)
        });
        assert!(matches!(late, Err(BuildError::MountFailed { .. })));
        assert_eq!(mounter.active(), vec![PathBuf::from("/r/union")]);

        assert!(stack.release_all(&mounter).is_empty());
        assert!(mounter.active().is_empty());
    }

    #[test]
    fn failed_mount_is_not_recorded() {
        let mounter = FakeMounter::failing_on("proc");
        let stack = MountStack::default();
        let temp = tempfile::TempDir::new().unwrap();
        assert!(mount_api_filesystems(&mounter, temp.path(), &stack).is_err());
        assert!(stack.is_empty());
    }
}
