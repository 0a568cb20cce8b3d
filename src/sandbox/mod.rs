//! Sandbox plumbing: mounts, command execution, the overlay root and the
//! package manager running inside it.

mod exec;
mod mounts;
mod overlay;
mod pkgman;

pub use exec::{ChrootExecutor, Executor};
pub use mounts::{
    mount_api_filesystems, parse_mountinfo, unmount_with_retry, MountStack, Mounter,
    SystemMounter, API_FILESYSTEMS, UNMOUNT_ATTEMPTS,
};
pub use overlay::{Overlay, PACKAGE_CACHE_TARGET};
pub use pkgman::{PackageManager, SandboxPackageManager, DEVEL_COMPONENT};
