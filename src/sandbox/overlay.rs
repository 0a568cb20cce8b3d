//! Per-build overlay roots.
//!
//! Layout under `<cache_dir>/<profile>/`:
//!
//! ```text
//! img/    backing image, loop mounted read-only (lowerdir)
//! tmp/    ephemeral writable layer (upperdir)
//! work/   overlayfs scratch (workdir)
//! union/  merged root the build runs in
//! ```
//!
//! Everything under the base directory belongs to exactly one build and is
//! removed when the build ends.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::exec::Executor;
use super::mounts::{mount_api_filesystems, unmount_with_retry, MountStack, Mounter};
use crate::error::{BuildError, BuildResult};
use crate::image::BackingImage;

/// Where the host package cache appears inside the sandbox.
pub const PACKAGE_CACHE_TARGET: &str = "var/cache/eopkg/packages";

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

const LOOPBACK_HOSTS: &str = "\
127.0.0.1\tlocalhost
::1\tlocalhost ip6-localhost ip6-loopback
";

/// The layered root of one build.
pub struct Overlay {
    profile: String,
    image_path: PathBuf,
    pub base_dir: PathBuf,
    pub img_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub mount_point: PathBuf,
    mounts: MountStack,
    mounter: Arc<dyn Mounter>,
}

impl Overlay {
    /// Describe the overlay for `image`. Nothing is created until
    /// [`Overlay::compose`].
    pub fn new(image: &BackingImage, cache_dir: &Path, mounter: Arc<dyn Mounter>) -> Self {
        let base_dir = cache_dir.join(&image.name);
        Self {
            profile: image.name.clone(),
            image_path: image.image_path.clone(),
            img_dir: base_dir.join("img"),
            upper_dir: base_dir.join("tmp"),
            work_dir: base_dir.join("work"),
            mount_point: base_dir.join("union"),
            base_dir,
            mounts: MountStack::default(),
            mounter,
        }
    }

    /// Tear down whatever a previous, crashed build left for this profile.
    pub fn clean_existing(&self) -> BuildResult<()> {
        if self.base_dir.exists() {
            info!(profile = %self.profile, base = %self.base_dir.display(), "Removing stale overlay");
        }
        self.release()
    }

    /// Mount the backing image and the overlay on top of it.
    pub fn compose(&self) -> BuildResult<()> {
        for dir in [&self.img_dir, &self.upper_dir, &self.work_dir, &self.mount_point] {
            fs::create_dir_all(dir)?;
        }

        info!(profile = %self.profile, target = %self.mount_point.display(), "Composing overlay");
        self.mounts.acquire(&self.img_dir, || {
            self.mounter
                .mount_image(&self.image_path, &self.img_dir, true)
        })?;
        self.mounts.acquire(&self.mount_point, || {
            self.mounter.mount_overlay(
                &self.img_dir,
                &self.upper_dir,
                &self.work_dir,
                &self.mount_point,
            )
        })
    }

    /// Make the merged root usable for chroot: API filesystems, the shared
    /// package cache, and name resolution.
    pub fn activate_root(&self, packages_dir: &Path) -> BuildResult<()> {
        debug!(root = %self.mount_point.display(), "Activating root");
        mount_api_filesystems(self.mounter.as_ref(), &self.mount_point, &self.mounts)?;

        fs::create_dir_all(packages_dir)?;
        let cache_target = self.mount_point.join(PACKAGE_CACHE_TARGET);
        fs::create_dir_all(&cache_target)?;
        self.bind(packages_dir, &cache_target, false)?;

        let resolv = Path::new(HOST_RESOLV_CONF);
        if resolv.is_file() {
            let etc = self.mount_point.join("etc");
            fs::create_dir_all(&etc)?;
            let dest = etc.join("resolv.conf");
            // The base image may ship a dangling symlink here.
            if dest.is_symlink() {
                fs::remove_file(&dest)?;
            }
            fs::copy(resolv, &dest)?;
        }
        Ok(())
    }

    /// Bind mount `source` at `target` and track it for teardown.
    pub fn bind(&self, source: &Path, target: &Path, read_only: bool) -> BuildResult<()> {
        debug!(source = %source.display(), target = %target.display(), read_only, "Binding");
        self.mounts
            .acquire(target, || self.mounter.bind_mount(source, target, read_only))
    }

    /// Restrict the sandbox to loopback networking. The network namespace
    /// must already have been dropped.
    pub fn configure_networking(&self, executor: &dyn Executor) -> BuildResult<()> {
        debug!(root = %self.mount_point.display(), "Configuring loopback networking");
        let etc = self.mount_point.join("etc");
        fs::create_dir_all(&etc)?;
        let hosts = etc.join("hosts");
        if hosts.is_symlink() {
            fs::remove_file(&hosts)?;
        }
        fs::write(&hosts, LOOPBACK_HOSTS)?;
        executor.chroot_exec(&self.mount_point, "ip link set lo up")
    }

    /// Unmount everything and remove the ephemeral directories.
    ///
    /// Safe to call repeatedly and after a partial [`Overlay::compose`].
    /// Directories are only removed once nothing is mounted below them.
    pub fn decompose(&self) -> BuildResult<()> {
        debug!(profile = %self.profile, "Decomposing overlay");
        self.release()
    }

    /// Refuse every later mount. A mount already in progress on another
    /// thread is recorded first, so the next [`Overlay::decompose`] sees it.
    pub fn seal(&self) {
        self.mounts.seal();
    }

    #[cfg(test)]
    pub fn is_composed(&self) -> bool {
        !self.mounts.is_empty()
    }

    fn release(&self) -> BuildResult<()> {
        let mut failures = self.mounts.release_all(self.mounter.as_ref());

        // Anything still mounted below the base was not acquired by us (a
        // crashed build) or survived the first pass. Deepest first.
        let mut leftover = self.mounter.mounts_under(&self.base_dir)?;
        leftover.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
        for target in &leftover {
            warn!(target = %target.display(), "Unmounting leftover mount");
            if let Err(e) = unmount_with_retry(self.mounter.as_ref(), target) {
                error!(target = %target.display(), error = %e, "Failed to unmount leftover");
                failures.push(e);
            }
        }

        let remaining = self.mounter.mounts_under(&self.base_dir)?;
        if let Some(target) = remaining.into_iter().next() {
            error!(
                base = %self.base_dir.display(),
                target = %target.display(),
                "Refusing to remove overlay directories while mounts remain"
            );
            return Err(failures
                .into_iter()
                .next()
                .unwrap_or(BuildError::UnmountFailed {
                    target,
                    reason: "still mounted".to_string(),
                }));
        }

        if self.base_dir.exists() {
            fs::remove_dir_all(&self.base_dir)?;
        }
        Ok(())
    }
}
