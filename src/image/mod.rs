//! Backing images.
//!
//! A backing image is the base root filesystem of one profile. Its paths are
//! derived from the profile name alone:
//!
//! ```text
//! <images_dir>/<name>.img      installed, mountable image
//! <images_dir>/<name>.img.xz   fetched archive
//! <roots_dir>/<name>/          mount point used while updating
//! <image_base_uri>/<name>.img.xz
//! ```
//!
//! Installing an image (fetching and decompressing the archive) is done by a
//! separate initialisation step; this module only tracks and updates it.

mod lock;

pub use lock::ProfileLock;

use scopeguard::ScopeGuard;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{BuilderConfig, IMAGE_COMPRESSED_SUFFIX, IMAGE_SUFFIX};
use crate::error::{BuildError, BuildResult};
use crate::sandbox::{
    mount_api_filesystems, Executor, MountStack, Mounter, PackageManager, SandboxPackageManager,
};

/// The base root filesystem of one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingImage {
    pub name: String,
    /// Installed image.
    pub image_path: PathBuf,
    /// Compressed archive.
    pub archive_path: PathBuf,
    /// Where the archive is published.
    pub uri: String,
    /// Mount point for in-place updates.
    pub root_dir: PathBuf,
}

impl BackingImage {
    /// Derive every path for `name`. Performs no I/O.
    pub fn new(name: &str, config: &BuilderConfig) -> Self {
        Self {
            name: name.to_string(),
            image_path: config.images_dir.join(format!("{name}{IMAGE_SUFFIX}")),
            archive_path: config
                .images_dir
                .join(format!("{name}{IMAGE_COMPRESSED_SUFFIX}")),
            uri: format!(
                "{}/{name}{IMAGE_COMPRESSED_SUFFIX}",
                config.image_base_uri.trim_end_matches('/')
            ),
            root_dir: config.roots_dir.join(name),
        }
    }

    /// Whether the decompressed image exists. Contents are not checked.
    pub fn is_installed(&self) -> bool {
        self.image_path.exists()
    }

    /// Whether the compressed archive exists.
    pub fn is_fetched(&self) -> bool {
        self.archive_path.exists()
    }

    /// Upgrade every package in the image in place.
    ///
    /// The image is loop mounted read-write at [`BackingImage::root_dir`].
    /// If anything fails while it is mounted, the service bus is stopped and
    /// every mount released before the error is returned.
    pub fn update(
        &self,
        config: &BuilderConfig,
        mounter: Arc<dyn Mounter>,
        executor: Arc<dyn Executor>,
    ) -> BuildResult<()> {
        if !self.is_installed() {
            return Err(BuildError::NotInstalled {
                profile: self.name.clone(),
            });
        }
        if !executor.has_privilege() {
            return Err(BuildError::PermissionDenied {
                operation: "update profiles",
            });
        }
        let _lock = ProfileLock::acquire(&config.images_dir, &self.name)?;

        info!(profile = %self.name, image = %self.image_path.display(), "Updating backing image");
        fs::create_dir_all(&self.root_dir)?;

        let mounts = MountStack::default();
        let pman = SandboxPackageManager::new(&self.root_dir, executor);
        let guard = scopeguard::guard((), |()| {
            if let Err(e) = pman.stop_service() {
                error!(error = %e, "Failed to stop system bus");
            }
            mounts.release_all(mounter.as_ref());
        });

        mounts.acquire(&self.root_dir, || {
            mounter.mount_image(&self.image_path, &self.root_dir, false)
        })?;
        mount_api_filesystems(mounter.as_ref(), &self.root_dir, &mounts)?;

        pman.init()?;
        pman.start_service()?;
        pman.upgrade()?;
        pman.stop_service()?;

        // Past this point unmount failures are real errors, not cleanup noise.
        ScopeGuard::into_inner(guard);
        if let Some(e) = mounts.release_all(mounter.as_ref()).into_iter().next() {
            return Err(e);
        }
        nix::unistd::sync();
        info!(profile = %self.name, "Backing image updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, FakeMounter};
    use tempfile::TempDir;

    #[test]
    fn paths_are_derived_from_the_name() {
        let config = BuilderConfig::default();
        let a = BackingImage::new("main-x86_64", &config);
        let b = BackingImage::new("main-x86_64", &config);
        let c = BackingImage::new("unstable-x86_64", &config);

        assert_eq!(a, b);
        assert_eq!(
            a.image_path,
            PathBuf::from("/var/lib/sandbuild/images/main-x86_64.img")
        );
        assert_eq!(
            a.archive_path,
            PathBuf::from("/var/lib/sandbuild/images/main-x86_64.img.xz")
        );
        assert_eq!(
            a.uri,
            "https://solus-project.com/image_root/main-x86_64.img.xz"
        );
        assert_eq!(a.root_dir, PathBuf::from("/var/lib/sandbuild/roots/main-x86_64"));

        assert_ne!(a.image_path, c.image_path);
        assert_ne!(a.archive_path, c.archive_path);
        assert_ne!(a.root_dir, c.root_dir);
    }

    #[test]
    fn unknown_names_construct_without_io() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::rooted_at(temp.path());
        let image = BackingImage::new("bogus", &config);
        assert!(!image.is_installed());
        assert!(!image.is_fetched());
        assert!(!config.images_dir.exists());
    }

    #[test]
    fn installed_and_fetched_are_independent() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::rooted_at(temp.path());
        let image = BackingImage::new("main-x86_64", &config);
        fs::create_dir_all(&config.images_dir).unwrap();

        fs::write(&image.image_path, b"").unwrap();
        assert!(image.is_installed());
        assert!(!image.is_fetched());

        fs::remove_file(&image.image_path).unwrap();
        fs::write(&image.archive_path, b"").unwrap();
        assert!(!image.is_installed());
        assert!(image.is_fetched());
    }

    #[test]
    fn update_requires_installed_image() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::rooted_at(temp.path());
        let image = BackingImage::new("main-x86_64", &config);
        let result = image.update(
            &config,
            Arc::new(FakeMounter::default()),
            Arc::new(FakeExecutor::privileged()),
        );
        assert!(matches!(result, Err(BuildError::NotInstalled { .. })));
    }

    #[test]
    fn update_requires_privilege() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::rooted_at(temp.path());
        let image = BackingImage::new("main-x86_64", &config);
        fs::create_dir_all(&config.images_dir).unwrap();
        fs::write(&image.image_path, b"").unwrap();

        let mounter = Arc::new(FakeMounter::default());
        let result = image.update(&config, mounter.clone(), Arc::new(FakeExecutor::unprivileged()));
        assert!(matches!(result, Err(BuildError::PermissionDenied { .. })));
        assert!(mounter.calls().is_empty());
    }

    #[test]
    fn update_upgrades_read_write_and_unmounts() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::rooted_at(temp.path());
        let image = BackingImage::new("main-x86_64", &config);
        fs::create_dir_all(&config.images_dir).unwrap();
        fs::write(&image.image_path, b"").unwrap();

        let mounter = Arc::new(FakeMounter::default());
        let executor = Arc::new(FakeExecutor::privileged());
        image.update(&config, mounter.clone(), executor.clone()).unwrap();

        assert!(mounter.calls()[0].starts_with("image:rw:"));
        assert!(mounter.active().is_empty());
        assert!(executor.ran("eopkg upgrade -y"));
    }

    #[test]
    fn failed_upgrade_still_unmounts() {
        let temp = TempDir::new().unwrap();
        let config = BuilderConfig::rooted_at(temp.path());
        let image = BackingImage::new("main-x86_64", &config);
        fs::create_dir_all(&config.images_dir).unwrap();
        fs::write(&image.image_path, b"").unwrap();

        let mounter = Arc::new(FakeMounter::default());
        let executor = Arc::new(FakeExecutor::privileged().failing_on("upgrade"));
        let result = image.update(&config, mounter.clone(), executor);

        assert!(matches!(result, Err(BuildError::CommandFailed { .. })));
        assert!(mounter.active().is_empty());
        // The lock is released with the failed update.
        ProfileLock::acquire(&config.images_dir, "main-x86_64").unwrap();
    }
}
