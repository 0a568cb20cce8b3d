//! Build orchestration.
//!
//! [`Builder::build`] validates its inputs, then runs the step plan for the
//! package inside a fresh overlay. From the moment the overlay exists, a
//! [`ReaperGuard`] guarantees it is torn down again: on success, on error,
//! on panic, and on SIGINT/SIGTERM/SIGHUP.
//!
//! ```text
//! validate profile ─► image installed? ─► privileged? ─► parse descriptor ─► lock profile
//!                                                                               │
//!      ┌──────────────────────── ReaperGuard ──────────────────────────────────┤
//!      │ CleanExisting ─► ComposeOverlay ─► ... ─► RunBuild ─► CollectArtifacts  │
//!      └──────────────── stop service bus, unmount, remove ◄───────────────────┘
//! ```

mod artifacts;
mod reaper;
mod steps;

pub use artifacts::{collect, write_manifest, CollectedArtifact, ARTIFACT_EXTENSION};
pub use reaper::{Reaper, ReaperGuard};
pub use steps::{plan, run_steps, BuildContext, Step, StepFn, LEGACY_ISOLATION_WARNING};

use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::BuilderConfig;
use crate::error::{BuildError, BuildResult};
use crate::image::{BackingImage, ProfileLock};
use crate::package::Package;
use crate::sandbox::{
    ChrootExecutor, Executor, Mounter, Overlay, SandboxPackageManager, SystemMounter,
};
use crate::source::{Fetcher, HttpFetcher, SourceCache};

/// What a finished build did.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Steps that completed, in order.
    pub steps: Vec<&'static str>,
    pub warnings: Vec<String>,
    /// Sources that could not be fetched.
    pub fetch_failures: Vec<String>,
    pub artifacts: Vec<CollectedArtifact>,
}

/// Runs builds and image updates against one configuration.
pub struct Builder {
    config: BuilderConfig,
    mounter: Arc<dyn Mounter>,
    executor: Arc<dyn Executor>,
    fetcher: Arc<dyn Fetcher>,
}

impl Builder {
    pub fn new(
        config: BuilderConfig,
        mounter: Arc<dyn Mounter>,
        executor: Arc<dyn Executor>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            mounter,
            executor,
            fetcher,
        }
    }

    /// A builder that mounts, chroots and downloads for real.
    pub fn system(config: BuilderConfig) -> BuildResult<Self> {
        Ok(Self::new(
            config,
            Arc::new(SystemMounter),
            Arc::new(ChrootExecutor),
            Arc::new(HttpFetcher::new()?),
        ))
    }

    /// Upgrade the backing image of `profile` in place.
    pub fn update(&self, profile: &str) -> BuildResult<()> {
        let profile = self.config.profiles.validate(profile)?;
        let image = BackingImage::new(profile.as_str(), &self.config);
        image.update(&self.config, self.mounter.clone(), self.executor.clone())
    }

    /// Build the package described by `descriptor` on `profile`, collecting
    /// artifacts into `output_dir`.
    pub fn build(
        &self,
        profile: &str,
        descriptor: &Path,
        output_dir: &Path,
    ) -> BuildResult<BuildReport> {
        self.execute(profile, descriptor, output_dir, plan)
    }

    fn execute(
        &self,
        profile: &str,
        descriptor: &Path,
        output_dir: &Path,
        plan_for: impl FnOnce(&Package) -> Vec<Step>,
    ) -> BuildResult<BuildReport> {
        let profile = self.config.profiles.validate(profile)?;
        let image = BackingImage::new(profile.as_str(), &self.config);
        if !image.is_installed() {
            return Err(BuildError::NotInstalled {
                profile: profile.to_string(),
            });
        }
        if !self.executor.has_privilege() {
            return Err(BuildError::PermissionDenied {
                operation: "build packages",
            });
        }
        let package = Package::parse(descriptor)?;
        let _lock = ProfileLock::acquire(&self.config.images_dir, profile.as_str())?;

        info!(
            profile = %profile,
            package = %package.name,
            version = %package.version,
            release = package.release,
            format = %package.format,
            "Building package"
        );
        let mut report = BuildReport::default();
        if !package.format.supports_full_sandboxing() {
            warn!(format = %package.format, "{LEGACY_ISOLATION_WARNING}");
            report.warnings.push(LEGACY_ISOLATION_WARNING.to_string());
        }

        let overlay = Arc::new(Overlay::new(
            &image,
            &self.config.cache_dir,
            self.mounter.clone(),
        ));
        let pman = Arc::new(SandboxPackageManager::new(
            &overlay.mount_point,
            self.executor.clone(),
        ));
        let guard = ReaperGuard::install(Arc::new(Reaper::new(overlay.clone(), pman.clone())))?;

        let steps = plan_for(&package);
        let mut ctx = BuildContext {
            config: &self.config,
            profile: &profile,
            package: &package,
            overlay: &overlay,
            package_manager: pman.as_ref(),
            executor: self.executor.as_ref(),
            fetcher: self.fetcher.as_ref(),
            sources: SourceCache::new(&self.config.sources_dir),
            output_dir,
            started_at: OffsetDateTime::now_utc(),
            report,
        };
        let result = run_steps(&steps, &mut ctx);
        drop(guard);
        result?;

        let report = ctx.report;
        info!(
            package = %package.identifier(),
            artifacts = report.artifacts.len(),
            "Build complete"
        );
        Ok(report)
    }
}
