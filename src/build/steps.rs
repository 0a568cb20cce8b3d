//! The ordered steps of one build attempt.
//!
//! Every step has the same shape, `fn(&mut BuildContext) -> BuildResult<()>`,
//! and [`run_steps`] stops at the first failure. Which steps run, and in
//! what order, is decided once per package by [`plan`].

use std::fs;
use std::path::Path;
use time::OffsetDateTime;
use tracing::{error, info};

use super::artifacts;
use super::BuildReport;
use crate::config::BuilderConfig;
use crate::error::{BuildError, BuildResult};
use crate::package::{host_path, Package, BUILD_USER, BUILD_USER_HOME};
use crate::profile::Profile;
use crate::sandbox::{Executor, Overlay, PackageManager, DEVEL_COMPONENT};
use crate::source::{Fetcher, SourceCache};

/// Warning recorded for packages that cannot be fully isolated.
pub const LEGACY_ISOLATION_WARNING: &str = "Full sandboxing is not possible with legacy format";

/// Everything a step may touch.
pub struct BuildContext<'a> {
    pub config: &'a BuilderConfig,
    pub profile: &'a Profile,
    pub package: &'a Package,
    pub overlay: &'a Overlay,
    pub package_manager: &'a dyn PackageManager,
    pub executor: &'a dyn Executor,
    pub fetcher: &'a dyn Fetcher,
    pub sources: SourceCache,
    pub output_dir: &'a Path,
    pub started_at: OffsetDateTime,
    pub report: BuildReport,
}

pub type StepFn = fn(&mut BuildContext<'_>) -> BuildResult<()>;

/// A named unit of the build.
#[derive(Clone, Copy)]
pub struct Step {
    pub name: &'static str,
    pub run: StepFn,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

const fn step(name: &'static str, run: StepFn) -> Step {
    Step { name, run }
}

const PREPARE: &[Step] = &[
    step("CleanExisting", clean_existing),
    step("ComposeOverlay", compose_overlay),
    step("ActivateRoot", activate_root),
    step("CopyAssets", copy_assets),
    step("FetchSources", fetch_sources),
    step("InitPackageManager", init_package_manager),
    step("StartServiceBus", start_service_bus),
    step("UpgradeBase", upgrade_base),
    step("InstallDevelComponent", install_devel_component),
];

const ISOLATED_BUILD: &[Step] = &[
    step("InstallBuildDependencies", install_build_dependencies),
    step("StopServiceBus", stop_service_bus),
    step("FixOwnership", fix_ownership),
    step("DropNetworking", drop_networking),
    step("ConfigureNetworking", configure_networking),
    step("BindSources", bind_sources),
    step("RunBuild", run_build),
];

const UNISOLATED_BUILD: &[Step] = &[
    step("RunBuild", run_build),
    step("StopServiceBus", stop_service_bus),
];

const FINISH: &[Step] = &[step("CollectArtifacts", collect_artifacts)];

/// The steps that build `package`, in order.
pub fn plan(package: &Package) -> Vec<Step> {
    let build = if package.format.supports_full_sandboxing() {
        ISOLATED_BUILD
    } else {
        UNISOLATED_BUILD
    };
    [PREPARE, build, FINISH].concat()
}

/// Run `steps` in order, stopping at the first failure.
pub fn run_steps(steps: &[Step], ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    for step in steps {
        info!(step = step.name, "Entering step");
        if let Err(e) = (step.run)(ctx) {
            error!(step = step.name, error = %e, "Step failed");
            return Err(e);
        }
        ctx.report.steps.push(step.name);
    }
    Ok(())
}

fn clean_existing(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.overlay.clean_existing()
}

fn compose_overlay(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.overlay.compose()
}

fn activate_root(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.overlay.activate_root(&ctx.config.packages_dir)
}

fn copy_assets(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.package.copy_assets(&ctx.overlay.mount_point)
}

fn fetch_sources(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    let report = ctx.sources.fetch_all(&ctx.package.sources, ctx.fetcher);
    info!(
        cached = report.cached.len(),
        fetched = report.fetched.len(),
        failed = report.failures.len(),
        "Sources checked"
    );
    ctx.report
        .fetch_failures
        .extend(report.failures.iter().map(ToString::to_string));
    Ok(())
}

fn init_package_manager(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.package_manager.init()
}

fn start_service_bus(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.package_manager.start_service()
}

fn upgrade_base(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.package_manager.upgrade()
}

fn install_devel_component(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.package_manager.install_component(DEVEL_COMPONENT)
}

fn install_build_dependencies(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    match ctx.package.dependency_descriptor() {
        Some(descriptor) => ctx
            .package_manager
            .install_declared_dependencies(&descriptor),
        None => Ok(()),
    }
}

fn stop_service_bus(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.package_manager.stop_service()
}

fn fix_ownership(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.executor.chroot_exec(
        &ctx.overlay.mount_point,
        &format!("chown -R {BUILD_USER}:{BUILD_USER} {BUILD_USER_HOME}"),
    )
}

fn drop_networking(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.executor.drop_networking()
}

fn configure_networking(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    ctx.overlay.configure_networking(ctx.executor)
}

/// Bind every cached source read-only into the sandbox source directory.
/// All missing sources are reported together.
fn bind_sources(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    let missing: Vec<String> = ctx
        .package
        .sources
        .iter()
        .filter(|source| !ctx.sources.is_fetched(source))
        .map(|source| source.uri.clone())
        .collect();
    if !missing.is_empty() {
        return Err(BuildError::SourcesUnavailable { uris: missing });
    }

    let internal_dir = ctx.package.format.source_dir();
    let target_dir = host_path(&ctx.overlay.mount_point, internal_dir);
    fs::create_dir_all(&target_dir)?;
    for source in &ctx.package.sources {
        let target = target_dir.join(&source.file_name);
        // A bind mount needs an existing file to cover.
        fs::File::create(&target)?;
        ctx.overlay
            .bind(&ctx.sources.path_for(source), &target, true)?;
    }
    Ok(())
}

fn run_build(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    info!(package = %ctx.package.name, "Running build");
    ctx.executor
        .chroot_exec(&ctx.overlay.mount_point, &ctx.package.build_command())
}

fn collect_artifacts(ctx: &mut BuildContext<'_>) -> BuildResult<()> {
    let work_dir = ctx.package.work_dir(&ctx.overlay.mount_point);
    let collected = artifacts::collect(&work_dir, ctx.output_dir)?;
    artifacts::write_manifest(
        ctx.package,
        ctx.profile.as_str(),
        ctx.started_at,
        &collected,
        ctx.output_dir,
    )?;
    ctx.report.artifacts = collected;
    Ok(())
}
