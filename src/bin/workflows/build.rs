use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use sandbuild::{preflight, Builder, BuilderConfig};
use tracing::{error, info, warn};

use super::layout::locate_descriptor;
use super::report_user_error;

pub(crate) struct BuildRequest {
    pub profile: Option<String>,
    pub descriptor: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

pub(crate) fn build_package(config: BuilderConfig, request: BuildRequest) -> Result<ExitCode> {
    let profile = request
        .profile
        .unwrap_or_else(|| config.profiles.default_name().to_string());
    if !config.profiles.contains(&profile) {
        eprint!("{}", config.profiles.invalid_profile_message(&profile));
        return Ok(ExitCode::FAILURE);
    }

    let cwd = std::env::current_dir().context("resolving current directory")?;
    let descriptor = match request.descriptor {
        Some(path) => path,
        None => locate_descriptor(&cwd)?,
    };
    let output_dir = request.output_dir.unwrap_or(cwd);

    preflight::check_host_tools()?;
    let builder = Builder::system(config)?;

    match builder.build(&profile, &descriptor, &output_dir) {
        Ok(report) => {
            for warning in &report.warnings {
                warn!("{warning}");
            }
            for failure in &report.fetch_failures {
                error!(error = %failure, "Source was not fetched");
            }
            for artifact in &report.artifacts {
                info!(
                    artifact = %artifact.path.display(),
                    sha256 = %artifact.sha256,
                    "Built"
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => report_user_error(err),
    }
}
