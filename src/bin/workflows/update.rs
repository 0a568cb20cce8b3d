use std::process::ExitCode;

use anyhow::Result;
use sandbuild::{preflight, Builder, BuilderConfig};
use tracing::info;

use super::report_user_error;

pub(crate) fn update_profile(config: BuilderConfig, profile: Option<String>) -> Result<ExitCode> {
    let profile = profile.unwrap_or_else(|| config.profiles.default_name().to_string());
    if !config.profiles.contains(&profile) {
        eprint!("{}", config.profiles.invalid_profile_message(&profile));
        return Ok(ExitCode::FAILURE);
    }

    preflight::check_host_tools()?;
    let builder = Builder::system(config)?;
    match builder.update(&profile) {
        Ok(()) => {
            info!(profile = %profile, "Profile is up to date");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => report_user_error(err),
    }
}
