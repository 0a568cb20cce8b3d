mod build;
mod layout;
mod update;

pub(crate) use build::{build_package, BuildRequest};
pub(crate) use update::update_profile;

use std::process::ExitCode;

use anyhow::Result;
use sandbuild::BuildError;

/// Print errors the user can fix themselves as a single line and exit
/// non-zero. Anything else propagates with its full context.
pub(crate) fn report_user_error(err: BuildError) -> Result<ExitCode> {
    match err {
        BuildError::InvalidProfile { .. }
        | BuildError::NotInstalled { .. }
        | BuildError::PermissionDenied { .. }
        | BuildError::ProfileLocked { .. }
        | BuildError::UnrecognizedFormat(_) => {
            eprintln!("Error: {err}");
            Ok(ExitCode::FAILURE)
        }
        other => Err(other.into()),
    }
}
