//! Copying finished packages out of the sandbox.
//!
//! Built packages are the `*.eopkg` files the build tool leaves at the top
//! of the work directory. Each is copied to the output directory, hashed,
//! and listed in a JSON manifest written alongside them.

use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BuildError, BuildResult};
use crate::package::{Package, PackageFormat};
use crate::source::HashAlgorithm;

/// Extension of built binary packages.
pub const ARTIFACT_EXTENSION: &str = "eopkg";

/// One package copied out of a finished build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedArtifact {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct BuildManifest<'a> {
    package: &'a str,
    version: &'a str,
    release: u32,
    format: PackageFormat,
    profile: &'a str,
    started_at: String,
    finished_at: String,
    artifacts: &'a [CollectedArtifact],
}

/// Copy every artifact in `work_dir` to `output_dir`.
///
/// Fails with [`BuildError::NoArtifacts`] when there is nothing to collect.
pub fn collect(work_dir: &Path, output_dir: &Path) -> BuildResult<Vec<CollectedArtifact>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;

    let mut found: Vec<PathBuf> = WalkDir::new(work_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION))
        .collect();
    found.sort();

    if found.is_empty() {
        return Err(BuildError::NoArtifacts(work_dir.to_path_buf()));
    }

    let owner = invoking_user();
    let mut artifacts = Vec::with_capacity(found.len());
    for src in found {
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = output_dir.join(&file_name);
        let size_bytes = fs::copy(&src, &dest)
            .with_context(|| format!("copying artifact '{}'", src.display()))?;
        let sha256 = HashAlgorithm::Sha256.hash_file(&dest)?;
        if let Some((uid, gid)) = owner {
            chown(&dest, uid, gid);
        }
        info!(artifact = %file_name, sha256 = %sha256, "Collected artifact");
        artifacts.push(CollectedArtifact {
            file_name,
            path: dest,
            sha256,
            size_bytes,
        });
    }
    Ok(artifacts)
}

/// Write `<name>-<version>-<release>.manifest.json` into `output_dir`.
pub fn write_manifest(
    package: &Package,
    profile: &str,
    started_at: OffsetDateTime,
    artifacts: &[CollectedArtifact],
    output_dir: &Path,
) -> BuildResult<PathBuf> {
    let manifest = BuildManifest {
        package: &package.name,
        version: &package.version,
        release: package.release,
        format: package.format,
        profile,
        started_at: rfc3339(started_at)?,
        finished_at: rfc3339(OffsetDateTime::now_utc())?,
        artifacts,
    };
    let path = output_dir.join(format!("{}.manifest.json", package.identifier()));
    let json = serde_json::to_string_pretty(&manifest).context("serializing build manifest")?;
    fs::write(&path, json)
        .with_context(|| format!("writing build manifest '{}'", path.display()))?;
    if let Some((uid, gid)) = invoking_user() {
        chown(&path, uid, gid);
    }
    debug!(manifest = %path.display(), "Wrote build manifest");
    Ok(path)
}

fn rfc3339(at: OffsetDateTime) -> BuildResult<String> {
    Ok(at.format(&Rfc3339).context("formatting timestamp")?)
}

/// The user behind `sudo`, if any.
fn invoking_user() -> Option<(u32, u32)> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
    Some((uid, gid))
}

fn chown(path: &Path, uid: u32, gid: u32) {
    use nix::unistd::{Gid, Uid};
    if let Err(e) = nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
        warn!(path = %path.display(), error = %e, "Cannot hand artifact to invoking user");
    }
}
