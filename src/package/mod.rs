//! Package descriptors.
//!
//! Two mutually exclusive formats are supported:
//!
//! - **Legacy**: `pspec.xml`, SHA-1 source checksums, built as root with the
//!   package manager's own build command. Full sandboxing is not possible.
//! - **Modern**: `package.yml`, SHA-256 source checksums, built as the
//!   unprivileged build user with networking dropped.
//!
//! Every format-dependent convention lives on [`PackageFormat`] so the build
//! steps stay format agnostic.

mod assets;
mod legacy;
mod modern;

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};
use crate::source::{HashAlgorithm, Source};

/// Unprivileged user modern builds run as.
pub const BUILD_USER: &str = "build";

/// Home directory of [`BUILD_USER`] inside the sandbox.
pub const BUILD_USER_HOME: &str = "/home/build";

pub const LEGACY_DESCRIPTOR: &str = "pspec.xml";
pub const MODERN_DESCRIPTOR: &str = "package.yml";

/// Descriptor format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Legacy,
    Modern,
}

impl PackageFormat {
    /// Select the format from a descriptor path.
    pub fn detect(path: &Path) -> BuildResult<Self> {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        match file_name {
            LEGACY_DESCRIPTOR => return Ok(PackageFormat::Legacy),
            MODERN_DESCRIPTOR => return Ok(PackageFormat::Modern),
            _ => {}
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("xml") => Ok(PackageFormat::Legacy),
            Some("yml") | Some("yaml") => Ok(PackageFormat::Modern),
            _ => Err(BuildError::UnrecognizedFormat(path.to_path_buf())),
        }
    }

    /// Work directory inside the sandbox.
    pub fn work_dir(self) -> &'static str {
        match self {
            PackageFormat::Legacy => "/WORK",
            PackageFormat::Modern => "/home/build/work",
        }
    }

    /// Directory the build tool expects sources in, inside the sandbox.
    pub fn source_dir(self) -> &'static str {
        match self {
            PackageFormat::Legacy => "/var/cache/eopkg/archives",
            PackageFormat::Modern => "/home/build/YPKG/sources",
        }
    }

    pub fn checksum_algorithm(self) -> HashAlgorithm {
        match self {
            PackageFormat::Legacy => HashAlgorithm::Sha1,
            PackageFormat::Modern => HashAlgorithm::Sha256,
        }
    }

    /// Whether dependency installation and network isolation are available.
    pub fn supports_full_sandboxing(self) -> bool {
        matches!(self, PackageFormat::Modern)
    }

    /// Files and directories staged next to the descriptor, when present.
    pub fn auxiliary_assets(self) -> &'static [&'static str] {
        match self {
            PackageFormat::Legacy => &["files", "comar", "component.xml", "actions.py"],
            PackageFormat::Modern => &["files", "comar", "component.xml"],
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageFormat::Legacy => f.write_str("legacy"),
            PackageFormat::Modern => f.write_str("modern"),
        }
    }
}

/// Resolve an absolute sandbox path against the host view of the sandbox.
pub fn host_path(mount_point: &Path, internal: &str) -> PathBuf {
    mount_point.join(internal.trim_start_matches('/'))
}

/// Name and version end up in output file names, so each must be a single
/// path segment.
fn validate_segment(field: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        anyhow::bail!("package {field} is empty");
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        anyhow::bail!("package {field} '{value}' must be a safe filename segment");
    }
    Ok(())
}

/// A parsed, normalized package descriptor.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub release: u32,
    pub format: PackageFormat,
    /// Absolute path of the descriptor on the host.
    pub path: PathBuf,
    pub sources: Vec<Source>,
}

/// Fields common to both descriptor formats.
pub(crate) struct ParsedDescriptor {
    pub name: String,
    pub version: String,
    pub release: u32,
    /// (uri, checksum) in declaration order.
    pub sources: Vec<(String, String)>,
}

impl Package {
    /// Parse the descriptor at `path`.
    pub fn parse(path: &Path) -> BuildResult<Self> {
        let format = PackageFormat::detect(path)?;
        let parse_error = |reason: String| BuildError::DescriptorParse {
            path: path.to_path_buf(),
            reason,
        };

        let path = fs::canonicalize(path).map_err(|e| parse_error(e.to_string()))?;
        let contents = fs::read_to_string(&path).map_err(|e| parse_error(e.to_string()))?;
        let parsed = match format {
            PackageFormat::Legacy => legacy::parse(&contents),
            PackageFormat::Modern => modern::parse(&contents),
        }
        .map_err(|e| parse_error(format!("{e:#}")))?;
        validate_segment("name", &parsed.name).map_err(|e| parse_error(format!("{e:#}")))?;
        validate_segment("version", &parsed.version)
            .map_err(|e| parse_error(format!("{e:#}")))?;

        let algorithm = format.checksum_algorithm();
        let sources = parsed
            .sources
            .iter()
            .map(|(uri, checksum)| Source::new(uri, checksum, algorithm))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| parse_error(format!("{e:#}")))?;

        Ok(Self {
            name: parsed.name,
            version: parsed.version,
            release: parsed.release,
            format,
            path,
            sources,
        })
    }

    pub fn descriptor_file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(MODERN_DESCRIPTOR)
    }

    /// Directory the descriptor and its assets were read from.
    pub fn source_tree(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("/"))
    }

    /// Host view of the sandbox work directory.
    pub fn work_dir(&self, mount_point: &Path) -> PathBuf {
        host_path(mount_point, self.format.work_dir())
    }

    /// Host view of the sandbox source directory.
    pub fn source_dir(&self, mount_point: &Path) -> PathBuf {
        host_path(mount_point, self.format.source_dir())
    }

    /// The staged descriptor as seen from inside the sandbox.
    pub fn internal_descriptor_path(&self) -> PathBuf {
        Path::new(self.format.work_dir()).join(self.descriptor_file_name())
    }

    /// Descriptor to resolve declared dependencies from, if the format
    /// supports dependency installation.
    pub fn dependency_descriptor(&self) -> Option<PathBuf> {
        self.format
            .supports_full_sandboxing()
            .then(|| self.internal_descriptor_path())
    }

    /// The in-sandbox command that builds this package.
    pub fn build_command(&self) -> String {
        let work_dir = self.format.work_dir();
        let descriptor = self.internal_descriptor_path();
        match self.format {
            PackageFormat::Legacy => format!(
                "eopkg build --ignore-safety -O {} {}",
                work_dir,
                descriptor.display()
            ),
            PackageFormat::Modern => format!(
                "/bin/su - {} -- fakeroot ypkg-build -D {} {}",
                BUILD_USER,
                work_dir,
                descriptor.display()
            ),
        }
    }

    /// Stage the descriptor and its auxiliary files into the sandbox.
    pub fn copy_assets(&self, mount_point: &Path) -> BuildResult<()> {
        assets::copy_assets(self, mount_point).map_err(BuildError::from)
    }

    /// `<name>-<version>-<release>`.
    pub fn identifier(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}
