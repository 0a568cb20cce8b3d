//! Builder configuration.
//!
//! All directory conventions and the profile allow-list live in one value
//! object, [`BuilderConfig`], which is handed to every component that needs
//! it. Nothing reads process-wide state, so tests can point a whole builder
//! at a temporary directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::profile::ProfileSet;

/// System-wide configuration file, read when present.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sandbuild/sandbuild.toml";

/// Suffix of an installed (decompressed) backing image.
pub const IMAGE_SUFFIX: &str = ".img";

/// Suffix of a fetched but not yet installed backing image.
pub const IMAGE_COMPRESSED_SUFFIX: &str = ".img.xz";

const DEFAULT_IMAGES_DIR: &str = "/var/lib/sandbuild/images";
const DEFAULT_ROOTS_DIR: &str = "/var/lib/sandbuild/roots";
const DEFAULT_CACHE_DIR: &str = "/var/cache/sandbuild";
const DEFAULT_SOURCES_DIR: &str = "/var/lib/sandbuild/sources";
const DEFAULT_PACKAGES_DIR: &str = "/var/lib/sandbuild/packages";
const DEFAULT_IMAGE_BASE_URI: &str = "https://solus-project.com/image_root";
const DEFAULT_PROFILES: &[&str] = &["main-x86_64", "unstable-x86_64"];
const DEFAULT_PROFILE: &str = "main-x86_64";

/// Resolved configuration for a builder instance.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Where `<profile>.img` and `<profile>.img.xz` live.
    pub images_dir: PathBuf,
    /// Mount points used while updating a backing image in place.
    pub roots_dir: PathBuf,
    /// Per-profile overlay roots (`img`, `tmp`, `work`, `union`).
    pub cache_dir: PathBuf,
    /// Content-addressed cache of build sources.
    pub sources_dir: PathBuf,
    /// Binary package cache shared into every sandbox.
    pub packages_dir: PathBuf,
    /// Remote location backing images are published under.
    pub image_base_uri: String,
    /// Known profiles and the default one.
    pub profiles: ProfileSet,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            roots_dir: PathBuf::from(DEFAULT_ROOTS_DIR),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            sources_dir: PathBuf::from(DEFAULT_SOURCES_DIR),
            packages_dir: PathBuf::from(DEFAULT_PACKAGES_DIR),
            image_base_uri: DEFAULT_IMAGE_BASE_URI.to_string(),
            profiles: ProfileSet::builtin(DEFAULT_PROFILES, DEFAULT_PROFILE),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuilderConfigToml {
    images_dir: Option<PathBuf>,
    roots_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    sources_dir: Option<PathBuf>,
    packages_dir: Option<PathBuf>,
    image_base_uri: Option<String>,
    profiles: Option<Vec<String>>,
    default_profile: Option<String>,
}

impl BuilderConfig {
    /// A configuration whose directories all live below `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            images_dir: root.join("images"),
            roots_dir: root.join("roots"),
            cache_dir: root.join("cache"),
            sources_dir: root.join("sources"),
            packages_dir: root.join("packages"),
            ..Self::default()
        }
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read if present and the built-in defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse a TOML configuration file, overriding defaults key by key.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading builder config '{}'", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("parsing builder config '{}'", path.display()))
    }

    fn from_toml_str(contents: &str) -> Result<Self> {
        let parsed: BuilderConfigToml = toml::from_str(contents)?;
        let mut config = Self::default();

        if let Some(dir) = parsed.images_dir {
            config.images_dir = dir;
        }
        if let Some(dir) = parsed.roots_dir {
            config.roots_dir = dir;
        }
        if let Some(dir) = parsed.cache_dir {
            config.cache_dir = dir;
        }
        if let Some(dir) = parsed.sources_dir {
            config.sources_dir = dir;
        }
        if let Some(dir) = parsed.packages_dir {
            config.packages_dir = dir;
        }
        if let Some(uri) = parsed.image_base_uri {
            let uri = uri.trim().trim_end_matches('/').to_string();
            if uri.is_empty() {
                bail!("image_base_uri must not be empty");
            }
            config.image_base_uri = uri;
        }

        if parsed.profiles.is_some() || parsed.default_profile.is_some() {
            let names = parsed
                .profiles
                .unwrap_or_else(|| config.profiles.names().to_vec());
            let default = parsed
                .default_profile
                .unwrap_or_else(|| config.profiles.default_name().to_string());
            config.profiles = ProfileSet::new(names, &default)?;
        }

        Ok(config)
    }
}
