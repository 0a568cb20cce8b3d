//! Build packages inside disposable overlay sandboxes.
//!
//! Each build runs on top of a profile's backing image, mounted read-only as
//! the lower layer of an overlay whose writable layer exists only for that
//! build. The crate is organised leaves first:
//!
//! - **Sources** - content-addressed, checksum-verified cache of build inputs
//! - **Images** - backing image paths, install state and in-place update
//! - **Packages** - legacy (`pspec.xml`) and modern (`package.yml`) descriptors
//! - **Sandbox** - mounts, chroot execution, the overlay and its package manager
//! - **Build** - the step sequencer and the reaper that always tears down
//!
//! # Architecture
//!
//! ```text
//! Builder::build
//!     │
//!     ├── ProfileSet::validate, BackingImage::is_installed, Package::parse
//!     ├── ProfileLock (one build or update per profile)
//!     └── ReaperGuard ─────────────────────────────┐
//!           │                                       │
//!           ├── Overlay::compose / activate_root    │ scope exit, panic
//!           ├── SourceCache::fetch_all              │ or SIGINT/SIGTERM
//!           ├── PackageManager (eopkg, dbus)        │
//!           ├── Executor::drop_networking           ▼
//!           └── RunBuild, CollectArtifacts   Reaper::reap
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sandbuild::{Builder, BuilderConfig};
//! use std::path::Path;
//!
//! let builder = Builder::system(BuilderConfig::load(None)?)?;
//! let report = builder.build("main-x86_64", Path::new("package.yml"), Path::new("."))?;
//! for artifact in &report.artifacts {
//!     println!("{} {}", artifact.sha256, artifact.file_name);
//! }
//! ```

pub mod build;
pub mod config;
pub mod error;
pub mod image;
pub mod package;
pub mod preflight;
pub mod profile;
pub mod sandbox;
pub mod source;

#[cfg(test)]
mod testing;

pub use build::{BuildReport, Builder};
pub use config::BuilderConfig;
pub use error::{BuildError, BuildResult};
pub use image::BackingImage;
pub use package::{Package, PackageFormat};
pub use profile::{Profile, ProfileSet};
