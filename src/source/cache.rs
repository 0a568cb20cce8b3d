//! Content-addressed source cache.
//!
//! Layout: `<root>/<checksum>/<file_name>`. An entry only counts as fetched
//! when its bytes hash to the declared checksum, so a truncated download or a
//! tampered file is fetched again instead of being handed to a build.

use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::{Fetcher, Source};
use crate::error::{BuildError, BuildResult};

/// Host-side store of verified sources.
#[derive(Debug, Clone)]
pub struct SourceCache {
    root: PathBuf,
}

/// Outcome of fetching every source of a package.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Sources downloaded during this run.
    pub fetched: Vec<String>,
    /// Sources that were already present and valid.
    pub cached: Vec<String>,
    /// Sources that could not be made available.
    pub failures: Vec<BuildError>,
}

impl FetchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where `source` lives once fetched.
    pub fn path_for(&self, source: &Source) -> PathBuf {
        self.root.join(&source.checksum).join(&source.file_name)
    }

    /// True only if the cached file exists and matches its checksum.
    pub fn is_fetched(&self, source: &Source) -> bool {
        let path = self.path_for(source);
        if !path.is_file() {
            return false;
        }
        match source.algorithm.hash_file(&path) {
            Ok(actual) => actual == source.checksum,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot hash cached source");
                false
            }
        }
    }

    /// Download `source` unless a valid copy is already cached.
    ///
    /// The download lands in a temporary file next to the final location and
    /// is only renamed into place after it verifies. A corrupt cached copy is
    /// discarded first.
    pub fn fetch(&self, source: &Source, fetcher: &dyn Fetcher) -> BuildResult<PathBuf> {
        let path = self.path_for(source);
        if self.is_fetched(source) {
            debug!(uri = %source.uri, "Source already cached");
            return Ok(path);
        }
        if path.exists() {
            warn!(path = %path.display(), "Discarding corrupt cached source");
            fs::remove_file(&path)?;
        }

        let dir = self.root.join(&source.checksum);
        fs::create_dir_all(&dir)?;
        let partial = dir.join(format!(".{}.partial", source.file_name));

        info!(uri = %source.uri, "Fetching source");
        if let Err(e) = fetcher.fetch(&source.uri, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(BuildError::FetchFailed {
                uri: source.uri.clone(),
                reason: format!("{e:#}"),
            });
        }

        let actual = match source.algorithm.hash_file(&partial) {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e.into());
            }
        };
        if actual != source.checksum {
            let _ = fs::remove_file(&partial);
            return Err(BuildError::ChecksumMismatch {
                uri: source.uri.clone(),
                expected: source.checksum.clone(),
                actual,
            });
        }

        fs::rename(&partial, &path)?;
        Ok(path)
    }

    /// Fetch every source, continuing past failures.
    pub fn fetch_all(&self, sources: &[Source], fetcher: &dyn Fetcher) -> FetchReport {
        let mut report = FetchReport::default();
        for source in sources {
            if self.is_fetched(source) {
                report.cached.push(source.uri.clone());
                continue;
            }
            match self.fetch(source, fetcher) {
                Ok(_) => report.fetched.push(source.uri.clone()),
                Err(e) => {
                    error!(uri = %source.uri, error = %e, "Failed to fetch source");
                    report.failures.push(e);
                }
            }
        }
        report
    }
}
