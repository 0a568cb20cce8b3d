//! Build sources: what a package declares, how it is verified, and where it
//! is cached on the host.

mod cache;
mod fetch;

pub use cache::{FetchReport, SourceCache};
pub use fetch::{Fetcher, HttpFetcher};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Hash algorithm a descriptor format uses for its source checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Length of a hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }

    /// Hex digest of the file at `path`.
    pub fn hash_file(self, path: &Path) -> Result<String> {
        match self {
            HashAlgorithm::Sha1 => digest_file::<Sha1>(path),
            HashAlgorithm::Sha256 => digest_file::<Sha256>(path),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha1 => f.write_str("sha1"),
            HashAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A remote file a package needs, pinned by checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub uri: String,
    /// Last path segment of the URI, used as the cached and in-sandbox name.
    pub file_name: String,
    /// Lowercase hex digest.
    pub checksum: String,
    pub algorithm: HashAlgorithm,
}

impl Source {
    pub fn new(uri: &str, checksum: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let uri = uri.trim();
        let checksum = checksum.trim().to_ascii_lowercase();
        if checksum.len() != algorithm.hex_len()
            || !checksum.chars().all(|c| c.is_ascii_hexdigit())
        {
            bail!("'{checksum}' is not a valid {algorithm} checksum for '{uri}'");
        }
        let file_name = file_name_from_uri(uri)
            .with_context(|| format!("cannot derive a file name from '{uri}'"))?;
        Ok(Self {
            uri: uri.to_string(),
            file_name,
            checksum,
            algorithm,
        })
    }
}

fn file_name_from_uri(uri: &str) -> Option<String> {
    let without_suffix = uri.split(['?', '#']).next().unwrap_or(uri);
    let after_scheme = without_suffix
        .split_once("://")
        .map_or(without_suffix, |(_, rest)| rest);
    let (_, path) = after_scheme.split_once('/')?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." || name.contains(':') {
        return None;
    }
    Some(name.to_string())
}
