use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

/// Downloads a URI to a local file.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, uri: &str, dest: &Path) -> Result<()>;
}

/// [`Fetcher`] for `http(s)://` and `file://` URIs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sandbuild/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        if let Some(local) = uri.strip_prefix("file://") {
            fs::copy(local, dest).with_context(|| format!("copying '{local}'"))?;
            return Ok(());
        }

        let mut response = self
            .client
            .get(uri)
            .send()
            .with_context(|| format!("requesting '{uri}'"))?
            .error_for_status()?;
        let mut file =
            File::create(dest).with_context(|| format!("creating '{}'", dest.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("downloading '{uri}'"))?;
        Ok(())
    }
}
