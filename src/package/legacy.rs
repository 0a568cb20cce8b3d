//! `pspec.xml` parsing.
//!
//! Only the parts a sandboxed build needs are read: the source name, its
//! archives, and the newest entry of the update history, which carries the
//! version and release.

use anyhow::{bail, Result};
use serde::Deserialize;

use super::ParsedDescriptor;

#[derive(Debug, Deserialize)]
struct Pisi {
    #[serde(rename = "Source")]
    source: PisiSource,
    #[serde(rename = "History")]
    history: History,
}

#[derive(Debug, Deserialize)]
struct PisiSource {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Archive", default)]
    archives: Vec<Archive>,
}

#[derive(Debug, Deserialize)]
struct Archive {
    #[serde(rename = "@sha1sum")]
    sha1sum: String,
    #[serde(rename = "$text")]
    uri: String,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(rename = "Update", default)]
    updates: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(rename = "@release")]
    release: u32,
    #[serde(rename = "Version")]
    version: String,
}

pub(crate) fn parse(contents: &str) -> Result<ParsedDescriptor> {
    let pisi: Pisi = quick_xml::de::from_str(contents)?;

    // History is newest first.
    let Some(latest) = pisi.history.updates.into_iter().next() else {
        bail!("History has no Update entries");
    };
    let name = pisi.source.name.trim().to_string();
    if name.is_empty() {
        bail!("Source/Name is empty");
    }

    Ok(ParsedDescriptor {
        name,
        version: latest.version.trim().to_string(),
        release: latest.release,
        sources: pisi
            .source
            .archives
            .into_iter()
            .map(|archive| (archive.uri.trim().to_string(), archive.sha1sum))
            .collect(),
    })
}
