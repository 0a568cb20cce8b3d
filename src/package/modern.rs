//! `package.yml` parsing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;

use super::ParsedDescriptor;

#[derive(Debug, Deserialize)]
struct PackageYml {
    name: String,
    version: Value,
    release: u32,
    #[serde(default)]
    source: Vec<BTreeMap<String, Value>>,
}

pub(crate) fn parse(contents: &str) -> Result<ParsedDescriptor> {
    let yml: PackageYml = serde_yaml::from_str(contents)?;

    // Unquoted versions arrive as YAML numbers and are normalized by their
    // printed form: `1.10` becomes "1.1". Quote them to keep them verbatim.
    let version = match &yml.version {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => bail!("version must be a string, got {other:?}"),
    };

    let mut sources = Vec::new();
    for (index, entry) in yml.source.iter().enumerate() {
        if entry.len() != 1 {
            bail!("source entry {index} must map exactly one URI to its checksum");
        }
        for (uri, checksum) in entry {
            let checksum = match checksum {
                Value::Number(n) => n.to_string(),
                other => other
                    .as_str()
                    .with_context(|| format!("checksum for '{uri}' must be a string"))?
                    .to_string(),
            };
            sources.push((uri.clone(), checksum));
        }
    }

    Ok(ParsedDescriptor {
        name: yml.name.trim().to_string(),
        version,
        release: yml.release,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_versions_are_stringified() {
        let parsed = parse("name: foo\nversion: 3.2\nrelease: 1\n").unwrap();
        assert_eq!(parsed.version, "3.2");
        assert!(parsed.sources.is_empty());
    }

    #[test]
    fn unquoted_versions_are_normalized() {
        let parsed = parse("name: foo\nversion: 1.10\nrelease: 1\n").unwrap();
        assert_eq!(parsed.version, "1.1");

        let parsed = parse("name: foo\nversion: '1.10'\nrelease: 1\n").unwrap();
        assert_eq!(parsed.version, "1.10");
    }

    #[test]
    fn sources_keep_declaration_order() {
        let parsed = parse(
            "name: foo\nversion: '1.0'\nrelease: 2\nsource:\n    - https://a/one.tar : aa\n    - https://b/two.tar : bb\n",
        )
        .unwrap();
        assert_eq!(
            parsed.sources,
            vec![
                ("https://a/one.tar".to_string(), "aa".to_string()),
                ("https://b/two.tar".to_string(), "bb".to_string()),
            ]
        );
    }

    #[test]
    fn missing_release_is_rejected() {
        assert!(parse("name: foo\nversion: 1\n").is_err());
    }
}
