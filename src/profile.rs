//! Build profiles.
//!
//! A profile names the backing image a build runs on. Profiles come from a
//! fixed allow-list carried by the configuration; an unknown name is always a
//! hard error and never falls back to the default.

use anyhow::{bail, Result};
use std::fmt;

use crate::error::{BuildError, BuildResult};

/// The set of known profiles and the default among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSet {
    names: Vec<String>,
    default: String,
}

/// A profile name that has been checked against a [`ProfileSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Profile(String);

impl ProfileSet {
    /// Create a profile set. The list must be non-empty and contain `default`.
    pub fn new(names: Vec<String>, default: &str) -> Result<Self> {
        let mut names: Vec<String> = names
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        names.dedup();
        if names.is_empty() {
            bail!("profile list must not be empty");
        }
        if !names.iter().any(|name| name == default) {
            bail!(
                "default profile '{}' is not one of: {}",
                default,
                names.join(", ")
            );
        }
        Ok(Self {
            names,
            default: default.to_string(),
        })
    }

    /// Profile set from compiled-in constants, which are known to be valid.
    pub(crate) fn builtin(names: &[&str], default: &str) -> Self {
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            default: default.to_string(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|known| known == name)
    }

    /// Validate `name`, returning [`BuildError::InvalidProfile`] when unknown.
    pub fn validate(&self, name: &str) -> BuildResult<Profile> {
        let name = name.trim();
        if self.contains(name) {
            Ok(Profile(name.to_string()))
        } else {
            Err(BuildError::InvalidProfile {
                name: name.to_string(),
            })
        }
    }

    /// The message shown to users who asked for an unknown profile.
    pub fn invalid_profile_message(&self, name: &str) -> String {
        let mut message = format!("Error: '{name}' is not a known profile\n");
        message.push_str("Valid profiles include:\n\n");
        for known in &self.names {
            message.push_str(&format!(" * {known}\n"));
        }
        message.push_str(&format!("\nThe default profile is: {}\n", self.default));
        message
    }
}

impl Profile {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> ProfileSet {
        ProfileSet::new(
            vec!["main-x86_64".into(), "unstable-x86_64".into()],
            "main-x86_64",
        )
        .unwrap()
    }

    #[test]
    fn known_profiles_validate() {
        let set = profiles();
        assert_eq!(set.validate("main-x86_64").unwrap().as_str(), "main-x86_64");
        assert_eq!(
            set.validate(" unstable-x86_64 ").unwrap().as_str(),
            "unstable-x86_64"
        );
    }

    #[test]
    fn unknown_profiles_never_default() {
        let set = profiles();
        for bogus in ["bogus", "", "MAIN-X86_64", "main"] {
            assert!(!set.contains(bogus));
            assert!(matches!(
                set.validate(bogus),
                Err(BuildError::InvalidProfile { .. })
            ));
        }
    }

    #[test]
    fn invalid_profile_message_lists_exactly_the_known_set() {
        let set = profiles();
        let message = set.invalid_profile_message("bogus");
        let listed: Vec<&str> = message
            .lines()
            .filter_map(|line| line.strip_prefix(" * "))
            .collect();
        assert_eq!(listed, vec!["main-x86_64", "unstable-x86_64"]);
        assert!(message.contains("'bogus' is not a known profile"));
        assert!(message.ends_with("The default profile is: main-x86_64\n"));
    }

    #[test]
    fn default_must_be_listed() {
        assert!(ProfileSet::new(vec!["a".into()], "b").is_err());
        assert!(ProfileSet::new(vec![], "a").is_err());
    }
}
