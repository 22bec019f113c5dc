//! Extension manifest records and validation.
//!
//! A manifest is an ordered JSON array of unit declarations. It is the
//! authoritative source for everything except the user-owned `enabled` flag.

use crate::extension::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One raw manifest declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Stable unit identifier, e.g. `app-sidebar`, `builtin.theme` or `A`.
    /// ASCII letters and digits, single `.`/`_`/`-` separators between them.
    pub tag: String,
    /// Location handed to the module fetch backend.
    pub path: String,
    pub name: String,
    /// Unit version (semver, e.g. `1.4.0` or `2.0.0-rc.1`).
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub min_framework_version: Option<String>,
}

impl ManifestEntry {
    /// Validates declaration-level invariants of a single entry.
    pub fn validate(&self) -> Result<(), ManifestValidationError> {
        let tag = self.tag.trim();
        if tag.is_empty() {
            return Err(ManifestValidationError::EmptyTag);
        }
        if !is_valid_tag(tag) {
            return Err(ManifestValidationError::InvalidTag(self.tag.clone()));
        }
        if self.path.trim().is_empty() {
            return Err(ManifestValidationError::EmptyPath(tag.to_string()));
        }
        if Version::parse(&self.version).is_none() {
            return Err(ManifestValidationError::InvalidVersion {
                tag: tag.to_string(),
                value: self.version.clone(),
            });
        }
        if let Some(min) = &self.min_framework_version {
            if Version::parse(min).is_none() {
                return Err(ManifestValidationError::InvalidFrameworkVersion {
                    tag: tag.to_string(),
                    value: min.clone(),
                });
            }
        }

        let mut seen = BTreeSet::<&str>::new();
        for dependency in &self.dependencies {
            if !is_valid_tag(dependency) {
                return Err(ManifestValidationError::InvalidDependency {
                    tag: tag.to_string(),
                    dependency: dependency.clone(),
                });
            }
            if dependency == tag {
                return Err(ManifestValidationError::SelfDependency(tag.to_string()));
            }
            if !seen.insert(dependency.as_str()) {
                return Err(ManifestValidationError::DuplicateDependency {
                    tag: tag.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Validates every entry and rejects duplicate tags across the manifest.
pub fn validate_manifest(entries: &[ManifestEntry]) -> Result<(), ManifestValidationError> {
    let mut tags = BTreeSet::<&str>::new();
    for entry in entries {
        entry.validate()?;
        if !tags.insert(entry.tag.trim()) {
            return Err(ManifestValidationError::DuplicateTag(
                entry.tag.trim().to_string(),
            ));
        }
    }
    Ok(())
}

/// Parses and validates a JSON manifest document.
pub fn parse_manifest(json: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(json).map_err(ManifestError::Parse)?;
    validate_manifest(&entries).map_err(ManifestError::Invalid)?;
    Ok(entries)
}

fn is_valid_tag(value: &str) -> bool {
    let mut chars = value.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_alphanumeric() {
            prev_separator = false;
            continue;
        }
        if c == '.' || c == '_' || c == '-' {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}

/// Declaration-level manifest errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestValidationError {
    EmptyTag,
    InvalidTag(String),
    DuplicateTag(String),
    EmptyPath(String),
    InvalidVersion { tag: String, value: String },
    InvalidFrameworkVersion { tag: String, value: String },
    InvalidDependency { tag: String, dependency: String },
    SelfDependency(String),
    DuplicateDependency { tag: String, dependency: String },
}

impl Display for ManifestValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTag => write!(f, "manifest tag must not be empty"),
            Self::InvalidTag(value) => write!(f, "manifest tag is invalid: {value}"),
            Self::DuplicateTag(value) => write!(f, "manifest tag is declared twice: {value}"),
            Self::EmptyPath(tag) => write!(f, "manifest path must not be empty for {tag}"),
            Self::InvalidVersion { tag, value } => write!(
                f,
                "manifest version is invalid for {tag}: {value} (expected semver)"
            ),
            Self::InvalidFrameworkVersion { tag, value } => write!(
                f,
                "minimum framework version is invalid for {tag}: {value} (expected semver)"
            ),
            Self::InvalidDependency { tag, dependency } => {
                write!(f, "dependency tag is invalid for {tag}: {dependency}")
            }
            Self::SelfDependency(tag) => write!(f, "{tag} depends on itself"),
            Self::DuplicateDependency { tag, dependency } => {
                write!(f, "{tag} lists dependency {dependency} more than once")
            }
        }
    }
}

impl Error for ManifestValidationError {}

/// Manifest document errors.
#[derive(Debug)]
pub enum ManifestError {
    Parse(serde_json::Error),
    Invalid(ManifestValidationError),
}

impl Display for ManifestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "manifest is not valid JSON: {err}"),
            Self::Invalid(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ManifestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_manifest, validate_manifest, ManifestEntry, ManifestError,
        ManifestValidationError,
    };

    fn valid_entry() -> ManifestEntry {
        ManifestEntry {
            tag: "app-sidebar".to_string(),
            path: "units/sidebar.js".to_string(),
            name: "Sidebar".to_string(),
            version: "0.1.0".to_string(),
            dependencies: vec!["app-theme".to_string()],
            priority: 0,
            internal: false,
            min_framework_version: Some("0.1.0".to_string()),
        }
    }

    #[test]
    fn validates_baseline_entry() {
        assert!(valid_entry().validate().is_ok());
    }

    #[test]
    fn parses_camel_case_with_optional_fields() {
        let entries = parse_manifest(
            r#"[
                {"tag": "app-theme", "path": "theme.js", "name": "Theme", "version": "1.0.0"},
                {"tag": "app-sidebar", "path": "sidebar.js", "name": "Sidebar",
                 "version": "1.2.0", "dependencies": ["app-theme"], "priority": 3,
                 "internal": true, "minFrameworkVersion": "0.1.0"}
            ]"#,
        )
        .expect("manifest should parse");

        assert_eq!(entries.len(), 2);
        assert!(entries[0].dependencies.is_empty());
        assert_eq!(entries[0].priority, 0);
        assert!(!entries[0].internal);
        assert_eq!(entries[1].dependencies, vec!["app-theme".to_string()]);
        assert_eq!(entries[1].priority, 3);
        assert!(entries[1].internal);
        assert_eq!(entries[1].min_framework_version.as_deref(), Some("0.1.0"));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_manifest("{not json").expect_err("malformed manifest must fail");
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn rejects_duplicate_tags() {
        let err = validate_manifest(&[valid_entry(), valid_entry()]).unwrap_err();
        assert_eq!(
            err,
            ManifestValidationError::DuplicateTag("app-sidebar".to_string())
        );
    }

    #[test]
    fn rejects_self_and_duplicate_dependencies() {
        let mut entry = valid_entry();
        entry.dependencies = vec!["app-sidebar".to_string()];
        assert_eq!(
            entry.validate().unwrap_err(),
            ManifestValidationError::SelfDependency("app-sidebar".to_string())
        );

        entry.dependencies = vec!["app-theme".to_string(), "app-theme".to_string()];
        assert!(matches!(
            entry.validate().unwrap_err(),
            ManifestValidationError::DuplicateDependency { .. }
        ));
    }

    #[test]
    fn rejects_invalid_tag_format() {
        let mut entry = valid_entry();
        entry.tag = "App Sidebar".to_string();
        assert!(matches!(
            entry.validate().unwrap_err(),
            ManifestValidationError::InvalidTag(_)
        ));

        entry.tag = "app--sidebar".to_string();
        assert!(matches!(
            entry.validate().unwrap_err(),
            ManifestValidationError::InvalidTag(_)
        ));
    }

    #[test]
    fn accepts_pre_release_versions() {
        let entries = parse_manifest(
            r#"[{"tag": "a", "path": "a.js", "name": "A", "version": "1.0.0-beta.1",
                 "minFrameworkVersion": "2.1.0-rc.1+build.9"}]"#,
        )
        .expect("pre-release versions are valid semver");
        assert_eq!(entries[0].version, "1.0.0-beta.1");
        assert_eq!(
            entries[0].min_framework_version.as_deref(),
            Some("2.1.0-rc.1+build.9")
        );
    }

    #[test]
    fn accepts_uppercase_tags() {
        let mut first = valid_entry();
        first.tag = "A".to_string();
        first.dependencies = vec!["B".to_string()];
        let mut second = valid_entry();
        second.tag = "B".to_string();
        second.dependencies.clear();
        assert!(validate_manifest(&[first, second]).is_ok());

        let mut entry = valid_entry();
        entry.tag = "AppSidebar.v2".to_string();
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_versions() {
        let mut entry = valid_entry();
        entry.version = "v1".to_string();
        assert!(matches!(
            entry.validate().unwrap_err(),
            ManifestValidationError::InvalidVersion { .. }
        ));

        let mut entry = valid_entry();
        entry.min_framework_version = Some("latest".to_string());
        assert!(matches!(
            entry.validate().unwrap_err(),
            ManifestValidationError::InvalidFrameworkVersion { .. }
        ));
    }

    #[test]
    fn rejects_empty_path() {
        let mut entry = valid_entry();
        entry.path = "  ".to_string();
        assert_eq!(
            entry.validate().unwrap_err(),
            ManifestValidationError::EmptyPath("app-sidebar".to_string())
        );
    }
}
