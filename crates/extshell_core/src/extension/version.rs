//! Semantic version values used for manifest validation and framework
//! compatibility gates.
//!
//! # Invariants
//! - Accepts `major.minor.patch[-pre][+build]` with no leading zeros in
//!   numeric parts.
//! - `precedence` ignores build metadata; `Ord` only uses it to break ties so
//!   that ordering stays consistent with equality.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// One dot-separated pre-release identifier.
///
/// Numeric identifiers sort numerically and always below alphanumeric ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreRelease {
    Numeric(u64),
    Alpha(String),
}

impl Display for PreRelease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(value) => write!(f, "{value}"),
            Self::Alpha(value) => f.write_str(value),
        }
    }
}

/// Parsed semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Vec<PreRelease>,
    pub build: Option<String>,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
            build: None,
        }
    }

    /// Parses a semver string; surrounding whitespace is ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (value, build) = match value.split_once('+') {
            Some((head, build)) => (head, Some(parse_build(build)?)),
            None => (value, None),
        };
        let (core, pre) = match value.split_once('-') {
            Some((core, pre)) => (core, parse_pre_release(pre)?),
            None => (value, Vec::new()),
        };

        let mut parts = core.split('.');
        let major = parse_numeric(parts.next()?)?;
        let minor = parse_numeric(parts.next()?)?;
        let patch = parse_numeric(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            pre,
            build,
        })
    }

    /// Version of this crate, used as the default running framework version.
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or(Self::new(0, 0, 0))
    }

    pub fn is_pre_release(&self) -> bool {
        !self.pre.is_empty()
    }

    /// Semver precedence: build metadata does not participate and a
    /// pre-release ranks below its release.
    pub fn precedence(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }

    /// `true` when a host running `self` satisfies a `required` minimum.
    pub fn satisfies(&self, required: &Self) -> bool {
        self.precedence(required) != Ordering::Less
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence(other)
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        for (index, identifier) in self.pre.iter().enumerate() {
            f.write_str(if index == 0 { "-" } else { "." })?;
            write!(f, "{identifier}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

fn parse_numeric(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn parse_pre_release(raw: &str) -> Option<Vec<PreRelease>> {
    raw.split('.')
        .map(|part| {
            if !is_identifier(part) {
                return None;
            }
            if part.bytes().all(|b| b.is_ascii_digit()) {
                parse_numeric(part).map(PreRelease::Numeric)
            } else {
                Some(PreRelease::Alpha(part.to_string()))
            }
        })
        .collect()
}

fn parse_build(raw: &str) -> Option<String> {
    raw.split('.')
        .all(is_identifier)
        .then(|| raw.to_string())
}
