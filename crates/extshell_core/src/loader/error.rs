//! Loader error taxonomy.

use crate::resolver::ResolveError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Why a `load` call was rejected.
///
/// `Clone` because one failure is delivered to every waiter of a shared
/// in-flight load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    NotFound(String),
    MissingDependency {
        tag: String,
        missing: String,
    },
    Cycle(Vec<String>),
    VersionIncompatible {
        tag: String,
        required: String,
        running: String,
    },
    Disabled(String),
    ModuleFetch {
        tag: String,
        reason: String,
    },
    /// `tag` was skipped because `dependency` failed in the same load.
    DependencyFailed {
        tag: String,
        dependency: String,
        source: Box<LoadError>,
    },
}

impl LoadError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::Cycle(_) => "cycle",
            Self::VersionIncompatible { .. } => "version_incompatible",
            Self::Disabled(_) => "disabled",
            Self::ModuleFetch { .. } => "module_fetch",
            Self::DependencyFailed { .. } => "dependency_failed",
        }
    }

    /// Returns whether the error was raised before any fetch started.
    pub fn is_pre_fetch(&self) -> bool {
        !matches!(
            self,
            Self::ModuleFetch { .. } | Self::DependencyFailed { .. }
        )
    }
}

impl From<ResolveError> for LoadError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::NotFound(tag) => Self::NotFound(tag),
            ResolveError::MissingDependency { tag, missing } => {
                Self::MissingDependency { tag, missing }
            }
            ResolveError::Cycle(path) => Self::Cycle(path),
        }
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(tag) => write!(f, "extension not registered: {tag}"),
            Self::MissingDependency { tag, missing } => {
                write!(f, "{tag} depends on unregistered extension {missing}")
            }
            Self::Cycle(path) => write!(f, "dependency cycle: {}", path.join(" -> ")),
            Self::VersionIncompatible {
                tag,
                required,
                running,
            } => write!(
                f,
                "{tag} requires framework {required} but {running} is running"
            ),
            Self::Disabled(tag) => write!(f, "extension is disabled: {tag}"),
            Self::ModuleFetch { tag, reason } => write!(f, "failed to fetch {tag}: {reason}"),
            Self::DependencyFailed {
                tag, dependency, ..
            } => write!(f, "{tag} skipped because dependency {dependency} failed"),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::DependencyFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
