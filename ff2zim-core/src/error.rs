//! Error types for the ff2zim core.
//!
//! Configuration and state misuse (`ConfigError`, `RegistryError::InvalidTransition`)
//! is surfaced to the caller immediately. Collaborator failures
//! (`FetchFailure`, `PackageError`, `MinifyError`) are opaque: the core only
//! records them, it never inspects what went wrong inside the tool.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::registry::TargetState;

fn display_chain(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Misuse of the project option store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The section/option pair is not part of the static schema.
    #[error("unknown option {section}.{option}")]
    UnknownOption { section: String, option: String },

    /// The value cannot be coerced to the option's declared kind.
    #[error("invalid value {value:?} for {section}.{option}: expected {expected}")]
    InvalidValue {
        section: String,
        option: String,
        value: String,
        expected: &'static str,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse options file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Errors raised by the target registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested edge is not part of the lifecycle state machine.
    /// The registry is left unchanged.
    #[error("invalid transition for {identifier}: {from} -> {to} via {via}")]
    InvalidTransition {
        identifier: String,
        from: TargetState,
        to: TargetState,
        via: &'static str,
    },

    #[error("target not found: {0}")]
    NotFound(String),

    #[error("invalid target identifier {input:?}: {reason}")]
    InvalidIdentifier { input: String, reason: &'static str },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse target list {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Errors opening, creating or reading a project root.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("path {} does not point to a valid project", .0.display())]
    NotAProject(PathBuf),

    #[error("path {} is already a project", .0.display())]
    AlreadyExists(PathBuf),

    #[error("path {} is not empty", .0.display())]
    DirectoryNotEmpty(PathBuf),

    #[error("project is in use by another ff2zim process (lock {})", .0.display())]
    Locked(PathBuf),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ProjectError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ProjectError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Errors from lifecycle operations. Per-target fetch failures are *not*
/// errors; they are recorded on the target.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from the update detector strategies.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("mail source failed: {0}")]
    Mail(#[from] MailError),

    #[error("category listing failed: {0}")]
    Listing(#[from] ListingError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors resolving a project tree into a build view.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A project lists itself, directly or transitively, as a subproject.
    #[error("cyclic subproject reference: {}", display_chain(cycle))]
    CyclicProject { cycle: Vec<PathBuf> },

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A bundle that cannot be used for packaging.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle file missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("bundle unreadable at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Fatal build errors. Per-item export and minification failures are
/// reported in the build report instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("output path {} is a directory", .0.display())]
    OutputIsDirectory(PathBuf),

    #[error("archive assembly failed: {0}")]
    Package(#[source] PackageError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Opaque failure reported by the fetcher collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FetchFailure {
    pub reason: String,
}

impl FetchFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Opaque failure reported by the packager collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PackageError {
    pub reason: String,
}

impl PackageError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Opaque failure reported by the minifier collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct MinifyError {
    pub reason: String,
}

impl MinifyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Opaque failure reported by the mail source collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct MailError {
    pub reason: String,
}

impl MailError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Opaque failure reported by the remote listing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ListingError {
    pub reason: String,
}

impl ListingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
