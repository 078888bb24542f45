//! Capability traits for the external collaborators.
//!
//! The core never shells out or touches the network. Everything that does
//! (fetching a story, assembling an archive, minifying HTML, reading a
//! mailbox, listing a remote category) sits behind one of these traits.
//! Production implementations live in the `ff2zim` crate; tests use the
//! generated `Mock*` doubles.
//!
//! Calls are awaited strictly one after another. Implementations must be
//! `Send + Sync` so a handle can be shared with the runtime, not so calls can
//! overlap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::config::{BuildOptions, DownloadOptions};
use crate::error::{FetchFailure, ListingError, MailError, MinifyError, PackageError};
use crate::registry::TargetMetadata;

/// Fetches one remote story into a local bundle directory.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `identifier` into the empty directory `bundle_dir`.
    ///
    /// Must fully populate the directory on success: the story document and
    /// any images. Repeated calls for the same identifier are independent.
    async fn fetch(
        &self,
        identifier: &str,
        options: &DownloadOptions,
        bundle_dir: &Path,
    ) -> Result<TargetMetadata, FetchFailure>;
}

/// Project a package item originates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectOrigin {
    pub root: PathBuf,
    pub name: String,
    /// 0 for the top-level project.
    pub depth: usize,
}

/// One story handed to the packager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageItem {
    pub identifier: String,
    pub origin: ProjectOrigin,
    /// Grouping category after alias resolution.
    pub category: String,
    pub metadata: TargetMetadata,
    /// Story document, possibly a minified copy of the bundle's file.
    pub story: PathBuf,
    pub metadata_file: Option<PathBuf>,
    /// Images to package. Empty when images are excluded for this item.
    pub images: Vec<PathBuf>,
    /// Per-story export produced earlier in the same build.
    pub export: Option<PathBuf>,
}

/// Where and how to write a per-story export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub output_dir: PathBuf,
    /// Write into `<output_dir>/<category>/`.
    pub group_by_category: bool,
}

/// Assembles archives and per-story exports from local bundles.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Packager: Send + Sync {
    /// Write one archive containing `items`, in order, to `destination`.
    async fn package(
        &self,
        items: &[PackageItem],
        options: &BuildOptions,
        destination: &Path,
    ) -> Result<(), PackageError>;

    /// Produce a standalone export of one story. Returns the written path.
    async fn package_single(
        &self,
        item: &PackageItem,
        options: &ExportOptions,
    ) -> Result<PathBuf, PackageError>;
}

/// What the minifier is given. Story pages are the only content ff2zim
/// rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Minifier: Send + Sync {
    async fn minify(&self, content: &str, kind: ContentKind) -> Result<String, MinifyError>;
}

/// An unread update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Source-defined handle, passed back to `mark_read`.
    pub id: String,
    pub subject: String,
    pub body: String,
}

/// Mailbox holding update notifications.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_unread(&self) -> Result<Vec<MailMessage>, MailError>;

    async fn mark_read(&self, message: &MailMessage) -> Result<(), MailError>;

    /// The target identifier a message refers to, if one can be found.
    fn extract_identifier(&self, message: &MailMessage) -> Option<String>;
}

/// One story in a remote category listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedStory {
    pub identifier: String,
    /// Whether the remote copy is newer than the local one.
    pub changed: bool,
}

/// Local fetch time of every downloaded target, keyed by identifier.
pub type KnownStories = BTreeMap<String, DateTime<Utc>>;

/// Lists the stories of a remote category.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CategoryLister: Send + Sync {
    /// List `category`. `known` lets the lister decide `changed` per story.
    async fn list_category(
        &self,
        category: &str,
        known: &KnownStories,
    ) -> Result<Vec<ListedStory>, ListingError>;
}
