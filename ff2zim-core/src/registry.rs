//! Target registry and lifecycle state machine.
//!
//! The registry is an insertion-ordered list of targets persisted as
//! `targets.json`. All state changes go through [`TargetRegistry::transition`],
//! which checks the requested edge against [`TargetState::can_transition_to`]
//! and persists the whole list atomically before returning. A failed save
//! restores the in-memory entry, so a target is never observed half-moved.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::identifier::normalize_identifier;
use crate::persist::{list_lines, write_atomic};

pub const REGISTRY_VERSION: u32 = 1;

/// Lifecycle state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetState {
    New,
    Downloaded,
    UpdateRequired,
    Failed,
}

impl TargetState {
    pub const ALL: [TargetState; 4] = [
        TargetState::New,
        TargetState::Downloaded,
        TargetState::UpdateRequired,
        TargetState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::New => "NEW",
            TargetState::Downloaded => "DOWNLOADED",
            TargetState::UpdateRequired => "UPDATE_REQUIRED",
            TargetState::Failed => "FAILED",
        }
    }

    /// Whether `via` may move a target from `self` to `next`.
    pub fn can_transition_to(&self, next: TargetState, via: &Transition) -> bool {
        use TargetState::*;
        matches!(
            (self, via, next),
            (New | Failed | UpdateRequired, Transition::Fetched { .. }, Downloaded)
                | (New | Failed, Transition::FetchFailed { .. }, Failed)
                | (UpdateRequired, Transition::FetchFailed { .. }, UpdateRequired)
                | (Downloaded, Transition::MarkForUpdate, UpdateRequired)
        )
    }

    /// States a download batch picks up.
    pub fn is_missing(&self) -> bool {
        matches!(self, TargetState::New | TargetState::Failed)
    }

    /// States that own a bundle.
    pub fn has_bundle(&self) -> bool {
        matches!(self, TargetState::Downloaded | TargetState::UpdateRequired)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "new" => Ok(TargetState::New),
            "downloaded" => Ok(TargetState::Downloaded),
            "update-required" => Ok(TargetState::UpdateRequired),
            "failed" => Ok(TargetState::Failed),
            other => Err(format!("unknown target state: {other}")),
        }
    }
}

/// Reference to a bundle directory under the project's `bundles/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleRef(String);

impl BundleRef {
    pub fn generate() -> Self {
        BundleRef(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BundleRef {
    fn from(s: &str) -> Self {
        BundleRef(s.to_string())
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive fields recorded after a successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub story_id: String,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub chapter_count: u32,
    #[serde(default)]
    pub remote_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    /// `download.include_images` at fetch time.
    #[serde(default)]
    pub images_requested: bool,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub identifier: String,
    pub state: TargetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TargetMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl Target {
    fn new(identifier: String) -> Self {
        Self {
            identifier,
            state: TargetState::New,
            bundle: None,
            metadata: None,
            last_failure: None,
            added_at: Utc::now(),
        }
    }

    /// Title from metadata, falling back to the identifier.
    pub fn display_title(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.title.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.identifier)
    }
}

/// The event driving a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Fetched {
        bundle: BundleRef,
        metadata: TargetMetadata,
    },
    FetchFailed {
        reason: String,
    },
    MarkForUpdate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Fetched { .. } => "fetch-succeeded",
            Transition::FetchFailed { .. } => "fetch-failed",
            Transition::MarkForUpdate => "mark-for-update",
        }
    }
}

/// Listing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    All,
    /// `NEW` or `FAILED`.
    Missing,
    State(TargetState),
}

impl StateFilter {
    pub fn matches(&self, state: TargetState) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Missing => state.is_missing(),
            StateFilter::State(s) => *s == state,
        }
    }
}

impl FromStr for StateFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(StateFilter::All),
            "missing" => Ok(StateFilter::Missing),
            other => other
                .parse::<TargetState>()
                .map(StateFilter::State)
                .map_err(|_| format!("unknown filter: {s} (expected all, new, downloaded, update-required, failed or missing)")),
        }
    }
}

/// Outcome of a bulk import.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BulkAddReport {
    pub added: Vec<String>,
    pub already_present: Vec<String>,
    /// `(line, reason)` for every line that was not a valid identifier.
    pub invalid: Vec<(String, String)>,
}

/// Per-state counts and totals over downloaded content.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistrySummary {
    pub total: usize,
    pub new: usize,
    pub downloaded: usize,
    pub update_required: usize,
    pub failed: usize,
    pub words: u64,
    pub chapters: u64,
    pub categories: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    targets: Vec<Target>,
}

#[derive(Debug)]
pub struct TargetRegistry {
    path: PathBuf,
    targets: Vec<Target>,
}

impl TargetRegistry {
    /// Write an empty registry to `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let registry = Self {
            path: path.as_ref().to_path_buf(),
            targets: Vec::new(),
        };
        registry.save()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;
        let doc: RegistryDocument =
            serde_json::from_str(&text).map_err(|source| RegistryError::Parse {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), targets = doc.targets.len(), "Loaded target registry");
        Ok(Self {
            path,
            targets: doc.targets,
        })
    }

    fn save(&self) -> Result<(), RegistryError> {
        let doc = RegistryDocument {
            version: REGISTRY_VERSION,
            targets: self.targets.clone(),
        };
        let text = serde_json::to_string_pretty(&doc).map_err(|source| RegistryError::Parse {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, text.as_bytes()).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.identifier == identifier)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    /// Register `identifier` as `NEW`. Returns `false` when it is already
    /// present, in which case nothing changes.
    pub fn add(&mut self, identifier: &str) -> Result<bool, RegistryError> {
        let identifier = normalize_identifier(identifier)?;
        if self.contains(&identifier) {
            debug!(identifier = %identifier, "Target already registered");
            return Ok(false);
        }
        self.targets.push(Target::new(identifier.clone()));
        if let Err(e) = self.save() {
            self.targets.pop();
            return Err(e);
        }
        info!(identifier = %identifier, "Registered new target");
        Ok(true)
    }

    /// Add every identifier of a plain-text list. Blank and `#` lines are
    /// skipped; invalid lines are reported, not fatal.
    pub fn bulk_add(&mut self, text: &str) -> Result<BulkAddReport, RegistryError> {
        self.add_many(list_lines(text))
    }

    /// [`add`](Self::add) for each identifier, saved once at the end.
    pub fn add_many<'a>(
        &mut self,
        identifiers: impl IntoIterator<Item = &'a str>,
    ) -> Result<BulkAddReport, RegistryError> {
        let mut report = BulkAddReport::default();
        let before = self.targets.len();
        for line in identifiers {
            match normalize_identifier(line) {
                Ok(identifier) if self.contains(&identifier) => {
                    report.already_present.push(identifier)
                }
                Ok(identifier) => {
                    self.targets.push(Target::new(identifier.clone()));
                    report.added.push(identifier);
                }
                Err(e) => report.invalid.push((line.to_string(), e.to_string())),
            }
        }
        if !report.added.is_empty() {
            if let Err(e) = self.save() {
                self.targets.truncate(before);
                return Err(e);
            }
        }
        info!(
            added = report.added.len(),
            already_present = report.already_present.len(),
            invalid = report.invalid.len(),
            "Imported target list"
        );
        Ok(report)
    }

    /// Targets matching `filter`, in insertion order.
    pub fn list(&self, filter: StateFilter) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(move |t| filter.matches(t.state))
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Apply one state machine edge and persist it.
    ///
    /// On a successful fetch the bundle the target owned before is returned
    /// so the caller can reclaim its storage.
    pub fn transition(
        &mut self,
        identifier: &str,
        to: TargetState,
        via: Transition,
    ) -> Result<Option<BundleRef>, RegistryError> {
        let index = self
            .targets
            .iter()
            .position(|t| t.identifier == identifier)
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;

        let from = self.targets[index].state;
        if !from.can_transition_to(to, &via) {
            return Err(RegistryError::InvalidTransition {
                identifier: identifier.to_string(),
                from,
                to,
                via: via.name(),
            });
        }

        let previous = self.targets[index].clone();
        let target = &mut self.targets[index];
        let mut displaced = None;
        match via {
            Transition::Fetched { bundle, metadata } => {
                let old = target.bundle.replace(bundle.clone());
                displaced = old.filter(|old| *old != bundle);
                target.metadata = Some(metadata);
                target.last_failure = None;
            }
            Transition::FetchFailed { reason } => {
                target.last_failure = Some(reason);
            }
            Transition::MarkForUpdate => {}
        }
        target.state = to;

        if let Err(e) = self.save() {
            self.targets[index] = previous;
            return Err(e);
        }
        info!(identifier, from = %from, to = %to, "Target transitioned");
        Ok(displaced)
    }

    /// Delete a target. Returns it so the caller can release its bundle.
    pub fn remove(&mut self, identifier: &str) -> Result<Target, RegistryError> {
        let identifier = normalize_identifier(identifier).unwrap_or_else(|_| identifier.to_string());
        let index = self
            .targets
            .iter()
            .position(|t| t.identifier == identifier)
            .ok_or_else(|| RegistryError::NotFound(identifier.clone()))?;
        let removed = self.targets.remove(index);
        if let Err(e) = self.save() {
            self.targets.insert(index, removed);
            return Err(e);
        }
        info!(identifier = %identifier, "Removed target");
        Ok(removed)
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            total: self.targets.len(),
            ..Default::default()
        };
        let mut categories = std::collections::BTreeSet::new();
        for target in &self.targets {
            match target.state {
                TargetState::New => summary.new += 1,
                TargetState::Downloaded => summary.downloaded += 1,
                TargetState::UpdateRequired => summary.update_required += 1,
                TargetState::Failed => summary.failed += 1,
            }
            if let (true, Some(meta)) = (target.state.has_bundle(), &target.metadata) {
                summary.words += meta.word_count;
                summary.chapters += u64::from(meta.chapter_count);
                if !meta.category.is_empty() {
                    categories.insert(meta.category.as_str());
                }
            }
        }
        summary.categories = categories.len();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, TargetRegistry) {
        let dir = tempdir().unwrap();
        let reg = TargetRegistry::create(dir.path().join("targets.json")).unwrap();
        (dir, reg)
    }

    fn fetched(bundle: &str, title: &str) -> Transition {
        Transition::Fetched {
            bundle: BundleRef::from(bundle),
            metadata: TargetMetadata {
                title: title.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn add_is_idempotent() {
        let (_dir, mut reg) = registry();
        assert!(reg.add("https://example.org/s/1").unwrap());
        assert!(!reg.add("https://example.org/s/1/").unwrap());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.targets()[0].state, TargetState::New);
        assert!(reg.targets()[0].bundle.is_none());
    }

    #[test]
    fn registry_survives_reload_in_insertion_order() {
        let (dir, mut reg) = registry();
        reg.add("3").unwrap();
        reg.add("1").unwrap();
        reg.add("2").unwrap();
        let reloaded = TargetRegistry::load(dir.path().join("targets.json")).unwrap();
        let ids: Vec<_> = reloaded.list(StateFilter::All).map(|t| t.identifier.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "https://www.fanfiction.net/s/3",
                "https://www.fanfiction.net/s/1",
                "https://www.fanfiction.net/s/2"
            ]
        );
    }

    #[test]
    fn bulk_add_skips_comments_and_reports_invalid_lines() {
        let (_dir, mut reg) = registry();
        reg.add("1").unwrap();
        let report = reg
            .bulk_add("# my list\n\n1\nhttps://www.fanfiction.net/s/2/1/x\nnot valid\n2\n")
            .unwrap();
        assert_eq!(report.added, vec!["https://www.fanfiction.net/s/2".to_string()]);
        assert_eq!(report.already_present.len(), 2);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn state_machine_edges() {
        use TargetState::*;
        let ok = fetched("b", "t");
        let fail = Transition::FetchFailed { reason: "x".into() };
        let mark = Transition::MarkForUpdate;

        assert!(New.can_transition_to(Downloaded, &ok));
        assert!(New.can_transition_to(Failed, &fail));
        assert!(Failed.can_transition_to(Downloaded, &ok));
        assert!(Failed.can_transition_to(Failed, &fail));
        assert!(Downloaded.can_transition_to(UpdateRequired, &mark));
        assert!(UpdateRequired.can_transition_to(Downloaded, &ok));
        assert!(UpdateRequired.can_transition_to(UpdateRequired, &fail));

        assert!(!UpdateRequired.can_transition_to(Downloaded, &mark));
        assert!(!UpdateRequired.can_transition_to(Failed, &fail));
        assert!(!Downloaded.can_transition_to(Downloaded, &ok));
        assert!(!New.can_transition_to(UpdateRequired, &mark));
        assert!(!Failed.can_transition_to(UpdateRequired, &mark));
    }

    #[test]
    fn invalid_transition_leaves_registry_unchanged() {
        let (dir, mut reg) = registry();
        reg.add("1").unwrap();
        let id = "https://www.fanfiction.net/s/1";
        reg.transition(id, TargetState::Downloaded, fetched("b1", "A")).unwrap();
        reg.transition(id, TargetState::UpdateRequired, Transition::MarkForUpdate).unwrap();

        let err = reg
            .transition(id, TargetState::Downloaded, Transition::MarkForUpdate)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { from: TargetState::UpdateRequired, .. }));

        let reloaded = TargetRegistry::load(dir.path().join("targets.json")).unwrap();
        assert_eq!(reloaded.get(id).unwrap().state, TargetState::UpdateRequired);
        assert_eq!(reloaded.get(id).unwrap().bundle, Some(BundleRef::from("b1")));
    }

    #[test]
    fn refetch_returns_displaced_bundle() {
        let (_dir, mut reg) = registry();
        reg.add("1").unwrap();
        let id = "https://www.fanfiction.net/s/1";
        assert_eq!(reg.transition(id, TargetState::Downloaded, fetched("b1", "A")).unwrap(), None);
        reg.transition(id, TargetState::UpdateRequired, Transition::MarkForUpdate).unwrap();
        let displaced = reg.transition(id, TargetState::Downloaded, fetched("b2", "A2")).unwrap();
        assert_eq!(displaced, Some(BundleRef::from("b1")));
        let target = reg.get(id).unwrap();
        assert_eq!(target.bundle, Some(BundleRef::from("b2")));
        assert_eq!(target.display_title(), "A2");
    }

    #[test]
    fn failed_update_keeps_bundle_and_records_reason() {
        let (_dir, mut reg) = registry();
        reg.add("1").unwrap();
        let id = "https://www.fanfiction.net/s/1";
        reg.transition(id, TargetState::Downloaded, fetched("b1", "A")).unwrap();
        reg.transition(id, TargetState::UpdateRequired, Transition::MarkForUpdate).unwrap();
        reg.transition(
            id,
            TargetState::UpdateRequired,
            Transition::FetchFailed { reason: "timeout".into() },
        )
        .unwrap();
        let target = reg.get(id).unwrap();
        assert_eq!(target.state, TargetState::UpdateRequired);
        assert_eq!(target.bundle, Some(BundleRef::from("b1")));
        assert_eq!(target.last_failure.as_deref(), Some("timeout"));
    }

    #[test]
    fn filters_and_summary() {
        let (_dir, mut reg) = registry();
        reg.bulk_add("1\n2\n3\n").unwrap();
        reg.transition(
            "https://www.fanfiction.net/s/2",
            TargetState::Downloaded,
            Transition::Fetched {
                bundle: BundleRef::from("b"),
                metadata: TargetMetadata {
                    title: "T".into(),
                    category: "Books".into(),
                    word_count: 1200,
                    chapter_count: 3,
                    ..Default::default()
                },
            },
        )
        .unwrap();
        reg.transition(
            "https://www.fanfiction.net/s/3",
            TargetState::Failed,
            Transition::FetchFailed { reason: "404".into() },
        )
        .unwrap();

        assert_eq!(reg.list(StateFilter::Missing).count(), 2);
        assert_eq!(reg.list("downloaded".parse().unwrap()).count(), 1);
        let summary = reg.summary();
        assert_eq!((summary.new, summary.downloaded, summary.failed), (1, 1, 1));
        assert_eq!((summary.words, summary.chapters, summary.categories), (1200, 3, 1));
    }

    #[test]
    fn remove_accepts_any_spelling() {
        let (_dir, mut reg) = registry();
        reg.add("7").unwrap();
        let removed = reg.remove("https://m.fanfiction.net/s/7/2").unwrap();
        assert_eq!(removed.identifier, "https://www.fanfiction.net/s/7");
        assert!(reg.is_empty());
        assert!(matches!(reg.remove("7"), Err(RegistryError::NotFound(_))));
    }
}
