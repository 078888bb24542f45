//! Lifecycle engine: fetch attempts and marking targets for update.
//!
//! A fetch attempt always gets a fresh bundle directory. On success the
//! target is moved to `DOWNLOADED` and the bundle it owned before (if any) is
//! deleted; on failure the fresh directory is deleted and the failure reason
//! is recorded on the target. Batch operations never stop on a failed fetch.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bundle::content_hash;
use crate::config::DownloadOptions;
use crate::contract::Fetcher;
use crate::error::{LifecycleError, RegistryError};
use crate::identifier::normalize_identifier;
use crate::project::Project;
use crate::registry::{BundleRef, TargetState, Transition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Fetched { bundle: BundleRef, title: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub identifier: String,
    pub from: TargetState,
    pub to: TargetState,
    pub outcome: AttemptOutcome,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Fetched { .. })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub attempts: Vec<AttemptReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.attempts.iter().filter(|a| a.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempts.len() - self.succeeded()
    }
}

/// Result of asking for a target to be re-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyPending,
    /// `NEW` or `FAILED`: the next download picks it up anyway.
    NotYetDownloaded,
}

/// One fetch attempt for `identifier`.
///
/// Fetcher failures are recorded on the target and reported in the returned
/// [`AttemptReport`]; only registry or storage problems are errors.
pub async fn fetch_target(
    project: &mut Project,
    fetcher: &dyn Fetcher,
    identifier: &str,
    options: &DownloadOptions,
) -> Result<AttemptReport, LifecycleError> {
    let from = project
        .registry()
        .get(identifier)
        .map(|t| t.state)
        .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;
    if !(from.is_missing() || from == TargetState::UpdateRequired) {
        return Err(RegistryError::InvalidTransition {
            identifier: identifier.to_string(),
            from,
            to: TargetState::Downloaded,
            via: "fetch-succeeded",
        }
        .into());
    }

    let (bundle, dir) = project.allocate_bundle()?;
    debug!(identifier, bundle = %bundle, "Fetching into fresh bundle");

    let fetched = match fetcher.fetch(identifier, options, &dir).await {
        Ok(mut metadata) => match content_hash(&dir) {
            Ok(hash) => {
                metadata.content_hash = Some(hash);
                metadata.images_requested = options.include_images;
                if metadata.fetched_at.is_none() {
                    metadata.fetched_at = Some(Utc::now());
                }
                Ok(metadata)
            }
            Err(e) => Err(format!("fetcher reported success but left no story: {e}")),
        },
        Err(failure) => Err(failure.reason),
    };

    match fetched {
        Ok(metadata) => {
            let title = metadata.title.clone();
            let transition = Transition::Fetched {
                bundle: bundle.clone(),
                metadata,
            };
            let displaced = match project.registry_mut().transition(
                identifier,
                TargetState::Downloaded,
                transition,
            ) {
                Ok(displaced) => displaced,
                Err(e) => {
                    discard_quietly(project, &bundle);
                    return Err(e.into());
                }
            };
            if let Some(old) = displaced {
                discard_quietly(project, &old);
            }
            info!(identifier, title = %title, bundle = %bundle, "Fetch succeeded");
            Ok(AttemptReport {
                identifier: identifier.to_string(),
                from,
                to: TargetState::Downloaded,
                outcome: AttemptOutcome::Fetched { bundle, title },
            })
        }
        Err(reason) => {
            discard_quietly(project, &bundle);
            let to = if from == TargetState::UpdateRequired {
                TargetState::UpdateRequired
            } else {
                TargetState::Failed
            };
            project.registry_mut().transition(
                identifier,
                to,
                Transition::FetchFailed {
                    reason: reason.clone(),
                },
            )?;
            warn!(identifier, reason = %reason, state = %to, "Fetch failed");
            Ok(AttemptReport {
                identifier: identifier.to_string(),
                from,
                to,
                outcome: AttemptOutcome::Failed { reason },
            })
        }
    }
}

fn discard_quietly(project: &Project, bundle: &BundleRef) {
    if let Err(e) = project.discard_bundle(bundle) {
        warn!(bundle = %bundle, error = %e, "Could not delete bundle directory");
    }
}

async fn run_batch(
    project: &mut Project,
    fetcher: &dyn Fetcher,
    stage: &str,
    select: fn(&TargetState) -> bool,
    limit: Option<usize>,
) -> Result<BatchReport, LifecycleError> {
    let options = project.config().download_options()?;
    let queue: Vec<String> = project
        .registry()
        .targets()
        .iter()
        .filter(|t| select(&t.state))
        .map(|t| t.identifier.clone())
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    info!(stage, queued = queue.len(), "[{stage}] Starting batch");
    let mut report = BatchReport::default();
    for (index, identifier) in queue.iter().enumerate() {
        info!(
            stage,
            identifier = %identifier,
            position = index + 1,
            total = queue.len(),
            "[{stage}] Attempting fetch"
        );
        let attempt = fetch_target(project, fetcher, identifier, &options).await?;
        report.attempts.push(attempt);
    }
    info!(
        stage,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "[{stage}] Batch finished"
    );
    Ok(report)
}

/// Fetch every `NEW` or `FAILED` target, in registry order.
pub async fn download_all(
    project: &mut Project,
    fetcher: &dyn Fetcher,
) -> Result<BatchReport, LifecycleError> {
    run_batch(project, fetcher, "DOWNLOAD", TargetState::is_missing, None).await
}

/// Like [`download_all`], stopping after `n` attempts.
pub async fn download_n(
    project: &mut Project,
    fetcher: &dyn Fetcher,
    n: usize,
) -> Result<BatchReport, LifecycleError> {
    run_batch(project, fetcher, "DOWNLOAD", TargetState::is_missing, Some(n)).await
}

fn is_pending_update(state: &TargetState) -> bool {
    *state == TargetState::UpdateRequired
}

/// Re-fetch every `UPDATE_REQUIRED` target, in registry order.
pub async fn update_all(
    project: &mut Project,
    fetcher: &dyn Fetcher,
) -> Result<BatchReport, LifecycleError> {
    run_batch(project, fetcher, "UPDATE", is_pending_update, None).await
}

pub async fn update_n(
    project: &mut Project,
    fetcher: &dyn Fetcher,
    n: usize,
) -> Result<BatchReport, LifecycleError> {
    run_batch(project, fetcher, "UPDATE", is_pending_update, Some(n)).await
}

/// Queue a downloaded target for re-fetch. Targets without content yet are
/// left alone.
pub fn mark_for_update(project: &mut Project, identifier: &str) -> Result<MarkOutcome, LifecycleError> {
    let identifier = normalize_identifier(identifier)?;
    let state = project
        .registry()
        .get(&identifier)
        .map(|t| t.state)
        .ok_or_else(|| RegistryError::NotFound(identifier.clone()))?;
    match state {
        TargetState::Downloaded => {
            project.registry_mut().transition(
                &identifier,
                TargetState::UpdateRequired,
                Transition::MarkForUpdate,
            )?;
            info!(identifier = %identifier, "[UPDATE] Marked for update");
            Ok(MarkOutcome::Marked)
        }
        TargetState::UpdateRequired => Ok(MarkOutcome::AlreadyPending),
        TargetState::New | TargetState::Failed => {
            debug!(identifier = %identifier, state = %state, "Not downloaded yet, nothing to mark");
            Ok(MarkOutcome::NotYetDownloaded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::STORY_FILE;
    use crate::contract::MockFetcher;
    use crate::error::FetchFailure;
    use crate::registry::TargetMetadata;
    use tempfile::tempdir;

    fn writes_story(title: &'static str) -> MockFetcher {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(move |_, _, dir| {
            std::fs::write(dir.join(STORY_FILE), title).unwrap();
            Ok(TargetMetadata {
                title: title.into(),
                ..Default::default()
            })
        });
        fetcher
    }

    #[tokio::test]
    async fn success_without_story_counts_as_failure() {
        let dir = tempdir().unwrap();
        let mut project = Project::init(dir.path().join("p")).unwrap();
        project.registry_mut().add("1").unwrap();

        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _, _| Ok(TargetMetadata::default()));

        let report = download_all(&mut project, &fetcher).await.unwrap();
        assert_eq!(report.failed(), 1);
        let target = &project.registry().targets()[0];
        assert_eq!(target.state, TargetState::Failed);
        assert!(target.bundle.is_none());
        let bundles = std::fs::read_dir(dir.path().join("p/bundles")).unwrap().count();
        assert_eq!(bundles, 0);
    }

    #[tokio::test]
    async fn fetch_records_fetch_time_hash_and_image_request() {
        let dir = tempdir().unwrap();
        let mut project = Project::init(dir.path().join("p")).unwrap();
        project.registry_mut().add("1").unwrap();
        project.config().set("download", "include_images", "false").unwrap();

        download_all(&mut project, &writes_story("A")).await.unwrap();

        let meta = project.registry().targets()[0].metadata.clone().unwrap();
        assert!(meta.fetched_at.is_some());
        assert!(meta.content_hash.is_some());
        assert!(!meta.images_requested);
    }

    #[tokio::test]
    async fn downloaded_target_cannot_be_fetched_directly() {
        let dir = tempdir().unwrap();
        let mut project = Project::init(dir.path().join("p")).unwrap();
        project.registry_mut().add("1").unwrap();
        download_all(&mut project, &writes_story("A")).await.unwrap();

        let mut never = MockFetcher::new();
        never.expect_fetch().never();
        let err = fetch_target(
            &mut project,
            &never,
            "https://www.fanfiction.net/s/1",
            &DownloadOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Registry(RegistryError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failed_fetch_records_reason() {
        let dir = tempdir().unwrap();
        let mut project = Project::init(dir.path().join("p")).unwrap();
        project.registry_mut().add("1").unwrap();

        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _, _| Err(FetchFailure::new("story not found")));

        let report = download_n(&mut project, &fetcher, 5).await.unwrap();
        assert_eq!(report.attempts.len(), 1);
        let target = &project.registry().targets()[0];
        assert_eq!(target.state, TargetState::Failed);
        assert_eq!(target.last_failure.as_deref(), Some("story not found"));
    }

    #[test]
    fn marking_only_moves_downloaded_targets() {
        let dir = tempdir().unwrap();
        let mut project = Project::init(dir.path().join("p")).unwrap();
        project.registry_mut().add("1").unwrap();
        assert_eq!(
            mark_for_update(&mut project, "1").unwrap(),
            MarkOutcome::NotYetDownloaded
        );
        assert!(matches!(
            mark_for_update(&mut project, "2"),
            Err(LifecycleError::Registry(RegistryError::NotFound(_)))
        ));
    }
}
