//! Update detection.
//!
//! Two strategies feed [`mark_for_update`]: a passive scan of a mailbox
//! holding update notifications, and an active re-scan of a remote category
//! listing. Neither fetches anything; they only queue targets.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::contract::{CategoryLister, KnownStories, MailSource};
use crate::error::DetectError;
use crate::identifier::normalize_identifier;
use crate::lifecycle::{mark_for_update, MarkOutcome};
use crate::project::Project;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MailScanReport {
    pub messages: usize,
    /// Targets moved to `UPDATE_REQUIRED` by this scan.
    pub marked: Vec<String>,
    pub already_pending: Vec<String>,
    pub not_downloaded: Vec<String>,
    /// Identifiers found in mail that are not in the registry.
    pub unknown: Vec<String>,
    /// Ids of messages no identifier could be extracted from. Left unread.
    pub unextracted: Vec<String>,
    pub marked_read: Vec<String>,
    /// `(message id, reason)`; these stay unread and are seen again next scan.
    pub mark_read_failures: Vec<(String, String)>,
}

/// Scan unread notifications and queue the targets they mention.
///
/// A message is marked read only after its identifier was extracted and the
/// target (if registered) was marked. Messages without an identifier stay
/// unread for the next scan. With `update.mark_read = false` nothing is
/// marked read at all.
pub async fn scan_mailbox(
    project: &mut Project,
    source: &dyn MailSource,
) -> Result<MailScanReport, DetectError> {
    let mark_read = project.config().update_options()?.mark_read;
    let messages = source.list_unread().await?;
    let mut report = MailScanReport {
        messages: messages.len(),
        ..Default::default()
    };
    info!(messages = messages.len(), "Scanning mailbox for update notifications");

    for message in &messages {
        let identifier = match source
            .extract_identifier(message)
            .and_then(|raw| normalize_identifier(&raw).ok())
        {
            Some(identifier) => identifier,
            None => {
                warn!(message = %message.id, subject = %message.subject, "No story identifier in message; leaving it unread");
                report.unextracted.push(message.id.clone());
                continue;
            }
        };

        if project.registry().contains(&identifier) {
            match mark_for_update(project, &identifier)? {
                MarkOutcome::Marked => report.marked.push(identifier.clone()),
                MarkOutcome::AlreadyPending => report.already_pending.push(identifier.clone()),
                MarkOutcome::NotYetDownloaded => report.not_downloaded.push(identifier.clone()),
            }
        } else {
            debug!(identifier = %identifier, "Notification for an untracked story");
            report.unknown.push(identifier.clone());
        }

        if !mark_read {
            continue;
        }
        match source.mark_read(message).await {
            Ok(()) => report.marked_read.push(message.id.clone()),
            Err(e) => {
                warn!(message = %message.id, error = %e, "Could not mark message read");
                report.mark_read_failures.push((message.id.clone(), e.reason));
            }
        }
    }

    info!(
        marked = report.marked.len(),
        unknown = report.unknown.len(),
        unextracted = report.unextracted.len(),
        marked_read = report.marked_read.len(),
        "Mailbox scan finished"
    );
    Ok(report)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CategoryScanReport {
    pub listed: usize,
    /// Registered as `NEW` by this scan.
    pub added: Vec<String>,
    /// Moved to `UPDATE_REQUIRED` by this scan.
    pub marked: Vec<String>,
    pub unchanged: usize,
    /// `(identifier, reason)` for listing entries that are not valid identifiers.
    pub invalid: Vec<(String, String)>,
}

/// Diff a remote category against the registry: unknown stories are added,
/// known stories the listing reports as changed are queued for update.
pub async fn scan_category(
    project: &mut Project,
    lister: &dyn CategoryLister,
    category: &str,
) -> Result<CategoryScanReport, DetectError> {
    let known: KnownStories = project
        .registry()
        .targets()
        .iter()
        .filter(|t| t.state.has_bundle())
        .filter_map(|t| {
            let fetched_at = t.metadata.as_ref()?.fetched_at?;
            Some((t.identifier.clone(), fetched_at))
        })
        .collect();

    let listed = lister.list_category(category, &known).await?;
    let mut report = CategoryScanReport {
        listed: listed.len(),
        ..Default::default()
    };
    info!(category, listed = listed.len(), "Scanning remote category");

    let mut absent = Vec::new();
    let mut changed = Vec::new();
    let mut seen = BTreeSet::new();
    for story in &listed {
        let identifier = match normalize_identifier(&story.identifier) {
            Ok(identifier) => identifier,
            Err(e) => {
                report.invalid.push((story.identifier.clone(), e.to_string()));
                continue;
            }
        };
        if !seen.insert(identifier.clone()) {
            continue;
        }
        if !project.registry().contains(&identifier) {
            absent.push(identifier);
        } else if story.changed {
            changed.push(identifier);
        } else {
            report.unchanged += 1;
        }
    }

    let added = project
        .registry_mut()
        .add_many(absent.iter().map(String::as_str))?;
    report.added = added.added;

    for identifier in changed {
        match mark_for_update(project, &identifier)? {
            MarkOutcome::Marked => report.marked.push(identifier),
            MarkOutcome::AlreadyPending | MarkOutcome::NotYetDownloaded => report.unchanged += 1,
        }
    }

    info!(
        category,
        added = report.added.len(),
        marked = report.marked.len(),
        unchanged = report.unchanged,
        "Category scan finished"
    );
    Ok(report)
}
