//! Maildir-backed source of update notifications.
//!
//! A message is unread while it sits in `new/`, or in `cur/` without the
//! `S` (seen) flag. Marking it read moves it to `cur/` and adds the flag.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mailparse::{MailHeaderMap, ParsedMail};
use tracing::{debug, warn};

use ff2zim_core::contract::{MailMessage, MailSource};
use ff2zim_core::error::MailError;
use ff2zim_core::identifier::find_story_identifiers;

const INFO_SEPARATOR: &str = ":2,";

pub struct MaildirSource {
    root: PathBuf,
}

impl MaildirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_dir(&self, sub: &str, unread_only: bool, out: &mut Vec<MailMessage>) -> Result<(), MailError> {
        let dir = self.root.join(sub);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| MailError::new(format!("could not read {}: {e}", dir.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MailError::new(format!("could not read {}: {e}", dir.display())))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if unread_only && flags(&name).contains('S') {
                continue;
            }
            let raw = match tokio::fs::read(entry.path()).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %entry.path().display(), error = %e, "Skipping unreadable message");
                    continue;
                }
            };
            let (subject, body) = parse_message(&raw);
            out.push(MailMessage {
                id: format!("{sub}/{name}"),
                subject,
                body,
            });
        }
        Ok(())
    }
}

fn flags(name: &str) -> &str {
    name.split_once(INFO_SEPARATOR).map(|(_, f)| f).unwrap_or("")
}

/// Subject and decoded text of a raw message. Every `text/*` part is
/// decoded from its transfer encoding and charset and joined in order.
pub fn parse_message(raw: &[u8]) -> (String, String) {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Unparseable message, scanning it as plain text");
            return (String::new(), String::from_utf8_lossy(raw).into_owned());
        }
    };
    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let mut texts = Vec::new();
    collect_text(&parsed, &mut texts);
    (subject, texts.join("\n"))
}

fn collect_text(part: &ParsedMail<'_>, out: &mut Vec<String>) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_text(sub, out);
        }
        return;
    }
    if !part.ctype.mimetype.starts_with("text/") {
        return;
    }
    match part.get_body() {
        Ok(body) => out.push(body),
        Err(e) => debug!(mimetype = %part.ctype.mimetype, error = %e, "Skipping undecodable part"),
    }
}

#[async_trait]
impl MailSource for MaildirSource {
    async fn list_unread(&self) -> Result<Vec<MailMessage>, MailError> {
        let mut messages = Vec::new();
        self.read_dir("new", false, &mut messages).await?;
        self.read_dir("cur", true, &mut messages).await?;
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(maildir = %self.root.display(), unread = messages.len(), "Listed unread messages");
        Ok(messages)
    }

    async fn mark_read(&self, message: &MailMessage) -> Result<(), MailError> {
        let (_, name) = message
            .id
            .split_once('/')
            .ok_or_else(|| MailError::new(format!("malformed message id {}", message.id)))?;
        let (base, current) = name.split_once(INFO_SEPARATOR).unwrap_or((name, ""));
        if current.contains('S') && message.id.starts_with("cur/") {
            return Ok(());
        }
        let mut new_flags: Vec<char> = current.chars().chain(['S']).collect();
        new_flags.sort_unstable();
        new_flags.dedup();
        let new_flags: String = new_flags.into_iter().collect();

        let from = self.root.join(&message.id);
        let to = self.root.join("cur").join(format!("{base}{INFO_SEPARATOR}{new_flags}"));
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| MailError::new(format!("could not move {}: {e}", from.display())))?;
        debug!(from = %from.display(), to = %to.display(), "Marked message read");
        Ok(())
    }

    fn extract_identifier(&self, message: &MailMessage) -> Option<String> {
        let text = format!("{}\n{}", message.subject, message.body);
        find_story_identifiers(&text).into_iter().next()
    }
}
