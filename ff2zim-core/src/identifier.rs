//! Canonical target identifiers.
//!
//! The same story must never be registered twice under different spellings,
//! so every identifier passes through [`normalize_identifier`] before it
//! reaches the registry.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::RegistryError;

const FFNET_STORY_BASE: &str = "https://www.fanfiction.net/s/";

fn ffnet_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:https?://)?(?:www\.|m\.)?fanfiction\.net/s/(\d+)(?:[/?#].*)?$")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn ffnet_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:https?://)?(?:www\.|m\.)?fanfiction\.net/s/(\d+)")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Canonical fanfiction.net URL for a numeric story id.
pub fn canonical_ffnet(story_id: &str) -> String {
    format!("{FFNET_STORY_BASE}{story_id}")
}

/// Normalise user input into the identifier stored in the registry.
///
/// * a bare positive number is a fanfiction.net story id
/// * fanfiction.net story URLs collapse to `https://www.fanfiction.net/s/<id>`
/// * any other `http(s)` URL is kept without its trailing `/`
pub fn normalize_identifier(input: &str) -> Result<String, RegistryError> {
    let trimmed = input.trim();
    let invalid = |reason| RegistryError::InvalidIdentifier {
        input: input.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("identifier is empty"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(invalid("identifier contains whitespace"));
    }
    let story_id = if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        Some(trimmed)
    } else {
        ffnet_url().captures(trimmed).and_then(|caps| caps.get(1)).map(|m| m.as_str())
    };
    if let Some(story_id) = story_id {
        let id = story_id.trim_start_matches('0');
        if id.is_empty() {
            return Err(invalid("story id must be positive"));
        }
        return Ok(canonical_ffnet(id));
    }

    let lower = trimmed.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .ok_or_else(|| invalid("expected a story id or an http(s) URL"))?;
    if rest.trim_end_matches('/').is_empty() || rest.starts_with('/') {
        return Err(invalid("URL has no host"));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Every fanfiction.net story referenced in `text`, canonicalised, in order
/// of first appearance.
pub fn find_story_identifiers(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in ffnet_link().captures_iter(text) {
        let id = caps[1].trim_start_matches('0');
        if id.is_empty() {
            continue;
        }
        let url = canonical_ffnet(id);
        if !found.contains(&url) {
            found.push(url);
        }
    }
    found
}
