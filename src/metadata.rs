//! Conversion of fanficfare's JSON metadata into [`TargetMetadata`].
//!
//! fanficfare reports everything as strings and the numeric fields are
//! formatted per site ("1,234", "12.5k", "(3)"), so each site gets its own
//! field mapping before the numbers are parsed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use ff2zim_core::registry::TargetMetadata;

/// Parse a site-formatted count: `"1,234"`, `"12.5k"`, `"2m"`, `"(3)"`.
/// Unparseable input counts as zero.
pub fn str_to_int(raw: &str) -> u64 {
    let mut s = raw.trim().to_lowercase().replace(['(', ')'], "");
    if s.matches('.').count() > 1 {
        // "1.234.567": dots are thousands separators
        s = s.replace('.', "");
    }
    s = s.replace(',', "");
    let (digits, multiplier) = if let Some(rest) = s.strip_suffix('k') {
        (rest, 1_000.0)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 1_000_000.0)
    } else {
        (s.as_str(), 1.0)
    };
    let digits = digits.trim();
    if digits.is_empty() {
        return 0;
    }
    digits
        .parse::<f64>()
        .map(|v| (v * multiplier).max(0.0) as u64)
        .unwrap_or(0)
}

fn field<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("")
}

fn count(data: &Value, key: &str) -> u64 {
    match data.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => str_to_int(s),
        _ => 0,
    }
}

/// fanficfare's `dateUpdated` is either a date or a date and time.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Build target metadata from fanficfare's `-j` output.
pub fn convert(data: &Value) -> TargetMetadata {
    let site = field(data, "siteabbrev").to_string();
    let word_count = match site.as_str() {
        // fanficsb only reports words per chapter
        "fsb" => data
            .get("zchapters")
            .and_then(Value::as_array)
            .map(|chapters| {
                chapters
                    .iter()
                    .filter_map(|c| c.get(1))
                    .map(|meta| count(meta, "kwords"))
                    .sum()
            })
            .unwrap_or(0),
        _ => count(data, "numWords"),
    };
    TargetMetadata {
        title: field(data, "title").to_string(),
        author: field(data, "author").to_string(),
        category: field(data, "category").to_string(),
        story_id: field(data, "storyId").to_string(),
        word_count,
        chapter_count: u32::try_from(count(data, "numChapters")).unwrap_or(u32::MAX),
        remote_updated_at: parse_date(field(data, "dateUpdated")),
        site,
        ..Default::default()
    }
}
