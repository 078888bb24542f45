//! Project option store.
//!
//! Options are grouped into named sections (`build`, `download`, `update`).
//! Every option is declared once in [`SCHEMA`] with a kind and a default, so
//! an unset option always resolves to its default and a name outside the
//! schema is rejected with [`ConfigError::UnknownOption`].
//!
//! Values are scalar (text, flag, number). Text input from the command line
//! is coerced once, in [`ConfigStore::set`]; everything downstream reads the
//! typed views [`BuildOptions`], [`DownloadOptions`] and [`UpdateOptions`].
//!
//! The store is backed by `project.yaml`. Reads go to disk every time and
//! every write is persisted atomically before returning, so hand edits of the
//! file and programmatic `set` calls never shadow each other.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::persist::write_atomic;

pub const CONFIG_VERSION: &str = "0.3";

/// Declared type of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Text,
    Flag,
    Number,
}

impl OptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Text => "text",
            OptionKind::Flag => "a boolean (true/false)",
            OptionKind::Number => "an integer",
        }
    }

    /// Coerce raw text into a value of this kind.
    pub fn coerce(self, raw: &str) -> Option<OptionValue> {
        match self {
            OptionKind::Text => Some(OptionValue::Text(raw.to_string())),
            OptionKind::Flag => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(OptionValue::Flag(true)),
                "false" | "no" | "off" | "0" => Some(OptionValue::Flag(false)),
                _ => None,
            },
            OptionKind::Number => raw.trim().parse().ok().map(OptionValue::Number),
        }
    }
}

/// A resolved scalar option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(i64),
    Text(String),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Flag(_) => OptionKind::Flag,
            OptionValue::Number(_) => OptionKind::Number,
            OptionValue::Text(_) => OptionKind::Text,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            OptionValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Flag(b) => write!(f, "{b}"),
            OptionValue::Number(n) => write!(f, "{n}"),
            OptionValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Schema entry for one option.
#[derive(Debug)]
pub struct OptionSpec {
    pub section: &'static str,
    pub name: &'static str,
    pub kind: OptionKind,
    /// Default in textual form; coerced with `kind` like user input.
    pub default: &'static str,
    pub help: &'static str,
}

impl OptionSpec {
    pub fn default_value(&self) -> OptionValue {
        self.kind
            .coerce(self.default)
            .unwrap_or_else(|| OptionValue::Text(self.default.to_string()))
    }

    fn accept(&self, value: OptionValue) -> Result<OptionValue, ConfigError> {
        if value.kind() == self.kind {
            return Ok(value);
        }
        let raw = value.to_string();
        self.kind.coerce(&raw).ok_or_else(|| ConfigError::InvalidValue {
            section: self.section.to_string(),
            option: self.name.to_string(),
            value: raw,
            expected: self.kind.as_str(),
        })
    }
}

pub const SECTIONS: &[&str] = &["build", "download", "update"];

pub const SCHEMA: &[OptionSpec] = &[
    OptionSpec { section: "build", name: "title", kind: OptionKind::Text, default: "fanfiction archive", help: "archive title" },
    OptionSpec { section: "build", name: "language", kind: OptionKind::Text, default: "EN", help: "archive language code" },
    OptionSpec { section: "build", name: "description", kind: OptionKind::Text, default: "Archived fanfictions", help: "archive description" },
    OptionSpec { section: "build", name: "creator", kind: OptionKind::Text, default: "various", help: "archive creator" },
    OptionSpec { section: "build", name: "publisher", kind: OptionKind::Text, default: "UNKNOWN", help: "archive publisher" },
    OptionSpec { section: "build", name: "include_images", kind: OptionKind::Flag, default: "true", help: "package images that were fetched" },
    OptionSpec { section: "build", name: "include_epubs", kind: OptionKind::Flag, default: "false", help: "embed a per-story EPUB export" },
    OptionSpec { section: "build", name: "epubs_by_category", kind: OptionKind::Flag, default: "false", help: "group embedded EPUBs by category" },
    OptionSpec { section: "build", name: "minify", kind: OptionKind::Flag, default: "false", help: "minify story HTML before packaging" },
    OptionSpec { section: "build", name: "deduplicate", kind: OptionKind::Flag, default: "true", help: "package an identifier found in several projects once" },
    OptionSpec { section: "build", name: "illustration", kind: OptionKind::Text, default: "", help: "path of the archive illustration, relative to the project" },
    OptionSpec { section: "download", name: "include_images", kind: OptionKind::Flag, default: "true", help: "ask the fetcher for images" },
    OptionSpec { section: "download", name: "is_adult", kind: OptionKind::Flag, default: "true", help: "confirm adult content to the fetcher" },
    OptionSpec { section: "update", name: "mark_read", kind: OptionKind::Flag, default: "true", help: "mark processed update notifications as read" },
];

/// Look up the schema entry for `section.option`.
pub fn spec_for(section: &str, option: &str) -> Result<&'static OptionSpec, ConfigError> {
    SCHEMA
        .iter()
        .find(|spec| spec.section == section && spec.name == option)
        .ok_or_else(|| ConfigError::UnknownOption {
            section: section.to_string(),
            option: option.to_string(),
        })
}

/// On-disk shape of `project.yaml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(flatten)]
    sections: BTreeMap<String, BTreeMap<String, OptionValue>>,
}

/// Sectioned option store backed by a YAML document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a fresh options file holding only the version marker.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let store = Self::open(path);
        let doc = ConfigDocument {
            version: Some(CONFIG_VERSION.to_string()),
            sections: BTreeMap::new(),
        };
        store.save(&doc)?;
        info!(path = %store.path.display(), "Created project options file");
        Ok(store)
    }

    /// Attach to an existing options file. Nothing is read until first use.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<ConfigDocument, ConfigError> {
        if !self.path.exists() {
            return Ok(ConfigDocument::default());
        }
        let text = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(ConfigDocument::default());
        }
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, doc: &ConfigDocument) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(doc).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, text.as_bytes()).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// The configured value of `section.option`, or its default when unset.
    pub fn get(&self, section: &str, option: &str) -> Result<OptionValue, ConfigError> {
        let spec = spec_for(section, option)?;
        let doc = self.load()?;
        match doc.sections.get(section).and_then(|s| s.get(option)) {
            Some(value) => spec.accept(value.clone()),
            None => Ok(spec.default_value()),
        }
    }

    /// Coerce `raw` to the option's declared kind and persist it.
    pub fn set(&self, section: &str, option: &str, raw: &str) -> Result<OptionValue, ConfigError> {
        let spec = spec_for(section, option)?;
        let value = spec.kind.coerce(raw).ok_or_else(|| ConfigError::InvalidValue {
            section: section.to_string(),
            option: option.to_string(),
            value: raw.to_string(),
            expected: spec.kind.as_str(),
        })?;
        self.set_value(section, option, value.clone())?;
        Ok(value)
    }

    /// Persist an already typed value.
    pub fn set_value(&self, section: &str, option: &str, value: OptionValue) -> Result<(), ConfigError> {
        let spec = spec_for(section, option)?;
        let value = spec.accept(value)?;
        let mut doc = self.load()?;
        if doc.version.is_none() {
            doc.version = Some(CONFIG_VERSION.to_string());
        }
        debug!(section, option, value = %value, "Setting project option");
        doc.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value);
        self.save(&doc)
    }

    /// Drop an explicit value so the option falls back to its default.
    /// Returns whether a value was present.
    pub fn unset(&self, section: &str, option: &str) -> Result<bool, ConfigError> {
        spec_for(section, option)?;
        let mut doc = self.load()?;
        let removed = doc
            .sections
            .get_mut(section)
            .and_then(|s| s.remove(option))
            .is_some();
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    /// Every schema option of `section`, resolved to its explicit value or default.
    pub fn effective_section(&self, section: &str) -> Result<BTreeMap<&'static str, OptionValue>, ConfigError> {
        if !SECTIONS.contains(&section) {
            return Err(ConfigError::UnknownOption {
                section: section.to_string(),
                option: "*".to_string(),
            });
        }
        let doc = self.load()?;
        let stored = doc.sections.get(section);
        if let Some(stored) = stored {
            for key in stored.keys() {
                if spec_for(section, key).is_err() {
                    warn!(section, option = %key, "Ignoring option outside the schema");
                }
            }
        }
        let mut resolved = BTreeMap::new();
        for spec in SCHEMA.iter().filter(|spec| spec.section == section) {
            let value = match stored.and_then(|s| s.get(spec.name)) {
                Some(value) => spec.accept(value.clone())?,
                None => spec.default_value(),
            };
            resolved.insert(spec.name, value);
        }
        Ok(resolved)
    }

    pub fn build_options(&self) -> Result<BuildOptions, ConfigError> {
        let s = self.effective_section("build")?;
        let illustration = text(&s, "illustration");
        Ok(BuildOptions {
            title: text(&s, "title"),
            language: text(&s, "language"),
            description: text(&s, "description"),
            creator: text(&s, "creator"),
            publisher: text(&s, "publisher"),
            include_images: flag(&s, "include_images"),
            include_epubs: flag(&s, "include_epubs"),
            epubs_by_category: flag(&s, "epubs_by_category"),
            minify: flag(&s, "minify"),
            deduplicate: flag(&s, "deduplicate"),
            illustration: (!illustration.is_empty()).then_some(illustration),
        })
    }

    pub fn download_options(&self) -> Result<DownloadOptions, ConfigError> {
        let s = self.effective_section("download")?;
        Ok(DownloadOptions {
            include_images: flag(&s, "include_images"),
            is_adult: flag(&s, "is_adult"),
        })
    }

    pub fn update_options(&self) -> Result<UpdateOptions, ConfigError> {
        let s = self.effective_section("update")?;
        Ok(UpdateOptions {
            mark_read: flag(&s, "mark_read"),
        })
    }
}

fn text(section: &BTreeMap<&'static str, OptionValue>, name: &str) -> String {
    section.get(name).map(|v| v.to_string()).unwrap_or_default()
}

fn flag(section: &BTreeMap<&'static str, OptionValue>, name: &str) -> bool {
    section.get(name).and_then(OptionValue::as_flag).unwrap_or(false)
}

/// Effective `build` section, as seen by the build pipeline and packager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub title: String,
    pub language: String,
    pub description: String,
    pub creator: String,
    pub publisher: String,
    pub include_images: bool,
    pub include_epubs: bool,
    pub epubs_by_category: bool,
    pub minify: bool,
    pub deduplicate: bool,
    pub illustration: Option<String>,
}

/// Effective `download` section, handed to the fetcher on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub include_images: bool,
    pub is_adult: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            include_images: true,
            is_adult: true,
        }
    }
}

/// Effective `update` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub mark_read: bool,
}
