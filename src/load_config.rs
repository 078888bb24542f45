use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{error, info};

/// Settings for the external tools. These belong to the machine, not to a
/// project, so they live outside the project's `project.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub fanficfare: String,
    pub zimwriterfs: String,
    pub pandoc: String,
    pub minify: String,
    pub mail: MailSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    /// Maildir folder holding update notifications.
    pub maildir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    /// Pause between listing pages, in milliseconds.
    pub page_delay_ms: u64,
    pub max_pages: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            fanficfare: "fanficfare".into(),
            zimwriterfs: "zimwriterfs".into(),
            pandoc: "pandoc".into(),
            minify: "minify".into(),
            mail: MailSettings::default(),
            http: HttpSettings::default(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("ff2zim/", env!("CARGO_PKG_VERSION")).into(),
            page_delay_ms: 1000,
            max_pages: 50,
        }
    }
}

/// Load tool settings from `path`, or defaults when no file is given.
/// Missing keys fall back to their defaults.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<ToolSettings> {
    let Some(path) = path else {
        return Ok(ToolSettings::default());
    };
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading tool settings from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read settings file");
        e
    })
    .with_context(|| format!("Failed to read settings file {}", path_ref.display()))?;

    if content.trim().is_empty() {
        return Ok(ToolSettings::default());
    }
    let settings: ToolSettings = serde_yaml::from_str(&content)
        .map_err(|e| {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse settings YAML");
            e
        })
        .with_context(|| format!("Failed to parse settings file {}", path_ref.display()))?;
    info!(config_path = ?path_ref, "Parsed tool settings successfully");
    Ok(settings)
}
