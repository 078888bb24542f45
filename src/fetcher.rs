use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use ff2zim_core::bundle::{METADATA_FILE, STORY_FILE};
use ff2zim_core::config::DownloadOptions;
use ff2zim_core::contract::Fetcher;
use ff2zim_core::error::FetchFailure;
use ff2zim_core::registry::TargetMetadata;

use crate::metadata::convert;

/// Fetches stories by running fanficfare.
pub struct FanFicFareFetcher {
    program: String,
}

impl FanFicFareFetcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for one fetch into `bundle_dir`.
    pub fn args(identifier: &str, options: &DownloadOptions, bundle_dir: &Path) -> Vec<String> {
        let output = bundle_dir.join("story${formatext}");
        let mut args = vec![
            "-f".to_string(),
            "html".to_string(),
            "-j".to_string(),
            "--non-interactive".to_string(),
            "-o".to_string(),
            format!("is_adult={}", options.is_adult),
            "-o".to_string(),
            format!("output_filename={}", output.display()),
        ];
        if options.include_images {
            args.extend([
                "-o".to_string(),
                "include_images=true".to_string(),
                "-o".to_string(),
                "skip_author_cover=false".to_string(),
            ]);
        }
        args.push(identifier.to_string());
        args
    }
}

#[async_trait]
impl Fetcher for FanFicFareFetcher {
    async fn fetch(
        &self,
        identifier: &str,
        options: &DownloadOptions,
        bundle_dir: &Path,
    ) -> Result<TargetMetadata, FetchFailure> {
        let args = Self::args(identifier, options, bundle_dir);
        debug!(program = %self.program, ?args, "[DOWNLOAD] Running fetcher");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FetchFailure::new(format!("could not run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            warn!(identifier, status = ?output.status, stderr = %last_line, "[DOWNLOAD] fanficfare failed");
            return Err(FetchFailure::new(format!(
                "fanficfare exited with {}: {last_line}",
                output.status
            )));
        }
        if !bundle_dir.join(STORY_FILE).is_file() {
            return Err(FetchFailure::new("fanficfare finished without writing a story"));
        }

        let data: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchFailure::new(format!("unreadable fanficfare metadata: {e}")))?;
        let pretty = serde_json::to_vec_pretty(&data)
            .map_err(|e| FetchFailure::new(format!("could not encode metadata: {e}")))?;
        tokio::fs::write(bundle_dir.join(METADATA_FILE), pretty)
            .await
            .map_err(|e| FetchFailure::new(format!("could not write metadata: {e}")))?;

        let metadata = convert(&data);
        info!(identifier, title = %metadata.title, words = metadata.word_count, "[DOWNLOAD] Story fetched");
        Ok(metadata)
    }
}
