use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use ff2zim_core::bundle::safe_file_name;
use ff2zim_core::config::BuildOptions;
use ff2zim_core::contract::{ExportOptions, PackageItem, Packager};
use ff2zim_core::error::PackageError;

use crate::site::{render_site, ILLUSTRATION_FILE, INDEX_PAGE};

/// Builds ZIM archives with zimwriterfs and EPUB exports with pandoc.
pub struct ZimPackager {
    zimwriterfs: String,
    pandoc: String,
}

impl ZimPackager {
    pub fn new(zimwriterfs: impl Into<String>, pandoc: impl Into<String>) -> Self {
        Self {
            zimwriterfs: zimwriterfs.into(),
            pandoc: pandoc.into(),
        }
    }

    pub fn zimwriterfs_args(options: &BuildOptions, site: &Path, destination: &Path, illustration: bool) -> Vec<String> {
        let mut args = vec!["-w".to_string(), INDEX_PAGE.to_string()];
        if illustration {
            args.extend(["-f".to_string(), ILLUSTRATION_FILE.to_string()]);
        }
        args.extend([
            "-l".to_string(),
            options.language.clone(),
            "-t".to_string(),
            options.title.clone(),
            "-d".to_string(),
            options.description.clone(),
            "-c".to_string(),
            options.creator.clone(),
            "-p".to_string(),
            options.publisher.clone(),
            "-i".to_string(),
            site.display().to_string(),
            destination.display().to_string(),
        ]);
        args
    }

    /// Where the export of `item` goes. Stories from subprojects carry the
    /// project name so a story packaged from several projects keeps one
    /// file per occurrence.
    pub fn export_path(item: &PackageItem, options: &ExportOptions) -> PathBuf {
        let mut dir = options.output_dir.clone();
        if options.group_by_category {
            dir = dir.join(safe_file_name(&item.category));
        }
        let title = if item.metadata.title.is_empty() {
            &item.identifier
        } else {
            &item.metadata.title
        };
        let mut name = safe_file_name(title);
        if !item.metadata.story_id.is_empty() {
            name = format!("{name} ({})", safe_file_name(&item.metadata.story_id));
        }
        if item.origin.depth > 0 {
            name = format!("{name} [{}]", safe_file_name(&item.origin.name));
        }
        dir.join(format!("{name}.epub"))
    }
}

async fn run_tool(program: &str, args: &[String], cwd: Option<&Path>) -> Result<(), PackageError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .await
        .map_err(|e| PackageError::new(format!("could not run {program}: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    Err(PackageError::new(format!(
        "{program} exited with {}: {last_line}",
        output.status
    )))
}

#[async_trait]
impl Packager for ZimPackager {
    async fn package(
        &self,
        items: &[PackageItem],
        options: &BuildOptions,
        destination: &Path,
    ) -> Result<(), PackageError> {
        let site = tempfile::Builder::new()
            .prefix("ff2zim-site-")
            .tempdir()
            .map_err(|e| PackageError::new(format!("could not create site directory: {e}")))?;
        let summary = render_site(items, options, site.path())
            .map_err(|e| PackageError::new(format!("could not render site: {e}")))?;
        debug!(?summary, site = %site.path().display(), "[BUILD] Rendered HTML site");

        // zimwriterfs refuses to overwrite an existing file.
        match tokio::fs::remove_file(destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PackageError::new(format!(
                    "could not clear {}: {e}",
                    destination.display()
                )))
            }
        }

        let args = Self::zimwriterfs_args(options, site.path(), destination, summary.has_illustration);
        info!(stories = summary.stories, images = summary.images, "[BUILD] Running zimwriterfs");
        run_tool(&self.zimwriterfs, &args, None).await
    }

    async fn package_single(
        &self,
        item: &PackageItem,
        options: &ExportOptions,
    ) -> Result<PathBuf, PackageError> {
        let out = Self::export_path(item, options);
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PackageError::new(format!("could not create {}: {e}", parent.display())))?;
        }
        let story_dir = item.story.parent().unwrap_or_else(|| Path::new("."));
        let args = vec![
            "-f".to_string(),
            "html".to_string(),
            "-t".to_string(),
            "epub3".to_string(),
            "--metadata".to_string(),
            format!("title={}", item.metadata.title),
            "--metadata".to_string(),
            format!("author={}", item.metadata.author),
            "--resource-path".to_string(),
            story_dir.display().to_string(),
            "-o".to_string(),
            out.display().to_string(),
            item.story.display().to_string(),
        ];
        if let Err(e) = run_tool(&self.pandoc, &args, None).await {
            warn!(identifier = %item.identifier, error = %e, "pandoc failed");
            return Err(e);
        }
        Ok(out)
    }
}
