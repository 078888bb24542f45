//! Build pipeline.
//!
//! `build` resolves the project tree, turns every resolved target into a
//! [`PackageItem`] and hands the ordered set to the packager. Per-item
//! problems (unreadable bundle, failed minification, failed per-story
//! export) are reported and skipped. Only a cycle in the tree or a failed
//! archive assembly aborts the build.
//!
//! The archive is written to a temporary file next to `output` and renamed
//! into place once the packager succeeds, so `output` is either the new
//! archive or untouched.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::bundle::{read_bundle, STORY_FILE};
use crate::config::BuildOptions;
use crate::contract::{ContentKind, ExportOptions, Minifier, PackageItem, Packager};
use crate::error::BuildError;
use crate::project::Project;
use crate::resolve::{resolve, DuplicateTarget, ResolvedTarget, ResolvedView};

#[derive(Debug, Default, Clone)]
pub struct BuildReport {
    pub archive: PathBuf,
    /// Identifiers packaged, in archive order.
    pub included: Vec<String>,
    /// `(identifier, reason)` for targets whose bundle could not be read.
    pub excluded: Vec<(String, String)>,
    pub duplicates: Vec<DuplicateTarget>,
    pub images_packaged: usize,
    /// Identifiers that got an embedded per-story export.
    pub exported: Vec<String>,
    pub export_failures: Vec<(String, String)>,
    pub minify_failures: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone)]
pub struct ExportReport {
    pub exports: Vec<PathBuf>,
    pub excluded: Vec<(String, String)>,
    pub failures: Vec<(String, String)>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BuildError + '_ {
    move |source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Build the archive for `project` and its subprojects at `output`.
pub async fn build(
    project: &Project,
    packager: &dyn Packager,
    minifier: &dyn Minifier,
    output: &Path,
) -> Result<BuildReport, BuildError> {
    if output.is_dir() {
        return Err(BuildError::OutputIsDirectory(output.to_path_buf()));
    }
    let view = resolve(project)?;
    build_view(&view, packager, minifier, output).await
}

/// Package an already resolved view.
pub async fn build_view(
    view: &ResolvedView,
    packager: &dyn Packager,
    minifier: &dyn Minifier,
    output: &Path,
) -> Result<BuildReport, BuildError> {
    let options = &view.build;
    let out_dir = parent_dir(output);
    let staging = tempfile::Builder::new()
        .prefix(".ff2zim-staging-")
        .tempdir_in(out_dir)
        .map_err(io_error(out_dir))?;

    let mut report = BuildReport {
        archive: output.to_path_buf(),
        duplicates: view.duplicates.clone(),
        ..Default::default()
    };

    info!(targets = view.targets.len(), output = %output.display(), "[BUILD] Collecting content");
    let mut items = Vec::with_capacity(view.targets.len());
    for resolved in &view.targets {
        let mut item = match package_item(resolved, options) {
            Ok(item) => item,
            Err(reason) => {
                warn!(identifier = %resolved.target.identifier, reason = %reason, "[BUILD] Excluding target with unreadable bundle");
                report
                    .excluded
                    .push((resolved.target.identifier.clone(), reason));
                continue;
            }
        };
        if options.minify {
            let position = items.len();
            if let Err(reason) = minify_story(&mut item, position, minifier, staging.path()).await {
                warn!(identifier = %item.identifier, reason = %reason, "[BUILD] Minification failed, packaging original");
                report.minify_failures.push((item.identifier.clone(), reason));
            }
        }
        items.push(item);
    }

    if options.include_epubs {
        // One directory per item: the same story may be packaged from
        // several projects when deduplication is off.
        for (position, item) in items.iter_mut().enumerate() {
            let export_options = ExportOptions {
                output_dir: staging.path().join("epubs").join(position.to_string()),
                group_by_category: options.epubs_by_category,
            };
            fs::create_dir_all(&export_options.output_dir).map_err(io_error(&export_options.output_dir))?;
            match packager.package_single(item, &export_options).await {
                Ok(path) => {
                    report.exported.push(item.identifier.clone());
                    item.export = Some(path);
                }
                Err(e) => {
                    warn!(identifier = %item.identifier, error = %e, "[BUILD] Per-story export failed");
                    report.export_failures.push((item.identifier.clone(), e.reason));
                }
            }
        }
    }

    let pending = tempfile::Builder::new()
        .prefix(".ff2zim-")
        .suffix(".part")
        .tempfile_in(out_dir)
        .map_err(io_error(out_dir))?
        .into_temp_path();

    info!(items = items.len(), "[BUILD] Assembling archive");
    if let Err(e) = packager.package(&items, options, &pending).await {
        warn!(error = %e, "[BUILD] Archive assembly failed");
        return Err(BuildError::Package(e));
    }
    pending
        .persist(output)
        .map_err(|e| BuildError::Io {
            path: output.to_path_buf(),
            source: e.error,
        })?;

    report.images_packaged = items.iter().map(|i| i.images.len()).sum();
    report.included = items.into_iter().map(|i| i.identifier).collect();
    info!(
        archive = %output.display(),
        included = report.included.len(),
        excluded = report.excluded.len(),
        images = report.images_packaged,
        "[BUILD] Archive written"
    );
    Ok(report)
}

/// Turn a resolved target into a package item, applying the image switches:
/// images are packaged only if they were requested at fetch time and
/// `build.include_images` is set.
fn package_item(resolved: &ResolvedTarget, options: &BuildOptions) -> Result<PackageItem, String> {
    let contents = read_bundle(&resolved.bundle_dir).map_err(|e| e.to_string())?;
    let metadata = resolved.target.metadata.clone().unwrap_or_default();
    let images = if metadata.images_requested && options.include_images {
        contents.images
    } else {
        Vec::new()
    };
    Ok(PackageItem {
        identifier: resolved.target.identifier.clone(),
        origin: resolved.origin.clone(),
        category: resolved.category.clone(),
        metadata,
        story: contents.story,
        metadata_file: contents.metadata_file,
        images,
        export: None,
    })
}

/// Minify the story of the item at `position` into the staging area. Copies
/// are keyed by position, not identifier, so repeated occurrences of one
/// story never share a staged file.
async fn minify_story(
    item: &mut PackageItem,
    position: usize,
    minifier: &dyn Minifier,
    staging: &Path,
) -> Result<(), String> {
    let html = fs::read_to_string(&item.story).map_err(|e| e.to_string())?;
    let minified = minifier
        .minify(&html, ContentKind::Html)
        .await
        .map_err(|e| e.reason)?;
    let dir = staging.join("minified").join(position.to_string());
    fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
    let path = dir.join(STORY_FILE);
    fs::write(&path, minified).map_err(|e| e.to_string())?;
    item.story = path;
    Ok(())
}

/// Write a standalone export of every resolved story into `output_dir`,
/// optionally in per-category subdirectories.
pub async fn export(
    project: &Project,
    packager: &dyn Packager,
    output_dir: &Path,
    group_by_category: bool,
) -> Result<ExportReport, BuildError> {
    let view = resolve(project)?;
    fs::create_dir_all(output_dir).map_err(io_error(output_dir))?;
    let options = ExportOptions {
        output_dir: output_dir.to_path_buf(),
        group_by_category,
    };

    let mut report = ExportReport::default();
    for resolved in &view.targets {
        let item = match package_item(resolved, &view.build) {
            Ok(item) => item,
            Err(reason) => {
                report.excluded.push((resolved.target.identifier.clone(), reason));
                continue;
            }
        };
        match packager.package_single(&item, &options).await {
            Ok(path) => {
                info!(identifier = %item.identifier, path = %path.display(), "Exported story");
                report.exports.push(path);
            }
            Err(e) => {
                warn!(identifier = %item.identifier, error = %e, "Export failed");
                report.failures.push((item.identifier, e.reason));
            }
        }
    }
    Ok(report)
}
