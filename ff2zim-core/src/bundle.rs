use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::BundleError;

pub const STORY_FILE: &str = "story.html";
pub const METADATA_FILE: &str = "metadata.json";
pub const IMAGES_DIR: &str = "images";

/// Files of a fetched bundle, checked for readability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleContents {
    pub dir: PathBuf,
    pub story: PathBuf,
    pub metadata_file: Option<PathBuf>,
    /// Image files, sorted by path.
    pub images: Vec<PathBuf>,
}

/// Inspect a bundle directory. The story document is required; metadata and
/// images are optional.
pub fn read_bundle(dir: &Path) -> Result<BundleContents, BundleError> {
    if !dir.is_dir() {
        return Err(BundleError::Missing(dir.to_path_buf()));
    }
    let story = dir.join(STORY_FILE);
    match fs::File::open(&story) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(BundleError::Missing(story)),
        Err(source) => return Err(BundleError::Io { path: story, source }),
    }

    let metadata = dir.join(METADATA_FILE);
    let metadata_file = metadata.is_file().then_some(metadata);

    let images_dir = dir.join(IMAGES_DIR);
    let mut images = Vec::new();
    if images_dir.is_dir() {
        let entries = fs::read_dir(&images_dir).map_err(|source| BundleError::Io {
            path: images_dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| BundleError::Io {
                path: images_dir.clone(),
                source,
            })?;
            if entry.path().is_file() {
                images.push(entry.path());
            }
        }
        images.sort();
    }

    Ok(BundleContents {
        dir: dir.to_path_buf(),
        story,
        metadata_file,
        images,
    })
}

/// Hex SHA-256 of the bundle's story document.
pub fn content_hash(dir: &Path) -> Result<String, BundleError> {
    let story = dir.join(STORY_FILE);
    let bytes = fs::read(&story).map_err(|source| match source.kind() {
        ErrorKind::NotFound => BundleError::Missing(story.clone()),
        _ => BundleError::Io {
            path: story.clone(),
            source,
        },
    })?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// A file-system safe rendering of a title or category name.
pub fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}
