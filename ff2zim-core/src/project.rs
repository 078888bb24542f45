//! A project root on disk.
//!
//! ```text
//! <root>/
//!   project.yaml       options (see `config`)
//!   targets.json       ordered target registry
//!   subprojects.txt    one subproject path per line
//!   aliases.json       category aliases
//!   bundles/<id>/      one directory per fetched bundle
//!   ff2zim.lock        held exclusively while a command runs
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::ProjectError;
use crate::persist::{list_lines, write_atomic};
use crate::registry::{BundleRef, Target, TargetRegistry};

pub const CONFIG_FILE: &str = "project.yaml";
pub const REGISTRY_FILE: &str = "targets.json";
pub const SUBPROJECTS_FILE: &str = "subprojects.txt";
pub const ALIASES_FILE: &str = "aliases.json";
pub const BUNDLES_DIR: &str = "bundles";
pub const LOCK_FILE: &str = "ff2zim.lock";

const SUBPROJECTS_HEADER: &str =
    "# Subprojects, one path per line. Relative paths are resolved against this project.\n";

/// Exclusive advisory lock on a project root. Released on drop.
///
/// Every read-modify-write of a project's files happens under this lock so
/// two invocations cannot interleave their registry or config writes.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
    _file: File,
}

impl ProjectLock {
    fn open_lock_file(root: &Path) -> Result<(PathBuf, File), ProjectError> {
        if !Project::is_project(root) {
            return Err(ProjectError::NotAProject(root.to_path_buf()));
        }
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ProjectError::io(&path, e))?;
        Ok((path, file))
    }

    /// Take the lock or fail with [`ProjectError::Locked`] if another
    /// process holds it.
    pub fn try_acquire(root: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let (path, file) = Self::open_lock_file(root.as_ref())?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                return Err(ProjectError::Locked(path));
            }
            Err(e) => return Err(ProjectError::io(&path, e)),
        }
        debug!(lock = %path.display(), "Locked project");
        Ok(Self { path, _file: file })
    }

    /// Take the lock, waiting for the current holder to finish.
    pub fn acquire(root: impl AsRef<Path>) -> Result<Self, ProjectError> {
        match Self::try_acquire(root.as_ref()) {
            Err(ProjectError::Locked(path)) => {
                info!(lock = %path.display(), "Project is in use; waiting for the lock");
                let (path, file) = Self::open_lock_file(root.as_ref())?;
                file.lock_exclusive().map_err(|e| ProjectError::io(&path, e))?;
                debug!(lock = %path.display(), "Locked project");
                Ok(Self { path, _file: file })
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    config: ConfigStore,
    registry: TargetRegistry,
}

impl Project {
    /// Whether `path` holds a project.
    pub fn is_project(path: &Path) -> bool {
        path.join(CONFIG_FILE).is_file()
    }

    /// Create a project at `path`. The directory is created if missing; an
    /// existing directory must be empty.
    pub fn init(path: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let root = path.as_ref().to_path_buf();
        if Self::is_project(&root) {
            return Err(ProjectError::AlreadyExists(root));
        }
        if root.exists() {
            let mut entries = fs::read_dir(&root).map_err(|e| ProjectError::io(&root, e))?;
            if entries.next().is_some() {
                return Err(ProjectError::DirectoryNotEmpty(root));
            }
        } else {
            fs::create_dir(&root).map_err(|e| ProjectError::io(&root, e))?;
        }

        let bundles = root.join(BUNDLES_DIR);
        fs::create_dir(&bundles).map_err(|e| ProjectError::io(&bundles, e))?;
        let subprojects = root.join(SUBPROJECTS_FILE);
        write_atomic(&subprojects, SUBPROJECTS_HEADER.as_bytes())
            .map_err(|e| ProjectError::io(&subprojects, e))?;
        let registry = TargetRegistry::create(root.join(REGISTRY_FILE))?;
        // Written last: its presence marks the directory as a project.
        let config = ConfigStore::create(root.join(CONFIG_FILE))?;

        info!(root = %root.display(), "Initialised project");
        Ok(Self {
            root,
            config,
            registry,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let root = path.as_ref().to_path_buf();
        if !Self::is_project(&root) {
            return Err(ProjectError::NotAProject(root));
        }
        let registry_path = root.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            TargetRegistry::load(&registry_path)?
        } else {
            warn!(root = %root.display(), "Project has no target list; starting empty");
            TargetRegistry::create(&registry_path)?
        };
        debug!(root = %root.display(), targets = registry.len(), "Opened project");
        Ok(Self {
            config: ConfigStore::open(root.join(CONFIG_FILE)),
            registry,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable identity of the project: its canonical root location.
    pub fn identity(&self) -> PathBuf {
        fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone())
    }

    pub fn name(&self) -> String {
        self.identity()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TargetRegistry {
        &mut self.registry
    }

    /// Subproject roots in listed order, relative entries resolved against
    /// this project's root.
    pub fn subprojects(&self) -> Result<Vec<PathBuf>, ProjectError> {
        let path = self.root.join(SUBPROJECTS_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProjectError::io(&path, e)),
        };
        Ok(list_lines(&text)
            .map(|line| {
                let p = Path::new(line);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.root.join(p)
                }
            })
            .collect())
    }

    /// Append a subproject reference. Returns `false` if it is already listed.
    /// Cycles are only detected when the tree is resolved.
    pub fn add_subproject(&self, path: impl AsRef<Path>) -> Result<bool, ProjectError> {
        let entry = path.as_ref();
        let resolved = if entry.is_absolute() {
            entry.to_path_buf()
        } else {
            self.root.join(entry)
        };
        if !Self::is_project(&resolved) {
            return Err(ProjectError::NotAProject(resolved));
        }
        let wanted = fs::canonicalize(&resolved).unwrap_or(resolved);
        for existing in self.subprojects()? {
            if fs::canonicalize(&existing).unwrap_or(existing) == wanted {
                return Ok(false);
            }
        }

        let file = self.root.join(SUBPROJECTS_FILE);
        let mut text = match fs::read_to_string(&file) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => SUBPROJECTS_HEADER.to_string(),
            Err(e) => return Err(ProjectError::io(&file, e)),
        };
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&entry.display().to_string());
        text.push('\n');
        write_atomic(&file, text.as_bytes()).map_err(|e| ProjectError::io(&file, e))?;
        info!(root = %self.root.display(), subproject = %entry.display(), "Added subproject");
        Ok(true)
    }

    pub fn bundle_dir(&self, bundle: &BundleRef) -> PathBuf {
        self.root.join(BUNDLES_DIR).join(bundle.as_str())
    }

    /// Create an empty directory for a new bundle.
    pub fn allocate_bundle(&self) -> Result<(BundleRef, PathBuf), ProjectError> {
        let bundle = BundleRef::generate();
        let dir = self.bundle_dir(&bundle);
        fs::create_dir_all(&dir).map_err(|e| ProjectError::io(&dir, e))?;
        Ok((bundle, dir))
    }

    /// Delete a bundle directory. A bundle that is already gone is fine.
    pub fn discard_bundle(&self, bundle: &BundleRef) -> Result<(), ProjectError> {
        let dir = self.bundle_dir(bundle);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(bundle = %bundle, "Discarded bundle");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProjectError::io(&dir, e)),
        }
    }

    /// Remove a target and reclaim its bundle.
    pub fn remove_target(&mut self, identifier: &str) -> Result<Target, ProjectError> {
        let removed = self.registry.remove(identifier)?;
        if let Some(bundle) = &removed.bundle {
            self.discard_bundle(bundle)?;
        }
        Ok(removed)
    }

    pub fn category_aliases(&self) -> Result<BTreeMap<String, String>, ProjectError> {
        let path = self.root.join(ALIASES_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(ProjectError::io(&path, e)),
        };
        serde_json::from_str(&text).map_err(|source| ProjectError::Parse { path, source })
    }

    /// Map category `from` to `to` when grouping this project's targets.
    pub fn add_category_alias(&self, from: &str, to: &str) -> Result<(), ProjectError> {
        let mut aliases = self.category_aliases()?;
        aliases.insert(from.trim().to_string(), to.trim().to_string());
        let path = self.root.join(ALIASES_FILE);
        let text = serde_json::to_string_pretty(&aliases)
            .map_err(|source| ProjectError::Parse { path: path.clone(), source })?;
        write_atomic(&path, text.as_bytes()).map_err(|e| ProjectError::io(&path, e))?;
        info!(from, to, "Added category alias");
        Ok(())
    }
}
