//! The shell-level "currently selected project".
//!
//! Only the CLI knows about selection. It resolves a project root once per
//! invocation and hands an explicit `Project` to every core operation.
//! Lookup order: `--project`, then `FF2ZIM_PROJECT`, then the selection
//! file written by `ff2zim select`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use ff2zim_core::project::{Project, ProjectLock};

pub const PROJECT_ENV: &str = "FF2ZIM_PROJECT";
pub const STATE_DIR_ENV: &str = "FF2ZIM_STATE_DIR";
const SELECTION_FILE: &str = "selected-project";

/// Directory holding the selection file.
pub fn state_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .map(|d| d.join("ff2zim"))
        .ok_or_else(|| anyhow!("no configuration directory on this platform; set {STATE_DIR_ENV}"))
}

fn selection_file() -> Result<PathBuf> {
    Ok(state_dir()?.join(SELECTION_FILE))
}

/// Remember `root` as the selected project.
pub fn select(root: &Path) -> Result<PathBuf> {
    if !Project::is_project(root) {
        return Err(anyhow!("{} is not a project", root.display()));
    }
    let root = fs::canonicalize(root).with_context(|| format!("resolving {}", root.display()))?;
    let file = selection_file()?;
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&file, root.to_string_lossy().as_bytes())
        .with_context(|| format!("writing {}", file.display()))?;
    debug!(root = %root.display(), "Selected project");
    Ok(root)
}

/// Forget the selection. Returns whether one existed.
pub fn unselect() -> Result<bool> {
    let file = selection_file()?;
    match fs::remove_file(&file) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("removing {}", file.display())),
    }
}

/// The persisted selection, if any.
pub fn selected() -> Result<Option<PathBuf>> {
    let file = selection_file()?;
    match fs::read_to_string(&file) {
        Ok(text) if text.trim().is_empty() => Ok(None),
        Ok(text) => Ok(Some(PathBuf::from(text.trim()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", file.display())),
    }
}

/// Resolve the project root for this invocation.
pub fn resolve_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(env) = std::env::var_os(PROJECT_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(env));
    }
    selected()?.ok_or_else(|| {
        anyhow!("no project selected; use `ff2zim select <path>`, --project or {PROJECT_ENV}")
    })
}

/// Lock and open the project for this invocation. The project stays locked
/// until the returned guard is dropped.
pub fn open_project(explicit: Option<&Path>) -> Result<(Project, ProjectLock)> {
    let root = resolve_root(explicit)?;
    let lock = ProjectLock::acquire(&root).with_context(|| format!("locking project at {}", root.display()))?;
    let project = Project::open(&root).with_context(|| format!("opening project at {}", root.display()))?;
    Ok((project, lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(STATE_DIR_ENV);
            std::env::remove_var(PROJECT_ENV);
        }
    }

    #[test]
    #[serial]
    fn select_persists_and_unselect_clears() {
        let _guard = EnvGuard;
        let state = tempdir().unwrap();
        std::env::set_var(STATE_DIR_ENV, state.path());
        std::env::remove_var(PROJECT_ENV);

        let projects = tempdir().unwrap();
        let root = projects.path().join("p");
        Project::init(&root).unwrap();

        let selected_root = select(&root).unwrap();
        assert_eq!(resolve_root(None).unwrap(), selected_root);
        assert!(unselect().unwrap());
        assert!(!unselect().unwrap());
        assert!(resolve_root(None).is_err());
    }

    #[test]
    #[serial]
    fn explicit_and_env_take_precedence() {
        let _guard = EnvGuard;
        let state = tempdir().unwrap();
        std::env::set_var(STATE_DIR_ENV, state.path());
        std::env::set_var(PROJECT_ENV, "/from/env");
        assert_eq!(resolve_root(None).unwrap(), PathBuf::from("/from/env"));
        assert_eq!(
            resolve_root(Some(Path::new("/explicit"))).unwrap(),
            PathBuf::from("/explicit")
        );
    }

    #[test]
    fn opened_project_stays_locked_until_dropped() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("p");
        Project::init(&root).unwrap();

        let (project, lock) = open_project(Some(root.as_path())).unwrap();
        assert_eq!(project.root(), root.as_path());
        assert!(ProjectLock::try_acquire(&root).is_err());
        drop(lock);
        assert!(ProjectLock::try_acquire(&root).is_ok());
    }

    #[test]
    #[serial]
    fn selecting_a_plain_directory_fails() {
        let _guard = EnvGuard;
        let state = tempdir().unwrap();
        std::env::set_var(STATE_DIR_ENV, state.path());
        let dir = tempdir().unwrap();
        assert!(select(dir.path()).is_err());
    }
}
