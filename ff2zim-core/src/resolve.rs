//! Project tree resolution.
//!
//! Walks the top-level project and its subprojects depth-first in listed
//! order and flattens their `DOWNLOADED` targets into one [`ResolvedView`].
//! Build options always come from the top-level project alone.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::BuildOptions;
use crate::contract::ProjectOrigin;
use crate::error::ResolveError;
use crate::project::Project;
use crate::registry::{Target, TargetState};

pub const UNCATEGORIZED: &str = "Uncategorized";

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub origin: ProjectOrigin,
    pub target: Target,
    pub bundle_dir: PathBuf,
    /// Category after the origin project's aliases are applied.
    pub category: String,
}

/// An occurrence left out because the identifier was already included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateTarget {
    pub identifier: String,
    pub kept_from: PathBuf,
    pub dropped_from: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedView {
    pub root: PathBuf,
    pub build: BuildOptions,
    /// Top-level targets first, then each subproject depth-first; registry
    /// order within a project.
    pub targets: Vec<ResolvedTarget>,
    pub duplicates: Vec<DuplicateTarget>,
    /// Every project in the tree, in resolution order.
    pub projects: Vec<ProjectOrigin>,
}

/// Resolve the tree rooted at `project`.
///
/// Fails with [`ResolveError::CyclicProject`] if a project appears on its
/// own ancestor path. A project reachable along two separate paths is
/// resolved once.
pub fn resolve(project: &Project) -> Result<ResolvedView, ResolveError> {
    let mut build = project.config().build_options()?;
    if let Some(illustration) = build.illustration.take() {
        let path = project.root().join(illustration);
        build.illustration = Some(path.to_string_lossy().into_owned());
    }
    let mut view = ResolvedView {
        root: project.root().to_path_buf(),
        build,
        targets: Vec::new(),
        duplicates: Vec::new(),
        projects: Vec::new(),
    };
    let mut stack = Vec::new();
    let mut visited = HashSet::new();
    collect(project, 0, &mut stack, &mut visited, &mut view)?;

    if view.build.deduplicate {
        deduplicate(&mut view);
    }
    info!(
        root = %view.root.display(),
        projects = view.projects.len(),
        targets = view.targets.len(),
        duplicates = view.duplicates.len(),
        "[RESOLVE] Project tree resolved"
    );
    Ok(view)
}

fn collect(
    project: &Project,
    depth: usize,
    stack: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
    view: &mut ResolvedView,
) -> Result<(), ResolveError> {
    let identity = project.identity();
    if let Some(pos) = stack.iter().position(|p| *p == identity) {
        let mut cycle = stack[pos..].to_vec();
        cycle.push(identity);
        return Err(ResolveError::CyclicProject { cycle });
    }
    if !visited.insert(identity.clone()) {
        debug!(project = %identity.display(), "[RESOLVE] Project already resolved via another path");
        return Ok(());
    }

    let origin = ProjectOrigin {
        root: identity.clone(),
        name: project.name(),
        depth,
    };
    view.projects.push(origin.clone());

    let aliases = project.category_aliases()?;
    for target in project.registry().targets() {
        if target.state != TargetState::Downloaded {
            continue;
        }
        let Some(bundle) = &target.bundle else {
            continue;
        };
        view.targets.push(ResolvedTarget {
            origin: origin.clone(),
            category: category_for(target, &aliases),
            bundle_dir: project.bundle_dir(bundle),
            target: target.clone(),
        });
    }

    stack.push(identity);
    for child_root in project.subprojects()? {
        debug!(parent = %origin.root.display(), child = %child_root.display(), "[RESOLVE] Opening subproject");
        let child = Project::open(&child_root)?;
        collect(&child, depth + 1, stack, visited, view)?;
    }
    stack.pop();
    Ok(())
}

fn category_for(target: &Target, aliases: &BTreeMap<String, String>) -> String {
    let raw = target
        .metadata
        .as_ref()
        .map(|m| m.category.trim())
        .unwrap_or_default();
    let category = aliases.get(raw).map(String::as_str).unwrap_or(raw);
    if category.is_empty() {
        UNCATEGORIZED.to_string()
    } else {
        category.to_string()
    }
}

/// Keep the first occurrence of every identifier.
fn deduplicate(view: &mut ResolvedView) {
    let mut first_seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut kept = Vec::with_capacity(view.targets.len());
    for resolved in view.targets.drain(..) {
        let identifier = resolved.target.identifier.clone();
        match first_seen.get(&identifier) {
            Some(kept_from) => view.duplicates.push(DuplicateTarget {
                identifier,
                kept_from: kept_from.clone(),
                dropped_from: resolved.origin.root.clone(),
            }),
            None => {
                first_seen.insert(identifier, resolved.origin.root.clone());
                kept.push(resolved);
            }
        }
    }
    view.targets = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BundleRef, TargetMetadata, Transition};
    use tempfile::tempdir;

    fn download(project: &mut Project, id: &str, category: &str) {
        project.registry_mut().add(id).unwrap();
        let identifier = crate::identifier::normalize_identifier(id).unwrap();
        project
            .registry_mut()
            .transition(
                &identifier,
                TargetState::Downloaded,
                Transition::Fetched {
                    bundle: BundleRef::generate(),
                    metadata: TargetMetadata {
                        title: id.into(),
                        category: category.into(),
                        ..Default::default()
                    },
                },
            )
            .unwrap();
    }

    #[test]
    fn only_downloaded_targets_are_flattened() {
        let dir = tempdir().unwrap();
        let mut top = Project::init(dir.path().join("top")).unwrap();
        top.registry_mut().add("1").unwrap();
        download(&mut top, "2", "Books");

        let view = resolve(&top).unwrap();
        assert_eq!(view.targets.len(), 1);
        assert_eq!(view.targets[0].category, "Books");
        assert_eq!(view.projects.len(), 1);
    }

    #[test]
    fn aliases_of_the_origin_project_apply() {
        let dir = tempdir().unwrap();
        let mut top = Project::init(dir.path().join("top")).unwrap();
        download(&mut top, "1", "HP");
        download(&mut top, "2", "");
        top.add_category_alias("HP", "Harry Potter").unwrap();

        let view = resolve(&top).unwrap();
        let categories: Vec<_> = view.targets.iter().map(|t| t.category.as_str()).collect();
        assert_eq!(categories, vec!["Harry Potter", UNCATEGORIZED]);
    }

    #[test]
    fn diamond_is_resolved_once() {
        let dir = tempdir().unwrap();
        let top = Project::init(dir.path().join("top")).unwrap();
        let left = Project::init(dir.path().join("left")).unwrap();
        let right = Project::init(dir.path().join("right")).unwrap();
        let mut shared = Project::init(dir.path().join("shared")).unwrap();
        download(&mut shared, "7", "X");

        top.add_subproject("../left").unwrap();
        top.add_subproject("../right").unwrap();
        left.add_subproject("../shared").unwrap();
        right.add_subproject("../shared").unwrap();

        let view = resolve(&top).unwrap();
        assert_eq!(view.projects.len(), 4);
        assert_eq!(view.targets.len(), 1);
        assert_eq!(view.projects[2].depth, 2);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let dir = tempdir().unwrap();
        let top = Project::init(dir.path().join("top")).unwrap();
        top.add_subproject(".").unwrap();
        match resolve(&top) {
            Err(ResolveError::CyclicProject { cycle }) => assert_eq!(cycle.len(), 2),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }
}
