use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ff2zim_core::build::{build, export};
use ff2zim_core::bundle::{IMAGES_DIR, STORY_FILE};
use ff2zim_core::contract::{MockFetcher, MockMinifier, MockPackager, PackageItem};
use ff2zim_core::error::{BuildError, MinifyError, PackageError, ResolveError};
use ff2zim_core::lifecycle::download_all;
use ff2zim_core::project::Project;
use ff2zim_core::registry::TargetMetadata;
use ff2zim_core::resolve::resolve;
use tempfile::tempdir;

/// Fetcher writing a story and `images` image files per target.
fn fetcher(images: usize, category: &'static str) -> MockFetcher {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().returning(move |identifier, options, dir| {
        fs::write(dir.join(STORY_FILE), format!("<h1>{identifier}</h1>")).unwrap();
        if options.include_images {
            fs::create_dir(dir.join(IMAGES_DIR)).unwrap();
            for i in 0..images {
                fs::write(dir.join(IMAGES_DIR).join(format!("{i}.png")), [i as u8]).unwrap();
            }
        }
        Ok(TargetMetadata {
            title: identifier.rsplit('/').next().unwrap_or_default().to_string(),
            category: category.to_string(),
            ..Default::default()
        })
    });
    fetcher
}

async fn project_with(root: &Path, ids: &str, images: usize) -> Project {
    let mut project = Project::init(root).unwrap();
    project.registry_mut().bulk_add(ids).unwrap();
    download_all(&mut project, &fetcher(images, "Books")).await.unwrap();
    project
}

/// Packager that writes a file listing the packaged items.
fn capturing_packager(captured: Arc<Mutex<Vec<PackageItem>>>) -> MockPackager {
    let mut packager = MockPackager::new();
    packager
        .expect_package()
        .returning(move |items, options, destination| {
            *captured.lock().unwrap() = items.to_vec();
            let listing: Vec<_> = items.iter().map(|i| i.identifier.clone()).collect();
            fs::write(destination, format!("{}\n{}", options.title, listing.join("\n"))).unwrap();
            Ok(())
        });
    packager
}

fn no_minify() -> MockMinifier {
    let mut minifier = MockMinifier::new();
    minifier.expect_minify().never();
    minifier
}

#[tokio::test]
async fn cyclic_tree_fails_before_packaging() {
    let dir = tempdir().unwrap();
    let a = project_with(&dir.path().join("a"), "1\n", 0).await;
    let b = Project::init(dir.path().join("b")).unwrap();
    a.add_subproject("../b").unwrap();
    b.add_subproject("../a").unwrap();

    let mut packager = MockPackager::new();
    packager.expect_package().never();
    packager.expect_package_single().never();

    let output = dir.path().join("out.zim");
    let err = build(&a, &packager, &no_minify(), &output).await.unwrap_err();
    match err {
        BuildError::Resolve(ResolveError::CyclicProject { cycle }) => assert_eq!(cycle.len(), 3),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(!output.exists());
}

#[tokio::test]
async fn top_level_build_options_win() {
    let dir = tempdir().unwrap();
    let top = project_with(&dir.path().join("top"), "1\n", 0).await;
    let sub = project_with(&dir.path().join("sub"), "2\n", 0).await;
    top.config().set("build", "title", "A").unwrap();
    sub.config().set("build", "title", "B").unwrap();
    top.add_subproject("../sub").unwrap();

    let view = resolve(&top).unwrap();
    assert_eq!(view.build.title, "A");

    let mut packager = MockPackager::new();
    packager
        .expect_package()
        .withf(|items, options, _| options.title == "A" && items.len() == 2)
        .times(1)
        .returning(|_, _, destination| {
            fs::write(destination, "archive").unwrap();
            Ok(())
        });
    build(&top, &packager, &no_minify(), &dir.path().join("out.zim")).await.unwrap();
}

#[tokio::test]
async fn build_time_image_switch_omits_images_but_keeps_bundle() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n", 2).await;
    project.config().set("build", "include_images", "false").unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let report = build(&project, &capturing_packager(captured.clone()), &no_minify(), &dir.path().join("out.zim"))
        .await
        .unwrap();

    assert_eq!(report.images_packaged, 0);
    assert!(captured.lock().unwrap()[0].images.is_empty());
    let target = &project.registry().targets()[0];
    let bundle = project.bundle_dir(target.bundle.as_ref().unwrap());
    assert_eq!(fs::read_dir(bundle.join(IMAGES_DIR)).unwrap().count(), 2);
}

#[tokio::test]
async fn build_time_switch_cannot_resurrect_unfetched_images() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("p");
    let mut project = Project::init(&root).unwrap();
    project.config().set("download", "include_images", "false").unwrap();
    project.config().set("build", "include_images", "true").unwrap();
    project.registry_mut().add("1").unwrap();
    download_all(&mut project, &fetcher(2, "Books")).await.unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let report = build(&project, &capturing_packager(captured.clone()), &no_minify(), &dir.path().join("out.zim"))
        .await
        .unwrap();
    assert_eq!(report.images_packaged, 0);
    assert!(!project.registry().targets()[0].metadata.as_ref().unwrap().images_requested);
}

#[tokio::test]
async fn images_are_packaged_when_both_switches_are_on() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n", 2).await;
    let captured = Arc::new(Mutex::new(Vec::new()));
    let report = build(&project, &capturing_packager(captured), &no_minify(), &dir.path().join("out.zim"))
        .await
        .unwrap();
    assert_eq!(report.images_packaged, 2);
}

#[tokio::test]
async fn unreadable_bundle_is_excluded_not_fatal() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n2\n", 0).await;
    let broken = project.registry().targets()[0].bundle.clone().unwrap();
    fs::remove_file(project.bundle_dir(&broken).join(STORY_FILE)).unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let report = build(&project, &capturing_packager(captured), &no_minify(), &dir.path().join("out.zim"))
        .await
        .unwrap();
    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.included, vec!["https://www.fanfiction.net/s/2".to_string()]);
}

#[tokio::test]
async fn duplicates_across_subprojects_are_packaged_once_by_default() {
    let dir = tempdir().unwrap();
    let top = project_with(&dir.path().join("top"), "1\n2\n", 0).await;
    project_with(&dir.path().join("sub"), "2\n3\n", 0).await;
    top.add_subproject("../sub").unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let report = build(&top, &capturing_packager(captured.clone()), &no_minify(), &dir.path().join("a.zim"))
        .await
        .unwrap();
    assert_eq!(report.included.len(), 3);
    assert_eq!(report.duplicates.len(), 1);
    let items = captured.lock().unwrap().clone();
    let dup = items
        .iter()
        .find(|i| i.identifier.ends_with("/s/2"))
        .unwrap();
    assert_eq!(dup.origin.depth, 0, "first occurrence comes from the top-level project");

    top.config().set("build", "deduplicate", "false").unwrap();
    let report = build(&top, &capturing_packager(Arc::default()), &no_minify(), &dir.path().join("b.zim"))
        .await
        .unwrap();
    assert_eq!(report.included.len(), 4);
}

#[tokio::test]
async fn items_are_ordered_top_level_first_in_registry_order() {
    let dir = tempdir().unwrap();
    let top = project_with(&dir.path().join("top"), "9\n4\n", 0).await;
    project_with(&dir.path().join("sub"), "1\n", 0).await;
    top.add_subproject("../sub").unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    build(&top, &capturing_packager(captured.clone()), &no_minify(), &dir.path().join("out.zim"))
        .await
        .unwrap();
    let ids: Vec<String> = captured.lock().unwrap().iter().map(|i| i.identifier.clone()).collect();
    assert_eq!(
        ids,
        vec![
            "https://www.fanfiction.net/s/9",
            "https://www.fanfiction.net/s/4",
            "https://www.fanfiction.net/s/1"
        ]
    );
}

#[tokio::test]
async fn failed_assembly_leaves_no_output() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n", 0).await;
    let mut packager = MockPackager::new();
    packager.expect_package().returning(|_, _, destination| {
        fs::write(destination, "half an archive").unwrap();
        Err(PackageError::new("zimwriterfs exited with status 1"))
    });

    let output = dir.path().join("out.zim");
    let err = build(&project, &packager, &no_minify(), &output).await.unwrap_err();
    assert!(matches!(err, BuildError::Package(_)));
    assert!(!output.exists());
    let leftovers: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(".ff2zim"))
        .collect();
    assert!(leftovers.is_empty(), "temporary files left behind: {leftovers:?}");
}

#[tokio::test]
async fn output_directory_is_rejected() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n", 0).await;
    let mut packager = MockPackager::new();
    packager.expect_package().never();
    let err = build(&project, &packager, &no_minify(), dir.path()).await.unwrap_err();
    assert!(matches!(err, BuildError::OutputIsDirectory(_)));
}

#[tokio::test]
async fn rebuilding_without_changes_is_byte_identical() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n2\n", 1).await;
    let first = dir.path().join("first.zim");
    let second = dir.path().join("second.zim");
    build(&project, &capturing_packager(Arc::default()), &no_minify(), &first).await.unwrap();
    build(&project, &capturing_packager(Arc::default()), &no_minify(), &second).await.unwrap();
    assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
}

#[tokio::test]
async fn minify_failure_skips_only_that_item() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n2\n", 0).await;
    project.config().set("build", "minify", "true").unwrap();

    let mut minifier = MockMinifier::new();
    minifier.expect_minify().returning(|content, _| {
        if content.contains("/s/1") {
            Err(MinifyError::new("minify crashed"))
        } else {
            Ok(content.replace(' ', ""))
        }
    });

    let captured = Arc::new(Mutex::new(Vec::new()));
    let report = build(&project, &capturing_packager(captured.clone()), &minifier, &dir.path().join("out.zim"))
        .await
        .unwrap();
    assert_eq!(report.minify_failures.len(), 1);
    assert_eq!(report.included.len(), 2);

    let items = captured.lock().unwrap().clone();
    let bundles = project.root().join("bundles");
    assert!(items[0].story.starts_with(&bundles), "failed item keeps its original story");
    assert!(!items[1].story.starts_with(&bundles), "minified item points at the staged copy");
}

#[tokio::test]
async fn per_story_exports_are_embedded_and_failures_reported() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n2\n", 0).await;
    project.config().set("build", "include_epubs", "true").unwrap();
    project.config().set("build", "epubs_by_category", "true").unwrap();

    let mut packager = MockPackager::new();
    packager
        .expect_package_single()
        .times(2)
        .returning(|item, options| {
            assert!(options.group_by_category);
            if item.identifier.ends_with("/s/2") {
                return Err(PackageError::new("pandoc missing"));
            }
            Ok(options.output_dir.join(&item.category).join("1.epub"))
        });
    packager
        .expect_package()
        .withf(|items, _, _| items[0].export.is_some() && items[1].export.is_none())
        .times(1)
        .returning(|_, _, destination| {
            fs::write(destination, "zim").unwrap();
            Ok(())
        });

    let report = build(&project, &packager, &no_minify(), &dir.path().join("out.zim"))
        .await
        .unwrap();
    assert_eq!(report.exported, vec!["https://www.fanfiction.net/s/1".to_string()]);
    assert_eq!(report.export_failures.len(), 1);
}

#[tokio::test]
async fn standalone_export_reports_each_story() {
    let dir = tempdir().unwrap();
    let project = project_with(&dir.path().join("p"), "1\n2\n", 0).await;
    let out = dir.path().join("epubs");

    let mut packager = MockPackager::new();
    packager
        .expect_package_single()
        .times(2)
        .returning(|item, options| {
            assert!(!options.group_by_category);
            let path = options
                .output_dir
                .join(format!("{}.epub", item.metadata.title));
            fs::write(&path, "epub").unwrap();
            Ok(path)
        });

    let report = export(&project, &packager, &out, false).await.unwrap();
    assert_eq!(report.exports.len(), 2);
    assert!(out.join("1.epub").exists());
}

/// Fetcher writing a fixed story body, whatever the identifier.
fn fetcher_writing(body: &'static str) -> MockFetcher {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().returning(move |_, _, dir| {
        fs::write(dir.join(STORY_FILE), body).unwrap();
        Ok(TargetMetadata {
            title: "Same Story".into(),
            story_id: "1".into(),
            ..Default::default()
        })
    });
    fetcher
}

async fn top_and_sub_with_same_story(dir: &Path) -> Project {
    let mut top = Project::init(dir.join("top")).unwrap();
    top.registry_mut().add("1").unwrap();
    download_all(&mut top, &fetcher_writing("TOP VERSION")).await.unwrap();
    let mut sub = Project::init(dir.join("sub")).unwrap();
    sub.registry_mut().add("1").unwrap();
    download_all(&mut sub, &fetcher_writing("SUB VERSION")).await.unwrap();
    top.add_subproject("../sub").unwrap();
    top.config().set("build", "deduplicate", "false").unwrap();
    top
}

#[tokio::test]
async fn minified_copies_of_repeated_story_stay_apart() {
    let dir = tempdir().unwrap();
    let top = top_and_sub_with_same_story(dir.path()).await;
    top.config().set("build", "minify", "true").unwrap();

    let mut minifier = MockMinifier::new();
    minifier.expect_minify().times(2).returning(|content, _| Ok(content.to_string()));

    let stories = Arc::new(Mutex::new(Vec::new()));
    let seen = stories.clone();
    let mut packager = MockPackager::new();
    packager.expect_package().times(1).returning(move |items, _, destination| {
        *seen.lock().unwrap() = items
            .iter()
            .map(|i| fs::read_to_string(&i.story).unwrap())
            .collect::<Vec<_>>();
        fs::write(destination, "zim").unwrap();
        Ok(())
    });

    let report = build(&top, &packager, &minifier, &dir.path().join("out.zim")).await.unwrap();
    assert_eq!(report.included.len(), 2);
    assert_eq!(*stories.lock().unwrap(), vec!["TOP VERSION", "SUB VERSION"]);
}

#[tokio::test]
async fn embedded_exports_of_repeated_story_stay_apart() {
    let dir = tempdir().unwrap();
    let top = top_and_sub_with_same_story(dir.path()).await;
    top.config().set("build", "include_epubs", "true").unwrap();

    let mut packager = MockPackager::new();
    packager.expect_package_single().times(2).returning(|item, options| {
        let path = options.output_dir.join(format!("{}.epub", item.metadata.title));
        fs::write(&path, fs::read(&item.story).unwrap()).unwrap();
        Ok(path)
    });
    let exports = Arc::new(Mutex::new(Vec::new()));
    let seen = exports.clone();
    packager.expect_package().times(1).returning(move |items, _, destination| {
        *seen.lock().unwrap() = items
            .iter()
            .map(|i| fs::read_to_string(i.export.as_ref().unwrap()).unwrap())
            .collect::<Vec<_>>();
        fs::write(destination, "zim").unwrap();
        Ok(())
    });

    build(&top, &packager, &no_minify(), &dir.path().join("out.zim")).await.unwrap();
    assert_eq!(*exports.lock().unwrap(), vec!["TOP VERSION", "SUB VERSION"]);
}
