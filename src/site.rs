//! Static HTML site handed to zimwriterfs.
//!
//! ```text
//! index.html                 overview and category list
//! categories/<name>.html     stories of one category
//! stories/<n>/story.html     story document (+ images/, story.epub)
//! stories.json               metadata of every story
//! ```
//!
//! Rendering is deterministic: the same items in the same order produce the
//! same bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

use ff2zim_core::bundle::{safe_file_name, IMAGES_DIR, STORY_FILE};
use ff2zim_core::config::BuildOptions;
use ff2zim_core::contract::PackageItem;

pub const INDEX_PAGE: &str = "index.html";
pub const ILLUSTRATION_FILE: &str = "illustration.png";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiteSummary {
    pub stories: usize,
    pub categories: usize,
    pub images: usize,
    pub epubs: usize,
    pub has_illustration: bool,
}

#[derive(Serialize)]
struct StoryEntry<'a> {
    path: String,
    identifier: &'a str,
    title: &'a str,
    author: &'a str,
    category: &'a str,
    project: &'a str,
    words: u64,
    chapters: u32,
    epub: Option<String>,
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}</body>\n</html>\n",
        escape(title),
        body
    )
}

fn copy_into(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).map(|_| ())
}

/// Render `items` into `out_dir`, which must exist and be empty.
pub fn render_site(items: &[PackageItem], options: &BuildOptions, out_dir: &Path) -> io::Result<SiteSummary> {
    let mut summary = SiteSummary {
        stories: items.len(),
        ..Default::default()
    };
    let mut by_category: BTreeMap<&str, Vec<(usize, &PackageItem)>> = BTreeMap::new();
    let mut entries = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let story_dir = out_dir.join("stories").join(index.to_string());
        copy_into(&item.story, &story_dir.join(STORY_FILE))?;
        for image in &item.images {
            if let Some(name) = image.file_name() {
                copy_into(image, &story_dir.join(IMAGES_DIR).join(name))?;
                summary.images += 1;
            }
        }
        let epub = match &item.export {
            Some(export) if export.is_file() => {
                copy_into(export, &story_dir.join("story.epub"))?;
                summary.epubs += 1;
                Some(format!("stories/{index}/story.epub"))
            }
            _ => None,
        };
        entries.push(StoryEntry {
            path: format!("stories/{index}/{STORY_FILE}"),
            identifier: &item.identifier,
            title: &item.metadata.title,
            author: &item.metadata.author,
            category: &item.category,
            project: &item.origin.name,
            words: item.metadata.word_count,
            chapters: item.metadata.chapter_count,
            epub,
        });
        by_category.entry(item.category.as_str()).or_default().push((index, item));
    }
    summary.categories = by_category.len();

    let categories_dir = out_dir.join("categories");
    fs::create_dir_all(&categories_dir)?;
    for (category, stories) in &by_category {
        let mut body = format!("<h1>{}</h1>\n<p><a href=\"../{INDEX_PAGE}\">Back</a></p>\n<ul>\n", escape(category));
        for (index, item) in stories {
            let _ = write!(
                body,
                "<li><a href=\"../stories/{index}/{STORY_FILE}\">{}</a> by {} ({} words, {} chapters)",
                escape(&item.metadata.title),
                escape(&item.metadata.author),
                item.metadata.word_count,
                item.metadata.chapter_count,
            );
            if entries[*index].epub.is_some() {
                let _ = write!(body, " <a href=\"../stories/{index}/story.epub\">EPUB</a>");
            }
            body.push_str("</li>\n");
        }
        body.push_str("</ul>\n");
        let file = categories_dir.join(format!("{}.html", safe_file_name(category)));
        fs::write(file, page(category, &body))?;
    }

    let total_words: u64 = items.iter().map(|i| i.metadata.word_count).sum();
    let mut body = format!(
        "<h1>{}</h1>\n<p>{}</p>\n<p>{} stories, {} words, {} categories.</p>\n<ul>\n",
        escape(&options.title),
        escape(&options.description),
        items.len(),
        total_words,
        by_category.len(),
    );
    for (category, stories) in &by_category {
        let _ = writeln!(
            body,
            "<li><a href=\"categories/{}.html\">{}</a> ({})</li>",
            escape(&safe_file_name(category)),
            escape(category),
            stories.len()
        );
    }
    body.push_str("</ul>\n");
    fs::write(out_dir.join(INDEX_PAGE), page(&options.title, &body))?;

    let json = serde_json::to_vec_pretty(&entries).map_err(io::Error::other)?;
    fs::write(out_dir.join("stories.json"), json)?;

    if let Some(illustration) = options.illustration.as_deref().map(Path::new) {
        if illustration.is_file() {
            fs::copy(illustration, out_dir.join(ILLUSTRATION_FILE))?;
            summary.has_illustration = true;
        }
    }
    Ok(summary)
}
