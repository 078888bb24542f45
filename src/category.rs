//! fanfiction.net category listings over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use ff2zim_core::contract::{CategoryLister, KnownStories, ListedStory};
use ff2zim_core::error::ListingError;
use ff2zim_core::identifier::normalize_identifier;

use crate::load_config::HttpSettings;

const FFNET_ORIGIN: &str = "https://www.fanfiction.net";

fn selector(css: &str) -> Result<Selector, ListingError> {
    Selector::parse(css).map_err(|e| ListingError::new(format!("bad selector {css}: {e}")))
}

/// A story found on a listing page with its newest remote timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub identifier: String,
    pub updated: Option<i64>,
}

fn story_identifier(href: &str) -> Option<String> {
    let absolute = if href.starts_with('/') {
        format!("{FFNET_ORIGIN}{href}")
    } else {
        href.to_string()
    };
    normalize_identifier(&absolute).ok()
}

/// Stories on one listing page, in page order. Each story's timestamp is
/// the newest `data-xutime` inside the block holding its title link.
pub fn parse_listing(html: &str) -> Result<Vec<ListingEntry>, ListingError> {
    let document = Html::parse_document(html);
    let title_links = selector("a.stitle[href]")?;
    let times = selector("span[data-xutime]")?;

    let mut entries = Vec::new();
    for anchor in document.select(&title_links) {
        let Some(identifier) = anchor.value().attr("href").and_then(story_identifier) else {
            debug!(href = ?anchor.value().attr("href"), "[CATEGORY] Skipping unrecognised story link");
            continue;
        };
        let updated = anchor
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|block| {
                block
                    .select(&times)
                    .filter_map(|span| span.value().attr("data-xutime")?.trim().parse::<i64>().ok())
                    .max()
            });
        entries.push(ListingEntry { identifier, updated });
    }
    Ok(entries)
}

fn page_param(href: &str) -> Option<usize> {
    let (_, query) = href.split_once('?')?;
    query
        .split(['&', ';'])
        .find_map(|pair| pair.strip_prefix("p="))
        .and_then(|p| p.parse().ok())
}

/// Number of listing pages, read from the "Last" link or failing that the
/// "Next" link.
pub fn page_count(html: &str) -> Result<usize, ListingError> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    let mut next = None;
    for link in document.select(&links) {
        let text = link.text().collect::<String>();
        let text = text.trim();
        let page = link.value().attr("href").and_then(page_param);
        if text == "Last" {
            if let Some(page) = page {
                return Ok(page);
            }
        } else if text.starts_with("Next") && next.is_none() {
            next = page;
        }
    }
    Ok(next.unwrap_or(1))
}

fn is_changed(entry: &ListingEntry, known: &KnownStories) -> bool {
    match (known.get(&entry.identifier), entry.updated) {
        (None, _) => true,
        (Some(fetched_at), Some(updated)) => updated > fetched_at.timestamp(),
        (Some(_), None) => false,
    }
}

/// Lists a fanfiction.net category page by page.
pub struct FfnetCategoryLister {
    client: Client,
    settings: HttpSettings,
}

impl FfnetCategoryLister {
    pub fn new(settings: HttpSettings) -> Result<Self, ListingError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| ListingError::new(format!("could not build HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    async fn get_page(&self, url: &str, page: usize) -> Result<String, ListingError> {
        let mut query = vec![("srt", "1".to_string()), ("r", "10".to_string())];
        if page > 1 {
            query.push(("p", page.to_string()));
        }
        debug!(url, page, "[CATEGORY] Fetching listing page");
        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ListingError::new(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ListingError::new(format!("{url} page {page} returned {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| ListingError::new(format!("could not read {url} page {page}: {e}")))
    }
}

#[async_trait]
impl CategoryLister for FfnetCategoryLister {
    async fn list_category(
        &self,
        category: &str,
        known: &KnownStories,
    ) -> Result<Vec<ListedStory>, ListingError> {
        let first = self.get_page(category, 1).await?;
        let mut pages = page_count(&first)?;
        if pages > self.settings.max_pages {
            warn!(category, pages, max_pages = self.settings.max_pages, "[CATEGORY] Listing truncated");
            pages = self.settings.max_pages;
        }

        let mut entries = parse_listing(&first)?;
        for page in 2..=pages {
            tokio::time::sleep(Duration::from_millis(self.settings.page_delay_ms)).await;
            let html = self.get_page(category, page).await?;
            entries.extend(parse_listing(&html)?);
        }

        let mut listed: Vec<ListedStory> = Vec::with_capacity(entries.len());
        for entry in &entries {
            if listed.iter().any(|l| l.identifier == entry.identifier) {
                continue;
            }
            listed.push(ListedStory {
                identifier: entry.identifier.clone(),
                changed: is_changed(entry, known),
            });
        }
        info!(category, pages, stories = listed.len(), "[CATEGORY] Category listed");
        Ok(listed)
    }
}
