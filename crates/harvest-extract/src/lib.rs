//! Paginated ticket extraction from an authenticated browser context.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_browser::{page_html, wait_until_ready, Browser, BrowserError};
use harvest_core::{is_ticket_key, Ticket};
use harvest_storage::PageArchive;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One entry of the collection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionQuery {
    pub name: String,
    pub query: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CollectionQuery {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("collection `{collection}` returned no tickets for query `{query}`")]
    EmptyResult { collection: String, query: String },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("invalid listing url: {0}")]
    InvalidUrl(String),
    #[error("archiving page failed: {0:#}")]
    Archive(anyhow::Error),
    #[error("listing parse failed: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub base_url: String,
    pub search_path: String,
    pub page_size: usize,
    /// Hard cap on tickets taken from one collection.
    pub max_records: usize,
    pub page_ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl ExtractorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            search_path: "/issues/".to_string(),
            page_size: 50,
            max_records: 5_000,
            page_ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// DOM layouts the issue navigator can render, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    IssueTable,
    IssueList,
    LinkScan,
}

pub const RECORD_SHAPE_PRIORITY: [RecordShape; 3] = [
    RecordShape::IssueTable,
    RecordShape::IssueList,
    RecordShape::LinkScan,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    /// `None` when no shape produced a record.
    pub shape: Option<RecordShape>,
    pub tickets: Vec<Ticket>,
    /// Rows the shape matched, counting rows whose key was rejected.
    pub rows: usize,
}

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Parse(format!("{css}: {e}")))
}

fn clean_text(raw: impl AsRef<str>) -> String {
    raw.as_ref().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(element.text().collect::<String>())
}

/// Cell text, falling back to an image's alt/title (priority icons render that way).
fn cell_value(row: ElementRef<'_>, cell: &Selector, img: &Selector) -> String {
    let Some(node) = row.select(cell).next() else {
        return String::new();
    };
    let text = element_text(node);
    if !text.is_empty() {
        return text;
    }
    node.select(img)
        .next()
        .and_then(|i| i.value().attr("alt").or_else(|| i.value().attr("title")))
        .map(clean_text)
        .unwrap_or_default()
}

fn parse_issue_table(document: &Html) -> Result<(Vec<Ticket>, usize), ExtractionError> {
    let rows = selector("tr.issuerow[data-issuekey]")?;
    let img = selector("img")?;
    let columns = [
        "td.summary",
        "td.status",
        "td.assignee",
        "td.reporter",
        "td.created",
        "td.updated",
        "td.priority",
        "td.description",
    ]
    .iter()
    .map(|css| selector(css))
    .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    let mut matched = 0;
    for row in document.select(&rows) {
        matched += 1;
        let key = row.value().attr("data-issuekey").unwrap_or_default();
        let Some(mut ticket) = Ticket::with_key(key.trim()) else {
            continue;
        };
        let values: Vec<String> = columns.iter().map(|c| cell_value(row, c, &img)).collect();
        if let [summary, status, assignee, reporter, created, updated, priority, description] =
            values.as_slice()
        {
            ticket.summary = summary.clone();
            ticket.status = status.clone();
            ticket.assignee = assignee.clone();
            ticket.reporter = reporter.clone();
            ticket.created = created.clone();
            ticket.updated = updated.clone();
            ticket.priority = priority.clone();
            ticket.description = description.clone();
        }
        out.push(ticket);
    }
    Ok((out, matched))
}

fn parse_issue_list(document: &Html) -> Result<(Vec<Ticket>, usize), ExtractionError> {
    let items = selector("ol.issue-list li[data-key]")?;
    let summary = selector(".issue-link-summary")?;
    let mut out = Vec::new();
    let mut matched = 0;
    for item in document.select(&items) {
        matched += 1;
        let key = item.value().attr("data-key").unwrap_or_default();
        let Some(mut ticket) = Ticket::with_key(key.trim()) else {
            continue;
        };
        ticket.summary = item
            .select(&summary)
            .next()
            .map(element_text)
            .filter(|s| !s.is_empty())
            .or_else(|| item.value().attr("title").map(clean_text))
            .unwrap_or_default();
        out.push(ticket);
    }
    Ok((out, matched))
}

/// Links carry no row structure, so every row it reports is a valid ticket.
fn parse_link_scan(document: &Html) -> Result<(Vec<Ticket>, usize), ExtractionError> {
    let links = selector("a[href*='/browse/']")?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for link in document.select(&links) {
        let text = element_text(link);
        if !is_ticket_key(&text) || !seen.insert(text.clone()) {
            continue;
        }
        let Some(mut ticket) = Ticket::with_key(text) else {
            continue;
        };
        ticket.summary = link.value().attr("title").map(clean_text).unwrap_or_default();
        out.push(ticket);
    }
    let matched = out.len();
    Ok((out, matched))
}

/// Parses one listing page, committing to the first shape that yields a record.
///
/// When no shape yields a record, `rows` still reports the first shape that matched
/// rows at all, so a page of unparseable keys does not read as the end of the listing.
pub fn parse_page(html: &str) -> Result<ParsedPage, ExtractionError> {
    let document = Html::parse_document(html);
    let mut unmatched_rows = 0;
    for shape in RECORD_SHAPE_PRIORITY {
        let (tickets, rows) = match shape {
            RecordShape::IssueTable => parse_issue_table(&document)?,
            RecordShape::IssueList => parse_issue_list(&document)?,
            RecordShape::LinkScan => parse_link_scan(&document)?,
        };
        if !tickets.is_empty() {
            return Ok(ParsedPage {
                shape: Some(shape),
                tickets,
                rows,
            });
        }
        if unmatched_rows == 0 {
            unmatched_rows = rows;
        }
    }
    Ok(ParsedPage {
        shape: None,
        tickets: Vec::new(),
        rows: unmatched_rows,
    })
}

#[derive(Debug, Clone)]
pub struct TicketPage {
    pub index: usize,
    pub offset: usize,
    pub shape: Option<RecordShape>,
    pub tickets: Vec<Ticket>,
    pub archive_path: Option<PathBuf>,
}

/// Walks one collection page by page. Finite and single-pass: once exhausted it keeps
/// returning `None`.
pub struct PageCursor<'a> {
    extractor: &'a Extractor,
    browser: &'a dyn Browser,
    collection: &'a CollectionQuery,
    run_id: Uuid,
    next_index: usize,
    taken: usize,
    truncated: bool,
    done: bool,
}

impl<'a> PageCursor<'a> {
    pub fn taken(&self) -> usize {
        self.taken
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub async fn next_batch(&mut self) -> Result<Option<TicketPage>, ExtractionError> {
        if self.done {
            return Ok(None);
        }
        let config = &self.extractor.config;
        let page_size = config.page_size.max(1);
        let index = self.next_index;
        let offset = index * page_size;
        let url = self.extractor.page_url(&self.collection.query, offset)?;

        debug!(collection = %self.collection.name, page = index, %url, "loading listing page");
        self.browser.navigate(url.as_str()).await?;
        wait_until_ready(self.browser, config.page_ready_timeout, config.poll_interval).await?;
        let html = page_html(self.browser).await?;

        let archive_path = match &self.extractor.archive {
            Some(archive) => Some(
                archive
                    .store_page(self.run_id, &self.collection.name, index, &html)
                    .await
                    .map_err(ExtractionError::Archive)?
                    .relative_path,
            ),
            None => None,
        };

        let parsed = parse_page(&html)?;
        let mut tickets = parsed.tickets;
        let rows = parsed.rows;
        let found = tickets.len();
        self.next_index += 1;

        if rows < page_size {
            self.done = true;
        }
        let remaining = config.max_records.saturating_sub(self.taken);
        if found > remaining {
            tickets.truncate(remaining);
            self.truncated = true;
        }
        self.taken += tickets.len();
        if self.taken >= config.max_records {
            if !self.done && rows >= page_size {
                self.truncated = true;
            }
            self.done = true;
        }

        debug!(
            collection = %self.collection.name,
            page = index,
            rows,
            skipped = rows.saturating_sub(found),
            kept = tickets.len(),
            shape = ?parsed.shape,
            "listing page parsed"
        );
        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(TicketPage {
            index,
            offset,
            shape: parsed.shape,
            tickets,
            archive_path,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSummary {
    pub index: usize,
    pub offset: usize,
    pub shape: Option<RecordShape>,
    pub count: usize,
    pub archive_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CollectionExtract {
    pub collection: CollectionQuery,
    pub tickets: Vec<Ticket>,
    pub pages: Vec<PageSummary>,
    /// Set when the record cap cut the collection short.
    pub truncated: bool,
}

impl CollectionExtract {
    pub fn require_nonempty(&self) -> Result<(), ExtractionError> {
        if self.tickets.is_empty() {
            return Err(ExtractionError::EmptyResult {
                collection: self.collection.name.clone(),
                query: self.collection.query.clone(),
            });
        }
        Ok(())
    }

    pub fn projects(&self) -> Vec<String> {
        self.tickets
            .iter()
            .map(|t| t.project.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn report(&self, environment: &str, generated_at: DateTime<Utc>) -> ExtractionReport {
        ExtractionReport {
            environment: environment.to_string(),
            collection: self.collection.name.clone(),
            collection_query: self.collection.query.clone(),
            generated_at,
            total_tickets: self.tickets.len(),
            truncated: self.truncated,
            projects: self.projects(),
            pages: self.pages.clone(),
            tickets: self.tickets.clone(),
        }
    }
}

/// Audit artifact written once per collection per run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionReport {
    pub environment: String,
    pub collection: String,
    pub collection_query: String,
    pub generated_at: DateTime<Utc>,
    pub total_tickets: usize,
    pub truncated: bool,
    pub projects: Vec<String>,
    pub pages: Vec<PageSummary>,
    pub tickets: Vec<Ticket>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractorConfig,
    archive: Option<PageArchive>,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn page_url(&self, query: &str, offset: usize) -> Result<Url, ExtractionError> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| ExtractionError::InvalidUrl(format!("{}: {e}", self.config.base_url)))?;
        let mut url = base
            .join(&self.config.search_path)
            .map_err(|e| ExtractionError::InvalidUrl(format!("{}: {e}", self.config.search_path)))?;
        url.query_pairs_mut()
            .append_pair("jql", query)
            .append_pair("startIndex", &offset.to_string());
        Ok(url)
    }

    pub fn cursor<'a>(
        &'a self,
        browser: &'a dyn Browser,
        collection: &'a CollectionQuery,
        run_id: Uuid,
    ) -> PageCursor<'a> {
        PageCursor {
            extractor: self,
            browser,
            collection,
            run_id,
            next_index: 0,
            taken: 0,
            truncated: false,
            done: false,
        }
    }

    /// Drains a cursor for `collection`, preserving page order.
    pub async fn extract_all(
        &self,
        browser: &dyn Browser,
        collection: &CollectionQuery,
        run_id: Uuid,
    ) -> Result<CollectionExtract, ExtractionError> {
        let mut cursor = self.cursor(browser, collection, run_id);
        let mut tickets = Vec::new();
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_batch().await? {
            pages.push(PageSummary {
                index: page.index,
                offset: page.offset,
                shape: page.shape,
                count: page.tickets.len(),
                archive_path: page.archive_path,
            });
            tickets.extend(page.tickets);
        }
        let truncated = cursor.truncated();
        if truncated {
            warn!(
                collection = %collection.name,
                cap = self.config.max_records,
                "record cap reached"
            );
        }
        info!(
            collection = %collection.name,
            pages = pages.len(),
            tickets = tickets.len(),
            "collection extracted"
        );
        Ok(CollectionExtract {
            collection: collection.clone(),
            tickets,
            pages,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_core::Cookie;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn table_page(keys: &[String]) -> String {
        let rows: String = keys
            .iter()
            .map(|k| {
                format!(
                    r#"<tr class="issuerow" data-issuekey="{k}">
                        <td class="issuekey"><a href="/browse/{k}">{k}</a></td>
                        <td class="summary"><p>Summary   of {k}</p></td>
                        <td class="status"><span>Open</span></td>
                        <td class="assignee">Dana</td>
                        <td class="priority"><img alt="High" src="/p.svg"></td>
                    </tr>"#
                )
            })
            .collect();
        format!("<html><body><table id=\"issuetable\"><tbody>{rows}</tbody></table></body></html>")
    }

    fn keys(start: usize, count: usize) -> Vec<String> {
        (start..start + count).map(|n| format!("OPS-{n}")).collect()
    }

    /// Serves `pages[startIndex / page_size]` as an issue table.
    struct ListingBrowser {
        page_size: usize,
        pages: Vec<usize>,
        renamed: Vec<(String, String)>,
        current: Mutex<String>,
        navigations: Mutex<Vec<String>>,
    }

    impl ListingBrowser {
        fn new(page_size: usize, pages: Vec<usize>) -> Self {
            Self {
                page_size,
                pages,
                renamed: Vec::new(),
                current: Mutex::new(String::new()),
                navigations: Mutex::new(Vec::new()),
            }
        }

        fn renaming(mut self, from: &str, to: &str) -> Self {
            self.renamed.push((from.to_string(), to.to_string()));
            self
        }

        fn html_for(&self, url: &str) -> String {
            let parsed = Url::parse(url).unwrap();
            let offset: usize = parsed
                .query_pairs()
                .find(|(k, _)| k == "startIndex")
                .map(|(_, v)| v.parse().unwrap())
                .unwrap();
            let index = offset / self.page_size;
            let count = self.pages.get(index).copied().unwrap_or(0);
            let page_keys: Vec<String> = keys(offset + 1, count)
                .into_iter()
                .map(|key| {
                    self.renamed
                        .iter()
                        .find(|(from, _)| *from == key)
                        .map(|(_, to)| to.clone())
                        .unwrap_or(key)
                })
                .collect();
            table_page(&page_keys)
        }
    }

    #[async_trait]
    impl Browser for ListingBrowser {
        async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
            *self.current.lock().unwrap() = url.to_string();
            self.navigations.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn evaluate(&self, script: &str) -> Result<JsonValue, BrowserError> {
            if script == "document.readyState" {
                return Ok(JsonValue::String("complete".into()));
            }
            let url = self.current.lock().unwrap().clone();
            Ok(JsonValue::String(self.html_for(&url)))
        }

        async fn fill(&self, _selector: &str, _value: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn click(&self, _selector: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn press_enter(&self, _selector: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn current_url(&self) -> Result<String, BrowserError> {
            Ok(self.current.lock().unwrap().clone())
        }

        async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
            Ok(Vec::new())
        }

        async fn set_cookies(&self, _cookies: &[Cookie]) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    fn config(page_size: usize, max_records: usize) -> ExtractorConfig {
        ExtractorConfig {
            page_size,
            max_records,
            ..ExtractorConfig::new("https://jira.example.com")
        }
    }

    #[tokio::test]
    async fn short_final_page_ends_collection() {
        let browser = ListingBrowser::new(50, vec![50, 50, 12]);
        let extractor = Extractor::new(config(50, 10_000));
        let collection = CollectionQuery::new("ops", "project = OPS ORDER BY key");

        let extract = extractor
            .extract_all(&browser, &collection, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(extract.tickets.len(), 112);
        assert_eq!(browser.navigations.lock().unwrap().len(), 3);
        assert_eq!(extract.tickets.first().unwrap().key, "OPS-1");
        assert_eq!(extract.tickets.last().unwrap().key, "OPS-112");
        assert!(!extract.truncated);
        let offsets: Vec<usize> = extract.pages.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 50, 100]);
    }

    #[tokio::test]
    async fn rejected_keys_do_not_shorten_a_full_page() {
        let browser = ListingBrowser::new(3, vec![3, 2]).renaming("OPS-2", "AB2-5");
        let extractor = Extractor::new(config(3, 100));
        let collection = CollectionQuery::new("ops", "project in (OPS, AB2)");

        let extract = extractor
            .extract_all(&browser, &collection, Uuid::new_v4())
            .await
            .unwrap();

        let keys: Vec<&str> = extract.tickets.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["OPS-1", "OPS-3", "OPS-4", "OPS-5"]);
        assert_eq!(browser.navigations.lock().unwrap().len(), 2);
        assert_eq!(extract.pages.len(), 2);
        assert_eq!(extract.pages[0].count, 2);
    }

    #[test]
    fn rows_count_rejected_keys() {
        let html = r#"<table>
            <tr class="issuerow" data-issuekey="OPS-1"></tr>
            <tr class="issuerow" data-issuekey="AB2-5"></tr>
        </table>"#;
        let parsed = parse_page(html).unwrap();
        assert_eq!(parsed.tickets.len(), 1);
        assert_eq!(parsed.rows, 2);

        let rejected_only = r#"<ol class="issue-list"><li data-key="AB2-5"></li></ol>"#;
        let parsed = parse_page(rejected_only).unwrap();
        assert_eq!(parsed.shape, None);
        assert_eq!(parsed.rows, 1);
    }

    #[tokio::test]
    async fn record_cap_stops_pagination() {
        let browser = ListingBrowser::new(50, vec![50, 50, 50, 50]);
        let extractor = Extractor::new(config(50, 70));
        let collection = CollectionQuery::new("ops", "project = OPS");

        let extract = extractor
            .extract_all(&browser, &collection, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(extract.tickets.len(), 70);
        assert_eq!(browser.navigations.lock().unwrap().len(), 2);
        assert!(extract.truncated);
    }

    #[tokio::test]
    async fn exhausted_cursor_stays_exhausted() {
        let browser = ListingBrowser::new(10, vec![4]);
        let extractor = Extractor::new(config(10, 100));
        let collection = CollectionQuery::new("ops", "project = OPS");
        let mut cursor = extractor.cursor(&browser, &collection, Uuid::new_v4());

        assert_eq!(cursor.next_batch().await.unwrap().unwrap().tickets.len(), 4);
        assert!(cursor.next_batch().await.unwrap().is_none());
        assert!(cursor.next_batch().await.unwrap().is_none());
        assert_eq!(browser.navigations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_collection_is_reported_not_raised() {
        let browser = ListingBrowser::new(50, vec![0]);
        let extractor = Extractor::new(config(50, 100));
        let collection = CollectionQuery::new("nothing", "project = NONE");

        let extract = extractor
            .extract_all(&browser, &collection, Uuid::new_v4())
            .await
            .unwrap();
        assert!(extract.tickets.is_empty());
        assert!(matches!(
            extract.require_nonempty(),
            Err(ExtractionError::EmptyResult { ref collection, .. }) if collection == "nothing"
        ));
    }

    #[tokio::test]
    async fn pages_are_archived_per_collection() {
        let dir = tempdir().unwrap();
        let browser = ListingBrowser::new(5, vec![5, 2]);
        let extractor = Extractor::new(config(5, 100)).with_archive(PageArchive::new(dir.path()));
        let collection = CollectionQuery::new("Open Bugs", "type = Bug");

        let extract = extractor
            .extract_all(&browser, &collection, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(extract.pages.len(), 2);
        for page in &extract.pages {
            let rel = page.archive_path.as_ref().unwrap();
            assert!(rel.to_string_lossy().contains("open-bugs"));
            assert!(dir.path().join(rel).exists());
        }
    }

    #[test]
    fn page_url_carries_query_and_offset() {
        let extractor = Extractor::new(config(50, 100));
        let url = extractor.page_url("project = OPS", 100).unwrap();
        assert_eq!(url.path(), "/issues/");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("jql".to_string(), "project = OPS".to_string()),
                ("startIndex".to_string(), "100".to_string())
            ]
        );
    }

    #[test]
    fn table_rows_map_to_ticket_fields() {
        let parsed = parse_page(&table_page(&["PLAT-9".to_string()])).unwrap();
        assert_eq!(parsed.shape, Some(RecordShape::IssueTable));
        let ticket = &parsed.tickets[0];
        assert_eq!(ticket.project, "PLAT");
        assert_eq!(ticket.summary, "Summary of PLAT-9");
        assert_eq!(ticket.status, "Open");
        assert_eq!(ticket.priority, "High");
        assert_eq!(ticket.reporter, "");
    }

    #[test]
    fn first_matching_shape_wins_without_mixing() {
        let html = r#"<html><body>
            <table><tr class="issuerow" data-issuekey="OPS-1"><td class="summary">Table row</td></tr></table>
            <ol class="issue-list"><li data-key="OPS-2" title="List item"></li></ol>
            <a href="/browse/OPS-3">OPS-3</a>
        </body></html>"#;
        let parsed = parse_page(html).unwrap();
        assert_eq!(parsed.shape, Some(RecordShape::IssueTable));
        let keys: Vec<&str> = parsed.tickets.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["OPS-1"]);

        let list_only = r#"<ol class="issue-list">
            <li data-key="OPS-2"><span class="issue-link-summary">Fix   login</span></li>
            <li data-key="bogus"></li>
        </ol><a href="/browse/OPS-3">OPS-3</a>"#;
        let parsed = parse_page(list_only).unwrap();
        assert_eq!(parsed.shape, Some(RecordShape::IssueList));
        assert_eq!(parsed.tickets.len(), 1);
        assert_eq!(parsed.tickets[0].summary, "Fix login");

        let links_only = r#"<a href="/browse/OPS-3" title="Third">OPS-3</a>
            <a href="/browse/OPS-3">OPS-3</a>
            <a href="/browse/OPS-4">Open in new tab</a>"#;
        let parsed = parse_page(links_only).unwrap();
        assert_eq!(parsed.shape, Some(RecordShape::LinkScan));
        assert_eq!(parsed.tickets.len(), 1);
        assert_eq!(parsed.tickets[0].summary, "Third");

        assert_eq!(parse_page("<p>no results</p>").unwrap().shape, None);
    }
}
