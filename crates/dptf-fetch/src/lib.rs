//! Session-scoped fetch capability for the external tender table.
//!
//! The engine treats the external source as an opaque tabular fetcher:
//! open a session, fetch rows for a query under a bounded timeout, close
//! the session. `HtmlTableFetcher` is the production implementation that
//! issues the HTTP query and parses the result table.

use std::time::Duration;

use async_trait::async_trait;
use dptf_core::TenderQuery;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dptf-fetch";

/// Minimum number of cells a result row must have to be extractable.
pub const MIN_ROW_CELLS: usize = 9;

/// Anchor found in the title cell of a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLink {
    pub text: String,
    pub href: String,
}

/// One raw result row: positional cell texts (1-indexed in the source's
/// table layout, 0-indexed here) plus the title-cell anchor if present.
/// The first cell keeps its line structure; its first line is the tender
/// number and following lines are secondary text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRow {
    pub cells: Vec<String>,
    pub title_link: Option<RawLink>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
}

/// Capability to open one fetch session against the external source.
#[async_trait]
pub trait TableFetcher: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn TableSession>, FetchError>;
}

/// One stateful session. Not safe for concurrent queries; the orchestrator
/// runs conditions sequentially against a single session and closes it on
/// every exit path.
#[async_trait]
pub trait TableSession: Send {
    async fn fetch_rows(
        &mut self,
        query: &TenderQuery,
        timeout: Duration,
    ) -> Result<Vec<RawRow>, FetchError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "dptf-bot/0.1".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Production fetcher: one reqwest client per session, rows parsed out of
/// the `#tpam` result table.
#[derive(Debug, Clone, Default)]
pub struct HtmlTableFetcher {
    config: HttpClientConfig,
}

impl HtmlTableFetcher {
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TableFetcher for HtmlTableFetcher {
    async fn open_session(&self) -> Result<Box<dyn TableSession>, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(self.config.connect_timeout)
            .build()
            .map_err(|err| FetchError::SessionUnavailable(err.to_string()))?;
        Ok(Box::new(HtmlSession { client }))
    }
}

struct HtmlSession {
    client: reqwest::Client,
}

#[async_trait]
impl TableSession for HtmlSession {
    async fn fetch_rows(
        &mut self,
        query: &TenderQuery,
        timeout: Duration,
    ) -> Result<Vec<RawRow>, FetchError> {
        let request = self.client.get(&query.endpoint).query(&query.params);

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout(timeout))??;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = tokio::time::timeout(timeout, response.text())
            .await
            .map_err(|_| FetchError::Timeout(timeout))??;

        let rows = parse_result_rows(&body)?;
        debug!(url = %final_url, rows = rows.len(), "parsed result table");
        Ok(rows)
    }

    async fn close(&mut self) {
        // The HTTP client holds no server-side state; dropping it releases
        // the connection pool.
        debug!("closing fetch session");
    }
}

/// Parses the `#tpam > tbody > tr` result rows out of a search response.
/// Rows with fewer cells than the minimum are still returned; rejecting
/// them is the extractor's call, not the parser's.
pub fn parse_result_rows(html: &str) -> Result<Vec<RawRow>, FetchError> {
    let row_selector = selector("#tpam > tbody > tr")?;
    let cell_selector = selector("td")?;
    let title_link_selector = selector("td.tl > a")?;

    let document = Html::parse_document(html);
    let mut rows = Vec::new();
    for row in document.select(&row_selector) {
        let cells = row
            .select(&cell_selector)
            .map(|cell| cell_text(cell).trim().to_string())
            .collect::<Vec<_>>();
        let title_link = row.select(&title_link_selector).next().map(|anchor| RawLink {
            text: anchor.text().collect::<String>().trim().to_string(),
            href: anchor.value().attr("href").unwrap_or_default().to_string(),
        });
        rows.push(RawRow { cells, title_link });
    }
    Ok(rows)
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|err| FetchError::Message(format!("bad selector {css:?}: {err}")))
}

/// Text content of a cell with `<br>` elements rendered as newlines, so the
/// multi-line tender-number block keeps its line structure.
fn cell_text(cell: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in cell.descendants() {
        if let Some(text) = node.value().as_text() {
            out.push_str(&text.text);
        } else if let Some(element) = node.value().as_element() {
            if element.name() == "br" {
                out.push('\n');
            }
        }
    }
    out
}
