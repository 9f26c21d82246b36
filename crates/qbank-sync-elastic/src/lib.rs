#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

//! Blocking search-index adapter: composite key paging for gap detection,
//! scroll scans and partial updates for the attribute backfill.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use qbank_sync_core::{
    AttributeWriter, BookId, DocumentScanner, DocumentStream, IndexedDocument, KeyPage, KeyPager,
    ScanFilter,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod query;

use query::{
    ClearScrollRequest, CompositeRequest, CompositeResponse, PartialUpdate, ScanRequest,
    ScrollRequest, SearchResponse,
};

pub const DEFAULT_HOST: &str = "http://localhost:9200";
pub const DEFAULT_INDEX: &str = "question_bank";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 500;
pub const DEFAULT_SCROLL_KEEP_ALIVE: &str = "1m";

const DOC_ID_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticConfig {
    pub host: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub scan_batch_size: usize,
    pub scroll_keep_alive: String,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            index: DEFAULT_INDEX.to_string(),
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            scroll_keep_alive: DEFAULT_SCROLL_KEEP_ALIVE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElasticClient {
    agent: ureq::Agent,
    base_url: String,
    config: ElasticConfig,
    authorization: Option<String>,
}

impl ElasticClient {
    pub fn new(config: ElasticConfig) -> Result<Self> {
        let base_url = config.host.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("search index host must not be empty"));
        }
        if config.index.trim().is_empty() {
            return Err(anyhow!("search index name must not be empty"));
        }
        if config.scan_batch_size == 0 {
            return Err(anyhow!("scan batch size must be positive"));
        }

        let authorization = match (&config.username, &config.password) {
            (Some(user), password) => {
                let credentials = format!("{user}:{}", password.as_deref().unwrap_or_default());
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                ))
            }
            (None, _) => None,
        };

        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            agent,
            base_url,
            config,
            authorization,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    /// Cluster reachability check.
    pub fn ping(&self) -> Result<()> {
        let request = self.request("GET", "/");
        match request.call() {
            Ok(_) => Ok(()),
            Err(err) => Err(describe_failure("GET", "/", err)),
        }
    }

    pub fn composite_page(&self, after: Option<BookId>, page_size: usize) -> Result<KeyPage> {
        let path = format!("/{}/_search", self.config.index);
        let response: CompositeResponse =
            self.send_json("POST", &path, &CompositeRequest::book_keys(after, page_size))?;
        let (keys, after_key) = response.into_page()?;
        tracing::debug!(
            target: "qbank_sync::elastic",
            after = ?after,
            keys = keys.len(),
            next = ?after_key,
            "composite page fetched"
        );
        Ok(KeyPage { keys, after_key })
    }

    pub fn open_scroll(&self, filter: &ScanFilter) -> Result<SearchResponse> {
        let path = format!(
            "/{}/_search?scroll={}",
            self.config.index, self.config.scroll_keep_alive
        );
        self.send_json(
            "POST",
            &path,
            &ScanRequest::new(filter, self.config.scan_batch_size),
        )
    }

    pub fn next_scroll(&self, scroll_id: &str) -> Result<SearchResponse> {
        self.send_json(
            "POST",
            "/_search/scroll",
            &ScrollRequest {
                scroll: &self.config.scroll_keep_alive,
                scroll_id,
            },
        )
    }

    pub fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let _: serde_json::Value = self.send_json(
            "DELETE",
            "/_search/scroll",
            &ClearScrollRequest {
                scroll_id: [scroll_id],
            },
        )?;
        Ok(())
    }

    /// Partial update of the attribute field only; reapplying the same value
    /// leaves the document unchanged.
    pub fn update_attribute(&self, doc_id: &str, attribute_id: i64) -> Result<()> {
        let path = format!(
            "/{}/_update/{}",
            self.config.index,
            utf8_percent_encode(doc_id, DOC_ID_SEGMENT)
        );
        let _: serde_json::Value =
            self.send_json("POST", &path, &PartialUpdate::attribute(attribute_id))?;
        Ok(())
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let request = self
            .agent
            .request(method, &format!("{}{path}", self.base_url))
            .set("accept", "application/json");
        match &self.authorization {
            Some(value) => request.set("authorization", value),
            None => request,
        }
    }

    fn send_json<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let request = self
            .request(method, path)
            .set("content-type", "application/json");
        match request.send_json(body) {
            Ok(response) => response
                .into_json::<T>()
                .with_context(|| format!("failed to decode response of {method} {path}")),
            Err(err) => Err(describe_failure(method, path, err)),
        }
    }
}

fn describe_failure(method: &str, path: &str, err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let mut body = response.into_string().unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            anyhow!("search index returned http status {code} for {method} {path}: {body}")
        }
        ureq::Error::Transport(err) => {
            anyhow!("search index transport failure for {method} {path}: {err}")
        }
    }
}

/// Lazy scroll over every matching document. The server-side scroll is
/// released when the scan is dropped.
pub struct ScrollScan<'a> {
    client: &'a ElasticClient,
    scroll_id: Option<String>,
    buffer: VecDeque<IndexedDocument>,
    exhausted: bool,
}

impl<'a> ScrollScan<'a> {
    pub fn open(client: &'a ElasticClient, filter: &ScanFilter) -> Result<Self> {
        let first = client
            .open_scroll(filter)
            .context("failed to open scroll scan")?;
        let mut scan = Self {
            client,
            scroll_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        scan.absorb(first);
        Ok(scan)
    }

    fn absorb(&mut self, page: SearchResponse) {
        if page.scroll_id.is_some() {
            self.scroll_id = page.scroll_id;
        }
        if page.hits.hits.is_empty() {
            self.exhausted = true;
        }
        self.buffer
            .extend(page.hits.hits.into_iter().map(query::Hit::into_document));
    }
}

impl Iterator for ScrollScan<'_> {
    type Item = Result<IndexedDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Some(Ok(document));
            }
            if self.exhausted {
                return None;
            }
            let Some(scroll_id) = self.scroll_id.clone() else {
                self.exhausted = true;
                return None;
            };
            match self.client.next_scroll(&scroll_id) {
                Ok(page) => self.absorb(page),
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err.context("scroll continuation failed")));
                }
            }
        }
    }
}

impl Drop for ScrollScan<'_> {
    fn drop(&mut self) {
        if let Some(scroll_id) = self.scroll_id.take() {
            if let Err(err) = self.client.clear_scroll(&scroll_id) {
                tracing::debug!(target: "qbank_sync::elastic", error = %err, "failed to clear scroll");
            }
        }
    }
}

impl KeyPager for ElasticClient {
    fn next_page(&self, after: Option<BookId>, page_size: usize) -> Result<KeyPage> {
        self.composite_page(after, page_size)
    }
}

impl DocumentScanner for ElasticClient {
    fn scan(&self, filter: &ScanFilter) -> Result<DocumentStream<'_>> {
        Ok(Box::new(ScrollScan::open(self, filter)?))
    }
}

impl AttributeWriter for ElasticClient {
    fn apply(&self, doc_id: &str, attribute_id: i64) -> Result<()> {
        self.update_attribute(doc_id, attribute_id)
    }
}
