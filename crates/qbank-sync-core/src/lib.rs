//! Domain model and reconciliation primitives shared by the question-bank
//! sync services.
//!
//! Adapters for the relational catalog, the search index and the classifier
//! live in their own crates and plug in through the port traits defined here:
//! [`KeyPager`], [`CatalogSource`], [`HistorySource`], [`DocumentScanner`],
//! [`AttributeWriter`] and [`Classifier`].

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[cfg(feature = "test-support")]
pub mod http_fixture;
pub mod memory;

/// Stored attribute value meaning "no objective assigned".
pub const UNRESOLVED_ATTRIBUTE: i64 = 0;
pub const DEFAULT_KEY_PAGE_SIZE: usize = 1000;
pub const DEFAULT_EXCLUDED_INSTITUTION_IDS: &[i64] = &[117];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
    #[error("transient I/O error: {0}")]
    TransientIo(String),
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("external service error: {0}")]
    ExternalService(String),
    #[error("run cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FatalConfig(_) => "fatal_config",
            Self::TransientIo(_) => "transient_io",
            Self::DataIntegrity(_) => "data_integrity",
            Self::ExternalService(_) => "external_service",
            Self::Cancelled(_) => "cancelled",
        }
    }

    #[must_use]
    pub fn fatal(context: &str, err: &anyhow::Error) -> Self {
        Self::FatalConfig(format!("{context}: {err:#}"))
    }

    #[must_use]
    pub fn transient(context: &str, err: &anyhow::Error) -> Self {
        Self::TransientIo(format!("{context}: {err:#}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BookId(pub i64);

impl Display for BookId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one question inside the catalog hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QuestionKey {
    pub book_id: BookId,
    pub test_id: i64,
    pub question_no: i64,
}

impl Display for QuestionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.book_id, self.test_id, self.question_no)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PackagingInfo {
    pub packaged_book_id: Option<i64>,
    pub zip_version: Option<String>,
    pub packaged_book_name: Option<String>,
    pub packaged_book_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EligibilityFlags {
    pub institution_active: bool,
    pub deleted: bool,
    pub question_count: i64,
    pub superseded: bool,
    pub packaged: bool,
}

/// One book row of the authoritative catalog, with the metadata reported
/// back when the book is missing from the index.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CatalogRecord {
    pub book_id: BookId,
    pub book_name: String,
    pub course_id: Option<i64>,
    pub institution_id: i64,
    pub institution_name: String,
    pub institution_domain: Option<String>,
    pub creates_trial_exams: bool,
    pub packaging: PackagingInfo,
    pub eligibility: EligibilityFlags,
}

/// Fixed eligibility conjunction for gap candidates. Only the institution
/// exclusion list is configurable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EligibilityPredicate {
    pub excluded_institution_ids: Vec<i64>,
}

impl Default for EligibilityPredicate {
    fn default() -> Self {
        Self {
            excluded_institution_ids: DEFAULT_EXCLUDED_INSTITUTION_IDS.to_vec(),
        }
    }
}

impl EligibilityPredicate {
    #[must_use]
    pub fn admits(&self, record: &CatalogRecord) -> bool {
        let flags = &record.eligibility;
        flags.institution_active
            && !flags.deleted
            && flags.question_count > 0
            && !flags.superseded
            && !flags.packaged
            && record.packaging.packaged_book_version.is_some()
            && !self.excluded_institution_ids.contains(&record.institution_id)
    }
}

/// A question document as stored in the search index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexedDocument {
    pub doc_id: String,
    pub book_id: Option<BookId>,
    pub test_id: Option<i64>,
    pub question_no: Option<i64>,
    pub course_id: Option<i64>,
    pub question_text: Option<String>,
    pub attribute: Option<i64>,
}

impl IndexedDocument {
    /// Returns the linking triple when all three parts are present. A book id
    /// of zero is treated as missing.
    #[must_use]
    pub fn question_key(&self) -> Option<QuestionKey> {
        let book_id = self.book_id.filter(|id| id.0 != 0)?;
        Some(QuestionKey {
            book_id,
            test_id: self.test_id?,
            question_no: self.question_no?,
        })
    }

    #[must_use]
    pub fn effective_course_id(&self) -> Option<i64> {
        self.course_id.filter(|course_id| *course_id != 0)
    }

    #[must_use]
    pub fn needs_attribute(&self) -> bool {
        matches!(self.attribute, None | Some(UNRESOLVED_ATTRIBUTE))
    }
}

/// Deep-scan filter: attribute missing or zero, optionally narrowed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScanFilter {
    pub course_id: Option<i64>,
    pub book_id: Option<BookId>,
}

impl ScanFilter {
    #[must_use]
    pub fn matches(&self, document: &IndexedDocument) -> bool {
        document.needs_attribute()
            && self
                .course_id
                .map_or(true, |course_id| document.course_id == Some(course_id))
            && self
                .book_id
                .map_or(true, |book_id| document.book_id == Some(book_id))
    }
}

/// One page of distinct index keys plus the continuation cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<BookId>,
    pub after_key: Option<BookId>,
}

pub type DocumentStream<'a> = Box<dyn Iterator<Item = Result<IndexedDocument>> + 'a>;

pub trait KeyPager {
    /// Fetch the page of distinct book keys strictly after `after`, in
    /// ascending key order.
    #[allow(clippy::missing_errors_doc)]
    fn next_page(&self, after: Option<BookId>, page_size: usize) -> Result<KeyPage>;
}

pub trait CatalogSource {
    #[allow(clippy::missing_errors_doc)]
    fn load_candidates(&self, predicate: &EligibilityPredicate) -> Result<Vec<CatalogRecord>>;
}

pub trait HistorySource {
    /// Previously recorded attribute for a question. Implementations return
    /// only non-null, non-zero values.
    #[allow(clippy::missing_errors_doc)]
    fn historical_attribute(&self, key: QuestionKey) -> Result<Option<i64>>;
}

pub trait DocumentScanner {
    /// Opens a fresh deep scan. The returned stream cannot be resumed once
    /// dropped; a new call starts again from the beginning.
    #[allow(clippy::missing_errors_doc)]
    fn scan(&self, filter: &ScanFilter) -> Result<DocumentStream<'_>>;
}

pub trait AttributeWriter {
    /// Partial update of the attribute field only. Writing the same value
    /// twice leaves the document unchanged.
    #[allow(clippy::missing_errors_doc)]
    fn apply(&self, doc_id: &str, attribute_id: i64) -> Result<()>;
}

pub trait Classifier {
    #[allow(clippy::missing_errors_doc)]
    fn predict(&self, course_id: i64, question_text: &str) -> Result<i64>;
}

/// Cooperative stop signal checked between pages and documents. A child flag
/// also reports cancellation when its parent is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.own)),
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEnumeration {
    pub keys: HashSet<BookId>,
    pub pages: usize,
}

/// Walks the composite cursor until exhausted and returns every distinct key.
///
/// # Errors
/// Returns [`SyncError::FatalConfig`] when a page request fails or the cursor
/// stops advancing monotonically, and [`SyncError::Cancelled`] when `cancel`
/// is raised between pages. No partial key set is ever returned.
pub fn collect_unique_keys(
    pager: &dyn KeyPager,
    page_size: usize,
    cancel: &CancellationFlag,
) -> Result<KeyEnumeration, SyncError> {
    if page_size == 0 {
        return Err(SyncError::FatalConfig(
            "key page size MUST be >= 1".to_string(),
        ));
    }

    let mut enumeration = KeyEnumeration::default();
    let mut after: Option<BookId> = None;
    let mut last_key: Option<BookId> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled(format!(
                "key enumeration stopped after {} pages",
                enumeration.pages
            )));
        }

        let page = pager
            .next_page(after, page_size)
            .map_err(|err| SyncError::fatal("index key page request failed", &err))?;
        enumeration.pages += 1;

        for key in &page.keys {
            if let Some(previous) = last_key {
                if *key <= previous {
                    return Err(SyncError::FatalConfig(format!(
                        "index cursor returned key {key} after {previous}; key order is not monotonic"
                    )));
                }
            }
            last_key = Some(*key);
            enumeration.keys.insert(*key);
        }

        match page.after_key {
            Some(next) if !page.keys.is_empty() => {
                if after.is_some_and(|previous| next <= previous) {
                    return Err(SyncError::FatalConfig(format!(
                        "index cursor did not advance past {next}"
                    )));
                }
                after = Some(next);
            }
            _ => break,
        }
    }

    tracing::debug!(
        target: "qbank_sync::cursor",
        pages = enumeration.pages,
        keys = enumeration.keys.len(),
        "index key enumeration complete"
    );
    Ok(enumeration)
}

/// Candidates whose book id is absent from the index, in candidate order and
/// with their catalog metadata untouched.
#[must_use]
pub fn find_missing(candidates: &[CatalogRecord], index_keys: &HashSet<BookId>) -> Vec<CatalogRecord> {
    candidates
        .iter()
        .filter(|record| !index_keys.contains(&record.book_id))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    MissingLinkingKey,
    MissingCourse,
    EmptyQuestionText,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Resolution {
    Historical { attribute_id: i64 },
    /// Classifier answer; zero is a legitimate class here.
    Predicted { attribute_id: i64 },
    PredictionFailed { reason: String },
    Unresolved { reason: UnresolvedReason },
}

impl Resolution {
    /// Value to write back to the index, if any. A failed prediction is
    /// stored as [`UNRESOLVED_ATTRIBUTE`].
    #[must_use]
    pub fn write_value(&self) -> Option<i64> {
        match self {
            Self::Historical { attribute_id } | Self::Predicted { attribute_id } => {
                Some(*attribute_id)
            }
            Self::PredictionFailed { .. } => Some(UNRESOLVED_ATTRIBUTE),
            Self::Unresolved { .. } => None,
        }
    }
}

/// Ordered lookup: authoritative history first, classifier second.
pub struct AttributeResolver<'a> {
    history: &'a dyn HistorySource,
    classifier: &'a dyn Classifier,
}

impl<'a> AttributeResolver<'a> {
    #[must_use]
    pub fn new(history: &'a dyn HistorySource, classifier: &'a dyn Classifier) -> Self {
        Self {
            history,
            classifier,
        }
    }

    /// Resolves the attribute for one document: history first, then the
    /// classifier.
    ///
    /// # Errors
    /// Returns [`SyncError::TransientIo`] when the history lookup fails.
    /// Classifier failures never surface as errors; they degrade to
    /// [`Resolution::PredictionFailed`].
    pub fn resolve(&self, document: &IndexedDocument) -> Result<Resolution, SyncError> {
        if let Some(resolution) = self.resolve_historical(document)? {
            return Ok(resolution);
        }
        Ok(self.resolve_predicted(document))
    }

    /// First strategy. Returns `Some` when the document is settled without
    /// consulting the classifier: either a valid historical assignment or a
    /// missing linking key.
    ///
    /// # Errors
    /// Returns [`SyncError::TransientIo`] when the history lookup fails.
    pub fn resolve_historical(
        &self,
        document: &IndexedDocument,
    ) -> Result<Option<Resolution>, SyncError> {
        let Some(key) = document.question_key() else {
            return Ok(Some(Resolution::Unresolved {
                reason: UnresolvedReason::MissingLinkingKey,
            }));
        };

        let historical = self.history.historical_attribute(key).map_err(|err| {
            SyncError::transient(&format!("history lookup failed for {key}"), &err)
        })?;
        Ok(historical
            .filter(|value| *value != UNRESOLVED_ATTRIBUTE)
            .map(|attribute_id| Resolution::Historical { attribute_id }))
    }

    /// Second strategy. Only meaningful after [`Self::resolve_historical`]
    /// returned `None`.
    #[must_use]
    pub fn resolve_predicted(&self, document: &IndexedDocument) -> Resolution {
        let Some(course_id) = document.effective_course_id() else {
            return Resolution::Unresolved {
                reason: UnresolvedReason::MissingCourse,
            };
        };

        let Some(text) = document
            .question_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
        else {
            return Resolution::Unresolved {
                reason: UnresolvedReason::EmptyQuestionText,
            };
        };

        match self.classifier.predict(course_id, text) {
            Ok(attribute_id) => Resolution::Predicted { attribute_id },
            Err(err) => {
                let failure = SyncError::ExternalService(format!("{err:#}"));
                tracing::warn!(
                    target: "qbank_sync::resolver",
                    doc_id = %document.doc_id,
                    course_id,
                    error = %failure,
                    "classifier call failed; falling back to sentinel"
                );
                Resolution::PredictionFailed {
                    reason: failure.to_string(),
                }
            }
        }
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn format_rfc3339(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}
