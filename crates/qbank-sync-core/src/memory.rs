//! In-memory adapters for the port traits. Used by tests and by dry runs
//! against fixture data.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::{
    AttributeWriter, BookId, CatalogRecord, CatalogSource, Classifier, DocumentScanner,
    DocumentStream, EligibilityPredicate, HistorySource, IndexedDocument, KeyPage, KeyPager,
    QuestionKey, ScanFilter,
};

/// Search index stand-in keyed by document id.
#[derive(Debug, Default)]
pub struct InMemoryQuestionIndex {
    documents: Mutex<BTreeMap<String, IndexedDocument>>,
    failing_updates: BTreeSet<String>,
    scan_failure_after: Option<usize>,
    updates: Mutex<Vec<(String, i64)>>,
}

impl InMemoryQuestionIndex {
    pub fn new(documents: impl IntoIterator<Item = IndexedDocument>) -> Self {
        Self {
            documents: Mutex::new(
                documents
                    .into_iter()
                    .map(|document| (document.doc_id.clone(), document))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_failing_update(mut self, doc_id: &str) -> Self {
        self.failing_updates.insert(doc_id.to_string());
        self
    }

    /// Makes every scan fail after yielding `count` documents.
    #[must_use]
    pub fn with_scan_failure_after(mut self, count: usize) -> Self {
        self.scan_failure_after = Some(count);
        self
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn document(&self, doc_id: &str) -> Result<Option<IndexedDocument>> {
        Ok(lock(&self.documents)?.get(doc_id).cloned())
    }

    /// Every successful write in the order it was applied.
    #[allow(clippy::missing_errors_doc)]
    pub fn applied_updates(&self) -> Result<Vec<(String, i64)>> {
        Ok(lock(&self.updates)?.clone())
    }
}

impl KeyPager for InMemoryQuestionIndex {
    fn next_page(&self, after: Option<BookId>, page_size: usize) -> Result<KeyPage> {
        let documents = lock(&self.documents)?;
        let distinct: BTreeSet<BookId> = documents
            .values()
            .filter_map(|document| document.book_id)
            .collect();
        let keys: Vec<BookId> = distinct
            .into_iter()
            .filter(|key| after.map_or(true, |after| *key > after))
            .take(page_size)
            .collect();
        let after_key = keys.last().copied();
        Ok(KeyPage { keys, after_key })
    }
}

impl DocumentScanner for InMemoryQuestionIndex {
    fn scan(&self, filter: &ScanFilter) -> Result<DocumentStream<'_>> {
        let snapshot: Vec<IndexedDocument> = lock(&self.documents)?
            .values()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect();
        let failure_at = self.scan_failure_after;
        let stream = snapshot
            .into_iter()
            .map(Ok)
            .enumerate()
            .map(move |(position, item)| {
                if failure_at.is_some_and(|limit| position >= limit) {
                    Err(anyhow!("scroll session expired"))
                } else {
                    item
                }
            });
        Ok(Box::new(stream))
    }
}

impl AttributeWriter for InMemoryQuestionIndex {
    fn apply(&self, doc_id: &str, attribute_id: i64) -> Result<()> {
        if self.failing_updates.contains(doc_id) {
            return Err(anyhow!("version conflict updating {doc_id}"));
        }
        let mut documents = lock(&self.documents)?;
        let document = documents
            .get_mut(doc_id)
            .ok_or_else(|| anyhow!("document not found: {doc_id}"))?;
        document.attribute = Some(attribute_id);
        lock(&self.updates)?.push((doc_id.to_string(), attribute_id));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalogSource {
    records: Vec<CatalogRecord>,
}

impl StaticCatalogSource {
    #[must_use]
    pub fn new(records: Vec<CatalogRecord>) -> Self {
        Self { records }
    }
}

impl CatalogSource for StaticCatalogSource {
    fn load_candidates(&self, predicate: &EligibilityPredicate) -> Result<Vec<CatalogRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|record| predicate.admits(record))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticHistorySource {
    assignments: BTreeMap<QuestionKey, i64>,
    failing: BTreeSet<QuestionKey>,
}

impl StaticHistorySource {
    #[must_use]
    pub fn with_assignment(mut self, key: QuestionKey, attribute_id: i64) -> Self {
        self.assignments.insert(key, attribute_id);
        self
    }

    #[must_use]
    pub fn with_failure(mut self, key: QuestionKey) -> Self {
        self.failing.insert(key);
        self
    }
}

impl HistorySource for StaticHistorySource {
    fn historical_attribute(&self, key: QuestionKey) -> Result<Option<i64>> {
        if self.failing.contains(&key) {
            return Err(anyhow!("history table unavailable"));
        }
        Ok(self.assignments.get(&key).copied().filter(|value| *value != 0))
    }
}

#[derive(Debug)]
enum Script {
    Returns(i64),
    Fails(String),
}

/// Classifier double that answers every call the same way and counts calls.
#[derive(Debug)]
pub struct ScriptedClassifier {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    #[must_use]
    pub fn returning(attribute_id: i64) -> Self {
        Self {
            script: Script::Returns(attribute_id),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            script: Script::Fails(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for ScriptedClassifier {
    fn predict(&self, _course_id: i64, _question_text: &str) -> Result<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Returns(value) => Ok(*value),
            Script::Fails(message) => Err(anyhow!("{message}")),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("in-memory adapter lock poisoned"))
}
