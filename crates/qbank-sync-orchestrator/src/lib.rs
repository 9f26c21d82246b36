#![forbid(unsafe_code)]

use qbank_sync_core::{
    collect_unique_keys, find_missing, format_rfc3339, now_utc, AttributeResolver,
    AttributeWriter, CancellationFlag, CatalogRecord, CatalogSource, Classifier,
    DocumentScanner, EligibilityPredicate, HistorySource, IndexedDocument, KeyPager, Resolution,
    ScanFilter, SyncError, DEFAULT_KEY_PAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const DEFAULT_MAX_REPORTED_FAILURES: usize = 100;

#[derive(Debug, Clone)]
pub struct GapConfig {
    pub key_page_size: usize,
    pub predicate: EligibilityPredicate,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            key_page_size: DEFAULT_KEY_PAGE_SIZE,
            predicate: EligibilityPredicate::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GapReport {
    pub run_id: Ulid,
    pub generated_at: String,
    pub index_key_count: usize,
    pub index_pages: usize,
    pub candidate_count: usize,
    pub missing_count: usize,
    pub missing: Vec<CatalogRecord>,
}

/// Finds eligible catalog books that have no documents in the index.
pub struct GapOrchestrator<'a> {
    pager: &'a dyn KeyPager,
    catalog: &'a dyn CatalogSource,
    config: GapConfig,
}

impl<'a> GapOrchestrator<'a> {
    #[must_use]
    pub fn new(pager: &'a dyn KeyPager, catalog: &'a dyn CatalogSource, config: GapConfig) -> Self {
        Self {
            pager,
            catalog,
            config,
        }
    }

    /// Enumerate index keys, load candidates, diff.
    ///
    /// # Errors
    /// All-or-nothing: any enumeration or candidate-load failure aborts the
    /// run with [`SyncError::FatalConfig`]; a raised `cancel` flag aborts
    /// with [`SyncError::Cancelled`].
    pub fn run(&self, cancel: &CancellationFlag) -> Result<GapReport, SyncError> {
        let run_id = Ulid::new();
        tracing::info!(
            target: "qbank_sync::gap",
            %run_id,
            page_size = self.config.key_page_size,
            "gap run started"
        );

        let enumeration = collect_unique_keys(self.pager, self.config.key_page_size, cancel)
            .inspect_err(|err| log_run_failure(run_id, "gap", err))?;

        if cancel.is_cancelled() {
            let err = SyncError::Cancelled("gap run stopped before candidate load".to_string());
            log_run_failure(run_id, "gap", &err);
            return Err(err);
        }

        let candidates = self
            .catalog
            .load_candidates(&self.config.predicate)
            .map_err(|err| SyncError::fatal("catalog candidate load failed", &err))
            .inspect_err(|err| log_run_failure(run_id, "gap", err))?;

        let missing = find_missing(&candidates, &enumeration.keys);
        let report = GapReport {
            run_id,
            generated_at: format_rfc3339(now_utc()),
            index_key_count: enumeration.keys.len(),
            index_pages: enumeration.pages,
            candidate_count: candidates.len(),
            missing_count: missing.len(),
            missing,
        };

        tracing::info!(
            target: "qbank_sync::gap",
            %run_id,
            index_keys = report.index_key_count,
            candidates = report.candidate_count,
            missing = report.missing_count,
            "gap run finished"
        );
        Ok(report)
    }
}

/// Per-document lifecycle. The last five variants are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Fetched,
    ResolvingHistorical,
    ResolvingPrediction,
    Updating,
    Done,
    SkippedIncomplete,
    SkippedUnresolved,
    FailedLookup,
    FailedUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedItem {
    pub doc_id: String,
    pub state: DocumentState,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub run_id: Ulid,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub filter: ScanFilter,
    pub processed_count: usize,
    pub updated_count: usize,
    pub skipped_incomplete: usize,
    pub skipped_unresolved: usize,
    pub historical_hits: usize,
    pub predicted: usize,
    pub prediction_failures: usize,
    pub failed_count: usize,
    pub failed_items: Vec<FailedItem>,
    pub cancelled: bool,
    pub interrupted: Option<String>,
}

impl ReconciliationResult {
    fn new(run_id: Ulid, filter: ScanFilter) -> Self {
        Self {
            run_id,
            started_at: format_rfc3339(now_utc()),
            finished_at: None,
            filter,
            processed_count: 0,
            updated_count: 0,
            skipped_incomplete: 0,
            skipped_unresolved: 0,
            historical_hits: 0,
            predicted: 0,
            prediction_failures: 0,
            failed_count: 0,
            failed_items: Vec::new(),
            cancelled: false,
            interrupted: None,
        }
    }

    fn record_failure(
        &mut self,
        document: &IndexedDocument,
        state: DocumentState,
        err: &SyncError,
        max_reported: usize,
    ) {
        self.failed_count += 1;
        if self.failed_items.len() < max_reported {
            self.failed_items.push(FailedItem {
                doc_id: document.doc_id.clone(),
                state,
                kind: err.code().to_string(),
                message: err.to_string(),
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub max_reported_failures: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_reported_failures: DEFAULT_MAX_REPORTED_FAILURES,
        }
    }
}

/// Best-effort attribute backfill over every document the scan yields.
pub struct BackfillOrchestrator<'a> {
    scanner: &'a dyn DocumentScanner,
    history: &'a dyn HistorySource,
    classifier: &'a dyn Classifier,
    writer: &'a dyn AttributeWriter,
    config: BackfillConfig,
}

impl<'a> BackfillOrchestrator<'a> {
    #[must_use]
    pub fn new(
        scanner: &'a dyn DocumentScanner,
        history: &'a dyn HistorySource,
        classifier: &'a dyn Classifier,
        writer: &'a dyn AttributeWriter,
        config: BackfillConfig,
    ) -> Self {
        Self {
            scanner,
            history,
            classifier,
            writer,
            config,
        }
    }

    /// Runs one backfill pass. Per-document failures are recorded in the
    /// result and never abort the run.
    ///
    /// # Errors
    /// Returns [`SyncError::FatalConfig`] only when the scan cannot be opened
    /// or fails before yielding its first document.
    pub fn run(
        &self,
        filter: &ScanFilter,
        cancel: &CancellationFlag,
    ) -> Result<ReconciliationResult, SyncError> {
        let run_id = Ulid::new();
        tracing::info!(
            target: "qbank_sync::backfill",
            %run_id,
            course_id = ?filter.course_id,
            book_id = ?filter.book_id,
            "backfill run started"
        );

        let stream = self
            .scanner
            .scan(filter)
            .map_err(|err| SyncError::fatal("failed to open index scan", &err))
            .inspect_err(|err| log_run_failure(run_id, "backfill", err))?;

        let resolver = AttributeResolver::new(self.history, self.classifier);
        let mut summary = ReconciliationResult::new(run_id, *filter);

        for item in stream {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                tracing::warn!(
                    target: "qbank_sync::backfill",
                    %run_id,
                    processed = summary.processed_count,
                    "backfill run cancelled"
                );
                break;
            }

            let document = match item {
                Ok(document) => document,
                Err(err) if summary.processed_count == 0 => {
                    let failure = SyncError::fatal("index scan failed before the first document", &err);
                    log_run_failure(run_id, "backfill", &failure);
                    return Err(failure);
                }
                Err(err) => {
                    let failure = SyncError::transient("index scan interrupted", &err);
                    tracing::warn!(
                        target: "qbank_sync::backfill",
                        %run_id,
                        processed = summary.processed_count,
                        error = %failure,
                        "backfill run ended early; rerun to continue"
                    );
                    summary.interrupted = Some(failure.to_string());
                    break;
                }
            };

            let state = self.process_document(&resolver, &document, &mut summary);
            tracing::trace!(
                target: "qbank_sync::backfill",
                doc_id = %document.doc_id,
                state = ?state,
                "document finished"
            );
        }

        summary.finished_at = Some(format_rfc3339(now_utc()));
        tracing::info!(
            target: "qbank_sync::backfill",
            %run_id,
            processed = summary.processed_count,
            updated = summary.updated_count,
            failed = summary.failed_count,
            prediction_failures = summary.prediction_failures,
            "backfill run finished"
        );
        Ok(summary)
    }

    fn process_document(
        &self,
        resolver: &AttributeResolver<'_>,
        document: &IndexedDocument,
        summary: &mut ReconciliationResult,
    ) -> DocumentState {
        summary.processed_count += 1;

        if document.question_key().is_none() {
            let issue = SyncError::DataIntegrity(format!(
                "document {} is missing book, test or question number",
                document.doc_id
            ));
            tracing::warn!(target: "qbank_sync::backfill", doc_id = %document.doc_id, error = %issue, "skipping incomplete document");
            summary.skipped_incomplete += 1;
            return DocumentState::SkippedIncomplete;
        }

        trace_state(document, DocumentState::ResolvingHistorical);
        let resolution = match resolver.resolve_historical(document) {
            Ok(Some(resolution)) => resolution,
            Ok(None) => {
                trace_state(document, DocumentState::ResolvingPrediction);
                resolver.resolve_predicted(document)
            }
            Err(err) => {
                tracing::warn!(target: "qbank_sync::backfill", doc_id = %document.doc_id, error = %err, "history lookup failed");
                summary.record_failure(
                    document,
                    DocumentState::FailedLookup,
                    &err,
                    self.config.max_reported_failures,
                );
                return DocumentState::FailedLookup;
            }
        };

        match &resolution {
            Resolution::Historical { .. } => summary.historical_hits += 1,
            Resolution::Predicted { .. } => summary.predicted += 1,
            Resolution::PredictionFailed { .. } => summary.prediction_failures += 1,
            Resolution::Unresolved { .. } => {}
        }

        let Some(attribute_id) = resolution.write_value() else {
            tracing::warn!(
                target: "qbank_sync::backfill",
                doc_id = %document.doc_id,
                resolution = ?resolution,
                "no attribute could be resolved; leaving document untouched"
            );
            summary.skipped_unresolved += 1;
            return DocumentState::SkippedUnresolved;
        };

        trace_state(document, DocumentState::Updating);
        match self.writer.apply(&document.doc_id, attribute_id) {
            Ok(()) => {
                summary.updated_count += 1;
                tracing::debug!(
                    target: "qbank_sync::backfill",
                    doc_id = %document.doc_id,
                    attribute_id,
                    "document updated"
                );
                DocumentState::Done
            }
            Err(err) => {
                let failure = SyncError::transient("index update failed", &err);
                tracing::warn!(target: "qbank_sync::backfill", doc_id = %document.doc_id, error = %failure, "index update failed");
                summary.record_failure(
                    document,
                    DocumentState::FailedUpdate,
                    &failure,
                    self.config.max_reported_failures,
                );
                DocumentState::FailedUpdate
            }
        }
    }
}

fn trace_state(document: &IndexedDocument, state: DocumentState) {
    tracing::trace!(target: "qbank_sync::backfill", doc_id = %document.doc_id, state = ?state, "document state");
}

fn log_run_failure(run_id: Ulid, flow: &str, err: &SyncError) {
    tracing::error!(
        target: "qbank_sync::orchestrator",
        %run_id,
        flow,
        code = err.code(),
        error = %err,
        "run aborted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbank_sync_core::memory::{
        InMemoryQuestionIndex, ScriptedClassifier, StaticCatalogSource, StaticHistorySource,
    };
    use qbank_sync_core::{BookId, EligibilityFlags, PackagingInfo, QuestionKey};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_document(doc_id: &str, book_id: i64, test_id: i64, question_no: i64) -> IndexedDocument {
        IndexedDocument {
            doc_id: doc_id.to_string(),
            book_id: Some(BookId(book_id)),
            test_id: Some(test_id),
            question_no: Some(question_no),
            course_id: Some(7),
            question_text: Some("What is X?".to_string()),
            attribute: None,
        }
    }

    fn fixture_record(book_id: i64) -> CatalogRecord {
        CatalogRecord {
            book_id: BookId(book_id),
            book_name: format!("book-{book_id}"),
            course_id: None,
            institution_id: 3,
            institution_name: "inst".to_string(),
            institution_domain: None,
            creates_trial_exams: true,
            packaging: PackagingInfo {
                packaged_book_version: Some("2".to_string()),
                ..PackagingInfo::default()
            },
            eligibility: EligibilityFlags {
                institution_active: true,
                question_count: 4,
                ..EligibilityFlags::default()
            },
        }
    }

    fn stored_attribute(index: &InMemoryQuestionIndex, doc_id: &str) -> Option<i64> {
        must(index.document(doc_id)).and_then(|document| document.attribute)
    }

    fn run_backfill(
        index: &InMemoryQuestionIndex,
        history: &StaticHistorySource,
        classifier: &ScriptedClassifier,
    ) -> ReconciliationResult {
        let orchestrator =
            BackfillOrchestrator::new(index, history, classifier, index, BackfillConfig::default());
        must(orchestrator.run(&ScanFilter::default(), &CancellationFlag::new()))
    }

    #[test]
    fn gap_run_reports_book_missing_from_index() {
        let index = InMemoryQuestionIndex::new(vec![
            fixture_document("a", 1, 1, 1),
            fixture_document("b", 2, 1, 1),
            fixture_document("c", 3, 1, 1),
        ]);
        let catalog = StaticCatalogSource::new((1..=4).map(fixture_record).collect());
        let orchestrator = GapOrchestrator::new(
            &index,
            &catalog,
            GapConfig {
                key_page_size: 2,
                ..GapConfig::default()
            },
        );

        let report = must(orchestrator.run(&CancellationFlag::new()));

        assert_eq!(report.index_key_count, 3);
        assert_eq!(report.candidate_count, 4);
        assert_eq!(report.missing_count, 1);
        assert_eq!(report.missing, vec![fixture_record(4)]);
    }

    struct FailingCatalog;

    impl CatalogSource for FailingCatalog {
        fn load_candidates(
            &self,
            _predicate: &EligibilityPredicate,
        ) -> anyhow::Result<Vec<CatalogRecord>> {
            Err(anyhow::anyhow!("login failed for catalog user"))
        }
    }

    #[test]
    fn gap_run_fails_whole_when_catalog_is_unreachable() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("a", 1, 1, 1)]);
        let orchestrator = GapOrchestrator::new(&index, &FailingCatalog, GapConfig::default());

        let result = orchestrator.run(&CancellationFlag::new());

        assert!(matches!(result, Err(SyncError::FatalConfig(message)) if message.contains("login failed")));
    }

    #[test]
    fn gap_run_honours_cancellation() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("a", 1, 1, 1)]);
        let catalog = StaticCatalogSource::new(vec![fixture_record(1)]);
        let orchestrator = GapOrchestrator::new(&index, &catalog, GapConfig::default());
        let cancel = CancellationFlag::new();
        cancel.cancel();

        assert!(matches!(orchestrator.run(&cancel), Err(SyncError::Cancelled(_))));
    }

    #[test]
    fn history_hit_updates_without_classifier() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 2)]);
        let history = StaticHistorySource::default().with_assignment(
            QuestionKey {
                book_id: BookId(10),
                test_id: 5,
                question_no: 2,
            },
            55,
        );
        let classifier = ScriptedClassifier::returning(99);

        let summary = run_backfill(&index, &history, &classifier);

        assert_eq!(stored_attribute(&index, "q1"), Some(55));
        assert_eq!(classifier.calls(), 0);
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.updated_count, 1);
        assert_eq!(summary.historical_hits, 1);
    }

    #[test]
    fn classifier_hit_updates_document() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 2)]);
        let classifier = ScriptedClassifier::returning(77);

        let summary = run_backfill(&index, &StaticHistorySource::default(), &classifier);

        assert_eq!(stored_attribute(&index, "q1"), Some(77));
        assert_eq!(summary.predicted, 1);
        assert_eq!(summary.updated_count, 1);
    }

    #[test]
    fn classifier_timeout_writes_sentinel_and_counts_update() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 2)]);
        let classifier = ScriptedClassifier::failing("timed out reading response");

        let summary = run_backfill(&index, &StaticHistorySource::default(), &classifier);

        assert_eq!(stored_attribute(&index, "q1"), Some(0));
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.updated_count, 1);
        assert_eq!(summary.prediction_failures, 1);
        assert_eq!(summary.predicted, 0);
        assert!(summary.failed_items.is_empty());
    }

    #[test]
    fn unresolvable_document_is_left_untouched() {
        let mut document = fixture_document("q1", 10, 5, 2);
        document.course_id = None;
        let index = InMemoryQuestionIndex::new(vec![document]);
        let classifier = ScriptedClassifier::returning(77);

        let summary = run_backfill(&index, &StaticHistorySource::default(), &classifier);

        assert_eq!(stored_attribute(&index, "q1"), None);
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.updated_count, 0);
        assert_eq!(summary.skipped_unresolved, 1);
        assert!(must(index.applied_updates()).is_empty());
    }

    #[test]
    fn incomplete_document_is_skipped_not_failed() {
        let mut document = fixture_document("q1", 10, 5, 2);
        document.question_no = None;
        let index = InMemoryQuestionIndex::new(vec![document]);
        let classifier = ScriptedClassifier::returning(77);

        let summary = run_backfill(&index, &StaticHistorySource::default(), &classifier);

        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.skipped_incomplete, 1);
        assert_eq!(summary.failed_count, 0);
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn per_document_failures_do_not_abort_run() {
        let index = InMemoryQuestionIndex::new(vec![
            fixture_document("q1", 10, 5, 1),
            fixture_document("q2", 10, 5, 2),
            fixture_document("q3", 10, 5, 3),
        ])
        .with_failing_update("q2");
        let history = StaticHistorySource::default().with_failure(QuestionKey {
            book_id: BookId(10),
            test_id: 5,
            question_no: 3,
        });
        let classifier = ScriptedClassifier::returning(12);

        let summary = run_backfill(&index, &history, &classifier);

        assert_eq!(summary.processed_count, 3);
        assert_eq!(summary.updated_count, 1);
        assert_eq!(summary.failed_count, 2);
        let states: Vec<(String, DocumentState)> = summary
            .failed_items
            .iter()
            .map(|item| (item.doc_id.clone(), item.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("q2".to_string(), DocumentState::FailedUpdate),
                ("q3".to_string(), DocumentState::FailedLookup),
            ]
        );
        assert_eq!(summary.failed_items[1].kind, "transient_io");
        assert_eq!(classifier.calls(), 2);
    }

    #[test]
    fn failed_items_are_capped_but_counted() {
        let documents: Vec<IndexedDocument> = (1..=5)
            .map(|slot| fixture_document(&format!("q{slot}"), 10, 5, slot))
            .collect();
        let mut index = InMemoryQuestionIndex::new(documents);
        for slot in 1..=5 {
            index = index.with_failing_update(&format!("q{slot}"));
        }
        let history = StaticHistorySource::default();
        let classifier = ScriptedClassifier::returning(3);
        let orchestrator = BackfillOrchestrator::new(
            &index,
            &history,
            &classifier,
            &index,
            BackfillConfig {
                max_reported_failures: 2,
            },
        );

        let summary = must(orchestrator.run(&ScanFilter::default(), &CancellationFlag::new()));

        assert_eq!(summary.failed_count, 5);
        assert_eq!(summary.failed_items.len(), 2);
    }

    #[test]
    fn rerun_is_safe_after_successful_backfill() {
        let index = InMemoryQuestionIndex::new(vec![
            fixture_document("q1", 10, 5, 1),
            fixture_document("q2", 10, 5, 2),
        ]);
        let classifier = ScriptedClassifier::returning(21);
        let history = StaticHistorySource::default();

        let first = run_backfill(&index, &history, &classifier);
        let after_first = (stored_attribute(&index, "q1"), stored_attribute(&index, "q2"));
        let second = run_backfill(&index, &history, &classifier);
        let after_second = (stored_attribute(&index, "q1"), stored_attribute(&index, "q2"));

        assert_eq!(first.updated_count, 2);
        assert_eq!(second.processed_count, 0);
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn applying_same_value_twice_is_idempotent() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 1)]);

        must(index.apply("q1", 42));
        let once = must(index.document("q1"));
        must(index.apply("q1", 42));
        let twice = must(index.document("q1"));

        assert_eq!(once, twice);
    }

    #[test]
    fn cancelled_backfill_returns_partial_summary() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 1)]);
        let history = StaticHistorySource::default();
        let classifier = ScriptedClassifier::returning(4);
        let orchestrator =
            BackfillOrchestrator::new(&index, &history, &classifier, &index, BackfillConfig::default());
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let summary = must(orchestrator.run(&ScanFilter::default(), &cancel));

        assert!(summary.cancelled);
        assert_eq!(summary.processed_count, 0);
        assert_eq!(stored_attribute(&index, "q1"), None);
    }

    #[test]
    fn scan_interruption_keeps_progress() {
        let index = InMemoryQuestionIndex::new(vec![
            fixture_document("q1", 10, 5, 1),
            fixture_document("q2", 10, 5, 2),
            fixture_document("q3", 10, 5, 3),
        ])
        .with_scan_failure_after(2);
        let history = StaticHistorySource::default();
        let classifier = ScriptedClassifier::returning(8);

        let summary = run_backfill(&index, &history, &classifier);

        assert_eq!(summary.processed_count, 2);
        assert_eq!(summary.updated_count, 2);
        assert!(summary
            .interrupted
            .as_deref()
            .is_some_and(|message| message.contains("scroll session expired")));
    }

    #[test]
    fn scan_failure_before_first_document_is_fatal() {
        let index =
            InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 1)]).with_scan_failure_after(0);
        let history = StaticHistorySource::default();
        let classifier = ScriptedClassifier::returning(8);
        let orchestrator =
            BackfillOrchestrator::new(&index, &history, &classifier, &index, BackfillConfig::default());

        let result = orchestrator.run(&ScanFilter::default(), &CancellationFlag::new());

        assert!(matches!(result, Err(SyncError::FatalConfig(_))));
    }

    #[test]
    fn scan_filter_narrows_by_course_and_book() {
        let mut other_course = fixture_document("q2", 10, 5, 2);
        other_course.course_id = Some(8);
        let index = InMemoryQuestionIndex::new(vec![
            fixture_document("q1", 10, 5, 1),
            other_course,
            fixture_document("q3", 11, 5, 1),
        ]);
        let history = StaticHistorySource::default();
        let classifier = ScriptedClassifier::returning(6);
        let orchestrator =
            BackfillOrchestrator::new(&index, &history, &classifier, &index, BackfillConfig::default());
        let filter = ScanFilter {
            course_id: Some(7),
            book_id: Some(BookId(10)),
        };

        let summary = must(orchestrator.run(&filter, &CancellationFlag::new()));

        assert_eq!(summary.processed_count, 1);
        assert_eq!(stored_attribute(&index, "q1"), Some(6));
        assert_eq!(stored_attribute(&index, "q2"), None);
        assert_eq!(stored_attribute(&index, "q3"), None);
    }

    #[test]
    fn summary_serializes_counts_for_trigger_api() {
        let index = InMemoryQuestionIndex::new(vec![fixture_document("q1", 10, 5, 1)]);
        let summary = run_backfill(
            &index,
            &StaticHistorySource::default(),
            &ScriptedClassifier::returning(9),
        );

        let value = must(serde_json::to_value(&summary));

        assert_eq!(value.get("processed_count").and_then(serde_json::Value::as_u64), Some(1));
        assert_eq!(value.get("updated_count").and_then(serde_json::Value::as_u64), Some(1));
        assert!(value.get("finished_at").is_some_and(serde_json::Value::is_string));
    }
}
