use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use qbank_sync_cli::logging::{init_subscriber, Verbosity};
use qbank_sync_cli::{ConnectionArgs, HealthReport, LiveBackends, RunBackends};
use qbank_sync_core::{BookId, CancellationFlag, ScanFilter, SyncError};
use qbank_sync_orchestrator::{GapReport, ReconciliationResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

const SERVICE_NAME: &str = "qbank-sync-service";

#[derive(Clone)]
struct ServiceState {
    backends: Arc<dyn RunBackends>,
    run_timeout: Duration,
    shutdown: CancellationFlag,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UpdateParams {
    ders_id: Option<i64>,
    kitap_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct UpdateResponse {
    success: bool,
    message: String,
    processed_count: usize,
    updated_count: usize,
    ders_id: Option<i64>,
    kitap_id: Option<i64>,
    summary: ReconciliationResult,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    report: HealthReport,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    runs_total: AtomicU64,
    runs_success_total: AtomicU64,
    runs_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    fatal_config_total: AtomicU64,
    cancelled_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    runs_total: u64,
    runs_success_total: u64,
    runs_failure_total: u64,
    timeout_total: u64,
    fatal_config_total: u64,
    cancelled_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "qbank-sync-service")]
#[command(about = "HTTP triggers for question bank gap detection and attribute backfill")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(long, env = "QBANK_SYNC_BIND", default_value = "0.0.0.0:7002")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 3600)]
    run_timeout_secs: u64,
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long)]
    quiet: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(backends: Arc<dyn RunBackends>, run_timeout: Duration) -> Self {
        Self {
            backends,
            run_timeout,
            shutdown: CancellationFlag::new(),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_query(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_query", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_query",
            rejection.body_text(),
            None,
        )
    }

    fn classify_sync_error(err: &SyncError) -> ServiceFailure {
        let status = match err {
            SyncError::FatalConfig(_) | SyncError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::TransientIo(_)
            | SyncError::DataIntegrity(_)
            | SyncError::ExternalService(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::failure(status, err.code(), err.to_string(), None)
    }

    /// Runs a blocking flow off the async workers. The run gets its own
    /// cancellation flag, raised on timeout or service shutdown.
    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn RunBackends>, CancellationFlag) -> Result<T, SyncError> + Send + 'static,
    {
        self.telemetry.runs_total.fetch_add(1, Ordering::Relaxed);
        let backends = Arc::clone(&self.backends);
        let cancel = self.shutdown.child();
        let run_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || op(backends, run_cancel));

        let join_result = tokio::time::timeout(self.run_timeout, handle)
            .await
            .map_err(|_| {
                cancel.cancel();
                self.telemetry.record_failure("timeout", true);
                tracing::warn!(
                    target: "qbank_sync::service",
                    operation = operation_label,
                    timeout_ms = self.run_timeout.as_millis(),
                    "run timed out; requested cancellation"
                );
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.run_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.run_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .runs_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_sync_error(&err);
                self.telemetry.record_failure(failure.code, false);
                tracing::error!(
                    target: "qbank_sync::service",
                    operation = operation_label,
                    code = failure.code,
                    error = %err,
                    "run failed"
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.runs_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "fatal_config" => {
                self.fatal_config_total.fetch_add(1, Ordering::Relaxed);
            }
            "cancelled" => {
                self.cancelled_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "timeout" => {}
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            runs_total: self.runs_total.load(Ordering::Relaxed),
            runs_success_total: self.runs_success_total.load(Ordering::Relaxed),
            runs_failure_total: self.runs_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            fatal_config_total: self.fatal_config_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/update-kazanim", post(update_attributes))
        .route("/eksik-kitaplar", get(missing_books))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_subscriber(
        Verbosity::from_flags(args.verbose, args.quiet),
        tracing::Level::INFO,
    );

    let state = ServiceState::new(
        Arc::new(LiveBackends::new(args.connection)),
        Duration::from_secs(args.run_timeout_secs),
    );
    let shutdown = state.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(target: "qbank_sync::service", bind = %args.bind, "service listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    tracing::info!(target: "qbank_sync::service", "service stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationFlag) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(target: "qbank_sync::service", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "qbank_sync::service", "shutdown requested; cancelling in-flight runs");
    shutdown.cancel();
}

async fn banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "message": "Question bank sync service is running",
        "endpoints": ["GET /health", "POST /update-kazanim", "GET /eksik-kitaplar"],
    }))
}

async fn health(State(state): State<ServiceState>) -> Result<Response, ServiceFailure> {
    let report = state
        .run_blocking("health", |backends, _cancel| Ok(backends.health()))
        .await?;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        report,
        telemetry: state.telemetry.snapshot(),
    };
    Ok((status, Json(body)).into_response())
}

async fn update_attributes(
    State(state): State<ServiceState>,
    params: Result<Query<UpdateParams>, QueryRejection>,
) -> Result<Json<UpdateResponse>, ServiceFailure> {
    let Query(params) = params.map_err(|rejection| state.invalid_query(&rejection))?;
    let filter = ScanFilter {
        course_id: params.ders_id,
        book_id: params.kitap_id.map(BookId),
    };

    let summary = state
        .run_blocking("backfill", move |backends, cancel| {
            backends.backfill(&filter, &cancel)
        })
        .await?;

    let (success, message) = if summary.cancelled {
        (false, "Attribute backfill cancelled before completion".to_string())
    } else if let Some(reason) = &summary.interrupted {
        (false, format!("Attribute backfill interrupted: {reason}"))
    } else {
        (true, "Attribute backfill completed".to_string())
    };

    Ok(Json(UpdateResponse {
        success,
        message,
        processed_count: summary.processed_count,
        updated_count: summary.updated_count,
        ders_id: params.ders_id,
        kitap_id: params.kitap_id,
        summary,
    }))
}

async fn missing_books(
    State(state): State<ServiceState>,
) -> Result<Json<GapReport>, ServiceFailure> {
    let report = state
        .run_blocking("gap", |backends, cancel| backends.gap(&cancel))
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use qbank_sync_cli::InMemoryBackends;
    use qbank_sync_core::memory::{
        InMemoryQuestionIndex, ScriptedClassifier, StaticCatalogSource, StaticHistorySource,
    };
    use qbank_sync_core::{CatalogRecord, EligibilityFlags, IndexedDocument, PackagingInfo};
    use tower::ServiceExt;

    fn fixture_document(doc_id: &str, book_id: i64, course_id: i64) -> IndexedDocument {
        IndexedDocument {
            doc_id: doc_id.to_string(),
            book_id: Some(BookId(book_id)),
            test_id: Some(1),
            question_no: Some(1),
            course_id: Some(course_id),
            question_text: Some("What is X?".to_string()),
            attribute: None,
        }
    }

    fn fixture_record(book_id: i64) -> CatalogRecord {
        CatalogRecord {
            book_id: BookId(book_id),
            book_name: format!("book-{book_id}"),
            course_id: Some(7),
            institution_id: 1,
            institution_name: "inst".to_string(),
            institution_domain: Some("inst.example".to_string()),
            creates_trial_exams: true,
            packaging: PackagingInfo {
                packaged_book_version: Some("1".to_string()),
                ..PackagingInfo::default()
            },
            eligibility: EligibilityFlags {
                institution_active: true,
                question_count: 3,
                ..EligibilityFlags::default()
            },
        }
    }

    fn fixture_state(timeout: Duration) -> ServiceState {
        let backends = InMemoryBackends::new(
            InMemoryQuestionIndex::new(vec![
                fixture_document("q1", 10, 7),
                fixture_document("q2", 11, 8),
            ]),
            StaticCatalogSource::new(vec![fixture_record(10), fixture_record(12)]),
            StaticHistorySource::default(),
            ScriptedClassifier::returning(77),
        );
        ServiceState::new(Arc::new(backends), timeout)
    }

    struct UnreachableBackends;

    impl RunBackends for UnreachableBackends {
        fn gap(&self, _cancel: &CancellationFlag) -> Result<GapReport, SyncError> {
            Err(SyncError::FatalConfig(
                "catalog store unavailable: connection refused".to_string(),
            ))
        }

        fn backfill(
            &self,
            _filter: &ScanFilter,
            _cancel: &CancellationFlag,
        ) -> Result<ReconciliationResult, SyncError> {
            Err(SyncError::FatalConfig(
                "failed to open index scan: connection refused".to_string(),
            ))
        }

        fn health(&self) -> HealthReport {
            HealthReport::from_probes(
                Err(anyhow::anyhow!("connection refused")),
                Ok(()),
            )
        }
    }

    async fn send(router: Router, method: &str, uri: &str) -> Response {
        let request = Request::builder()
            .uri(uri)
            .method(method)
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    #[tokio::test]
    async fn banner_names_service_and_version() {
        let response = send(app(fixture_state(Duration::from_secs(5))), "GET", "/").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service").and_then(serde_json::Value::as_str),
            Some(SERVICE_NAME)
        );
        assert!(value.get("version").is_some_and(serde_json::Value::is_string));
    }

    #[tokio::test]
    async fn health_reports_connected_dependencies() {
        let response = send(app(fixture_state(Duration::from_secs(5))), "GET", "/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status"), Some(&json!("healthy")));
        assert_eq!(value.get("elasticsearch"), Some(&json!("connected")));
        assert_eq!(value.get("database"), Some(&json!("connected")));
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn health_is_unavailable_when_index_is_down() {
        let state = ServiceState::new(Arc::new(UnreachableBackends), Duration::from_secs(5));
        let response = send(app(state), "GET", "/health").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let value = response_json(response).await;
        assert_eq!(value.get("status"), Some(&json!("unhealthy")));
        assert_eq!(value.get("elasticsearch"), Some(&json!("disconnected")));
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|error| error.contains("connection refused")));
    }

    #[tokio::test]
    async fn update_trigger_backfills_filtered_documents() {
        let response = send(
            app(fixture_state(Duration::from_secs(5))),
            "POST",
            "/update-kazanim?ders_id=7",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("success"), Some(&json!(true)));
        assert_eq!(value.get("processed_count"), Some(&json!(1)));
        assert_eq!(value.get("updated_count"), Some(&json!(1)));
        assert_eq!(value.get("ders_id"), Some(&json!(7)));
        assert_eq!(value.get("kitap_id"), Some(&json!(null)));
        assert_eq!(value.pointer("/summary/predicted"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn update_trigger_rejects_non_numeric_filters() {
        let response = send(
            app(fixture_state(Duration::from_secs(5))),
            "POST",
            "/update-kazanim?ders_id=seven",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value.pointer("/error/code"), Some(&json!("invalid_query")));
    }

    #[tokio::test]
    async fn update_trigger_maps_fatal_errors_to_unavailable() {
        let state = ServiceState::new(Arc::new(UnreachableBackends), Duration::from_secs(5));
        let response = send(app(state), "POST", "/update-kazanim").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let value = response_json(response).await;
        assert_eq!(value.pointer("/error/code"), Some(&json!("fatal_config")));
    }

    #[tokio::test]
    async fn shutdown_cancels_backfill_between_documents() {
        let state = fixture_state(Duration::from_secs(5));
        state.shutdown.cancel();

        let response = send(app(state), "POST", "/update-kazanim").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("success"), Some(&json!(false)));
        assert_eq!(value.pointer("/summary/cancelled"), Some(&json!(true)));
        assert_eq!(value.get("processed_count"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn missing_books_lists_gap_report() {
        let response = send(
            app(fixture_state(Duration::from_secs(5))),
            "GET",
            "/eksik-kitaplar",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("missing_count"), Some(&json!(1)));
        assert_eq!(value.pointer("/missing/0/book_id"), Some(&json!(12)));
        assert_eq!(
            value.pointer("/missing/0/institution_domain"),
            Some(&json!("inst.example"))
        );
    }

    #[tokio::test]
    async fn missing_books_maps_fatal_errors_to_unavailable() {
        let state = ServiceState::new(Arc::new(UnreachableBackends), Duration::from_secs(5));
        let response = send(app(state), "GET", "/eksik-kitaplar").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn run_blocking_times_out_and_cancels_the_run() {
        let state = fixture_state(Duration::from_millis(1));
        let observed = CancellationFlag::new();
        let witness = observed.clone();

        let result = state
            .run_blocking("slow_run", move |_backends, cancel| {
                std::thread::sleep(Duration::from_millis(50));
                if cancel.is_cancelled() {
                    witness.cancel();
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking run"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(err.code, "timeout");
                assert!(err.details.is_some());
            }
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observed.is_cancelled());
        assert!(!state.shutdown.is_cancelled());

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.runs_total, 1);
        assert_eq!(snapshot.runs_failure_total, 1);
        assert_eq!(snapshot.timeout_total, 1);
    }
}
