//! Command surface for the question-bank sync flows.
//!
//! - [`run_cli`] executes a parsed command line and prints JSON to stdout.
//! - [`execute`] runs one command against any [`RunBackends`] and returns the
//!   JSON it would print; the HTTP service drives the same backends.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use qbank_sync_classifier::{ClassifierConfig, HttpClassifier};
use qbank_sync_core::memory::{
    InMemoryQuestionIndex, ScriptedClassifier, StaticCatalogSource, StaticHistorySource,
};
use qbank_sync_core::{
    BookId, CancellationFlag, EligibilityPredicate, ScanFilter, SyncError,
    DEFAULT_EXCLUDED_INSTITUTION_IDS, DEFAULT_KEY_PAGE_SIZE,
};
use qbank_sync_elastic::{ElasticClient, ElasticConfig};
use qbank_sync_orchestrator::{
    BackfillConfig, BackfillOrchestrator, GapConfig, GapOrchestrator, GapReport,
    ReconciliationResult,
};
use qbank_sync_store_sqlite::{SqliteCatalogStore, SqliteStoreOptions};
use serde::{Deserialize, Serialize};

pub mod logging;

#[derive(Debug, Parser)]
#[command(name = "qbank-sync")]
#[command(about = "Question bank index gap detection and attribute backfill")]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List eligible catalog books that have no documents in the index.
    Gap,
    /// Fill the learning-objective attribute on documents that lack it.
    Backfill(BackfillArgs),
    /// Check connectivity to the catalog and the index.
    Health,
}

#[derive(Debug, Clone, Default, Args)]
pub struct BackfillArgs {
    #[arg(long)]
    pub course_id: Option<i64>,
    #[arg(long)]
    pub book_id: Option<i64>,
}

impl BackfillArgs {
    #[must_use]
    pub fn filter(&self) -> ScanFilter {
        ScanFilter {
            course_id: self.course_id,
            book_id: self.book_id.map(BookId),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    #[arg(long, env = "QBANK_DB", default_value = "./qbank_catalog.sqlite3")]
    pub db: PathBuf,
    #[arg(long, default_value_t = 5000)]
    pub db_busy_timeout_ms: u64,

    #[arg(long, env = "ES_HOST", default_value = qbank_sync_elastic::DEFAULT_HOST)]
    pub es_host: String,
    #[arg(long, env = "ES_USER")]
    pub es_user: Option<String>,
    #[arg(long, env = "ES_PASSWORD", hide_env_values = true)]
    pub es_password: Option<String>,
    #[arg(long, env = "ES_INDEX", default_value = qbank_sync_elastic::DEFAULT_INDEX)]
    pub es_index: String,
    #[arg(long, default_value_t = 30_000)]
    pub es_timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_KEY_PAGE_SIZE)]
    pub key_page_size: usize,
    #[arg(long, default_value_t = qbank_sync_elastic::DEFAULT_SCAN_BATCH_SIZE)]
    pub scan_batch_size: usize,
    #[arg(long, default_value = qbank_sync_elastic::DEFAULT_SCROLL_KEEP_ALIVE)]
    pub scroll_keep_alive: String,

    #[arg(long, env = "CLASSIFIER_URL")]
    pub classifier_url: Option<String>,
    #[arg(long, env = "CLASSIFIER_API_KEY", hide_env_values = true)]
    pub classifier_api_key: Option<String>,
    #[arg(long, default_value_t = 10_000)]
    pub classifier_timeout_ms: u64,

    /// Institution ids never reported as gap candidates.
    #[arg(long = "excluded-institution", default_values_t = DEFAULT_EXCLUDED_INSTITUTION_IDS.to_vec())]
    pub excluded_institutions: Vec<i64>,
}

impl ConnectionArgs {
    #[must_use]
    pub fn store_options(&self) -> SqliteStoreOptions {
        SqliteStoreOptions {
            busy_timeout: Duration::from_millis(self.db_busy_timeout_ms),
        }
    }

    #[must_use]
    pub fn elastic_config(&self) -> ElasticConfig {
        ElasticConfig {
            host: self.es_host.clone(),
            index: self.es_index.clone(),
            username: self.es_user.clone(),
            password: self.es_password.clone(),
            timeout: Duration::from_millis(self.es_timeout_ms),
            scan_batch_size: self.scan_batch_size,
            scroll_keep_alive: self.scroll_keep_alive.clone(),
        }
    }

    /// # Errors
    /// Fails when no classifier URL was given.
    pub fn classifier_config(&self) -> Result<ClassifierConfig> {
        let url = self
            .classifier_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow!("--classifier-url (or CLASSIFIER_URL) is required for backfill"))?;
        Ok(ClassifierConfig {
            url,
            api_key: self.classifier_api_key.clone(),
            timeout: Duration::from_millis(self.classifier_timeout_ms),
        })
    }

    #[must_use]
    pub fn gap_config(&self) -> GapConfig {
        GapConfig {
            key_page_size: self.key_page_size,
            predicate: EligibilityPredicate {
                excluded_institution_ids: self.excluded_institutions.clone(),
            },
        }
    }

    fn open_store(&self) -> Result<SqliteCatalogStore, SyncError> {
        SqliteCatalogStore::open(&self.db, &self.store_options())
            .map_err(|err| SyncError::fatal("catalog store unavailable", &err))
    }

    fn elastic_client(&self) -> Result<ElasticClient, SyncError> {
        ElasticClient::new(self.elastic_config())
            .map_err(|err| SyncError::fatal("search index client misconfigured", &err))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub elasticsearch: ComponentStatus,
    pub database: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// Folds the two connectivity probes into one report.
    #[must_use]
    pub fn from_probes(elasticsearch: Result<()>, database: Result<()>) -> Self {
        let mut errors = Vec::new();
        let mut status_of = |component: &str, probe: Result<()>| match probe {
            Ok(()) => ComponentStatus::Connected,
            Err(err) => {
                errors.push(format!("{component}: {err:#}"));
                ComponentStatus::Disconnected
            }
        };
        let elasticsearch = status_of("elasticsearch", elasticsearch);
        let database = status_of("database", database);

        Self {
            status: if errors.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            elasticsearch,
            database,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Everything a caller needs to trigger the two flows. Implementations own
/// their adapters' lifecycle.
pub trait RunBackends: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn gap(&self, cancel: &CancellationFlag) -> Result<GapReport, SyncError>;

    #[allow(clippy::missing_errors_doc)]
    fn backfill(
        &self,
        filter: &ScanFilter,
        cancel: &CancellationFlag,
    ) -> Result<ReconciliationResult, SyncError>;

    fn health(&self) -> HealthReport;
}

/// Opens fresh adapters for every run from the configured connections.
#[derive(Debug, Clone)]
pub struct LiveBackends {
    connection: ConnectionArgs,
    backfill: BackfillConfig,
}

impl LiveBackends {
    #[must_use]
    pub fn new(connection: ConnectionArgs) -> Self {
        Self {
            connection,
            backfill: BackfillConfig::default(),
        }
    }
}

impl RunBackends for LiveBackends {
    fn gap(&self, cancel: &CancellationFlag) -> Result<GapReport, SyncError> {
        let store = self.connection.open_store()?;
        let index = self.connection.elastic_client()?;
        GapOrchestrator::new(&index, &store, self.connection.gap_config()).run(cancel)
    }

    fn backfill(
        &self,
        filter: &ScanFilter,
        cancel: &CancellationFlag,
    ) -> Result<ReconciliationResult, SyncError> {
        let classifier = self
            .connection
            .classifier_config()
            .and_then(HttpClassifier::new)
            .map_err(|err| SyncError::fatal("classifier misconfigured", &err))?;
        let store = self.connection.open_store()?;
        let index = self.connection.elastic_client()?;
        BackfillOrchestrator::new(&index, &store, &classifier, &index, self.backfill.clone())
            .run(filter, cancel)
    }

    fn health(&self) -> HealthReport {
        HealthReport::from_probes(
            ElasticClient::new(self.connection.elastic_config()).and_then(|client| client.ping()),
            SqliteCatalogStore::open(&self.connection.db, &self.connection.store_options())
                .and_then(|store| store.ping()),
        )
    }
}

/// Fixture-backed backends for dry runs and tests.
#[derive(Debug)]
pub struct InMemoryBackends {
    pub index: InMemoryQuestionIndex,
    pub catalog: StaticCatalogSource,
    pub history: StaticHistorySource,
    pub classifier: ScriptedClassifier,
    pub gap: GapConfig,
    pub backfill: BackfillConfig,
}

impl InMemoryBackends {
    #[must_use]
    pub fn new(
        index: InMemoryQuestionIndex,
        catalog: StaticCatalogSource,
        history: StaticHistorySource,
        classifier: ScriptedClassifier,
    ) -> Self {
        Self {
            index,
            catalog,
            history,
            classifier,
            gap: GapConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

impl RunBackends for InMemoryBackends {
    fn gap(&self, cancel: &CancellationFlag) -> Result<GapReport, SyncError> {
        GapOrchestrator::new(&self.index, &self.catalog, self.gap.clone()).run(cancel)
    }

    fn backfill(
        &self,
        filter: &ScanFilter,
        cancel: &CancellationFlag,
    ) -> Result<ReconciliationResult, SyncError> {
        BackfillOrchestrator::new(
            &self.index,
            &self.history,
            &self.classifier,
            &self.index,
            self.backfill.clone(),
        )
        .run(filter, cancel)
    }

    fn health(&self) -> HealthReport {
        HealthReport::from_probes(Ok(()), Ok(()))
    }
}

/// Runs one command and returns its JSON output.
///
/// # Errors
/// Returns an error when a flow aborts or the health check reports an
/// unreachable dependency.
pub fn execute(
    command: &Command,
    backends: &dyn RunBackends,
    cancel: &CancellationFlag,
) -> Result<serde_json::Value> {
    match command {
        Command::Gap => {
            let report = backends.gap(cancel)?;
            Ok(serde_json::to_value(report)?)
        }
        Command::Backfill(args) => {
            let summary = backends.backfill(&args.filter(), cancel)?;
            Ok(serde_json::to_value(summary)?)
        }
        Command::Health => {
            let report = backends.health();
            if !report.is_healthy() {
                return Err(anyhow!(
                    "dependencies unhealthy: {}",
                    serde_json::to_string(&report)?
                ));
            }
            Ok(serde_json::to_value(report)?)
        }
    }
}

/// Executes the parsed command line against live connections.
///
/// # Errors
/// Returns an error when the selected flow fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    logging::init_subscriber(
        logging::Verbosity::from_flags(cli.verbose, cli.quiet),
        tracing::Level::WARN,
    );
    let backends = LiveBackends::new(cli.connection);
    let output = execute(&cli.command, &backends, &CancellationFlag::new())?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
