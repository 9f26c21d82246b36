#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use qbank_sync_core::Classifier;
use serde::Deserialize;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct PredictionEnvelope {
    result: PredictionBody,
}

#[derive(Debug, Deserialize)]
struct PredictionBody {
    kazanim_id: i64,
}

/// Learning-objective classifier reached over HTTP. Any non-200 answer,
/// timeout or malformed body is an error; callers decide how to degrade.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    agent: ureq::Agent,
    config: ClassifierConfig,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(anyhow!("classifier url must not be empty"));
        }
        if config.timeout.is_zero() {
            return Err(anyhow!("classifier timeout must be positive"));
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self { agent, config })
    }
}

impl Classifier for HttpClassifier {
    fn predict(&self, course_id: i64, question_text: &str) -> Result<i64> {
        let mut request = self
            .agent
            .get(self.config.url.trim())
            .query("question_text", question_text)
            .query("course_id", &course_id.to_string());
        if let Some(api_key) = &self.config.api_key {
            request = request.set(API_KEY_HEADER, api_key);
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("classifier returned http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("classifier transport failure: {err}"));
            }
        };

        let envelope: PredictionEnvelope = response
            .into_json()
            .context("classifier response is missing result.kazanim_id")?;
        tracing::debug!(
            target: "qbank_sync::classifier",
            course_id,
            attribute_id = envelope.result.kazanim_id,
            "classifier prediction received"
        );
        Ok(envelope.result.kazanim_id)
    }
}
