use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use config::Config;
use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::extract::poll::PollPolicy;

const DEFAULT_BASE_URL: &str = "https://static.cigna.com";
const DEFAULT_INDEX_URL: &str =
    "https://static.cigna.com/assets/chcp/resourceLibrary/coveragePolicies/medical_a-z.html";
const DEFAULT_INSTRUCTION: &str = "Please extract structured metadata from this policy as JSON.";

/// Process-wide settings. Loaded once in `main`, shared by reference afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub index_url: String,
    pub base_url: String,
    pub store_dir: PathBuf,
    pub db_path: PathBuf,
    /// Document file extension, without the dot.
    pub extension: String,

    pub openai_api_key: Option<String>,
    pub assistant_id: Option<String>,
    pub openai_base_url: String,
    pub instruction: String,

    pub poll_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_backoff: f64,
    pub extraction_timeout_secs: u64,
    pub http_timeout_secs: u64,

    /// Delay between dispatching two documents.
    pub pacing_ms: u64,
    pub concurrency: usize,

    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,

    pub track_provenance: bool,
    pub allow_unknown_policy_id: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            index_url: DEFAULT_INDEX_URL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            store_dir: PathBuf::from("data/policies"),
            db_path: PathBuf::from("data/policies.sqlite"),
            extension: "pdf".to_string(),
            openai_api_key: None,
            assistant_id: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            poll_interval_ms: 2000,
            poll_max_interval_ms: 10_000,
            poll_backoff: 1.5,
            extraction_timeout_secs: 600,
            http_timeout_secs: 60,
            pacing_ms: 1000,
            concurrency: 1,
            date_from: None,
            date_to: None,
            track_provenance: true,
            allow_unknown_policy_id: false,
        }
    }
}

/// Credentials needed to talk to the extraction assistant.
#[derive(Debug, Clone)]
pub struct AssistantCredentials {
    pub api_key: String,
    pub assistant_id: String,
}

impl Settings {
    /// Defaults, then `policy_ingest.toml` if present, then `POLICY_*` env vars.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let cfg = Config::builder()
            .add_source(config::File::with_name("policy_ingest").required(false))
            .add_source(config::Environment::with_prefix("POLICY").try_parsing(true))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;

        // Plain names used by the assistant tooling itself.
        if settings.openai_api_key.is_none() {
            settings.openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if settings.assistant_id.is_none() {
            settings.assistant_id = std::env::var("OPENAI_ASSISTANT_ID").ok();
        }

        settings.validate()?;
        info!(
            index_url = %settings.index_url,
            db = ?settings.db_path,
            store = ?settings.store_dir,
            concurrency = settings.concurrency,
            "Settings loaded"
        );
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extension.trim().is_empty() {
            return Err(ConfigError::Missing("extension"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.poll_backoff < 1.0 {
            return Err(ConfigError::Invalid {
                key: "poll_backoff",
                reason: format!("{} is below 1.0", self.poll_backoff),
            });
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(ConfigError::Invalid {
                    key: "date_from",
                    reason: format!("{} is after date_to {}", from, to),
                });
            }
        }
        url::Url::parse(&self.base_url).map_err(|e| ConfigError::Invalid {
            key: "base_url",
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Fails when the extraction credentials are absent or blank.
    pub fn assistant_credentials(&self) -> Result<AssistantCredentials, ConfigError> {
        let api_key = non_blank(&self.openai_api_key).ok_or(ConfigError::Missing("openai_api_key"))?;
        let assistant_id =
            non_blank(&self.assistant_id).ok_or(ConfigError::Missing("assistant_id"))?;
        Ok(AssistantCredentials { api_key, assistant_id })
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_interval: Duration::from_millis(self.poll_max_interval_ms.max(self.poll_interval_ms)),
            backoff: self.poll_backoff,
            timeout: Duration::from_secs(self.extraction_timeout_secs),
        }
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
