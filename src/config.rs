//! Engine configuration.
//!
//! Resolution order, later wins:
//!
//! 1. compiled defaults
//! 2. YAML config file (`taleloom.yaml`, or the path handed to
//!    [`EngineConfig::load`])
//! 3. environment variables (`TALELOOM_*`)

use crate::llm::AdapterConfig;
use crate::state::StateMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    #[diagnostic(code(taleloom::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(taleloom::config::parse),
        help("The config file is YAML; see EngineConfig for the accepted fields.")
    )]
    Parse { path: PathBuf, message: String },
}

/// What to do with a non-blocking job's output that lands after the world
/// moved on (reroll or branch made its anchor round stale).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleJobPolicy {
    /// Merge the updates anyway.
    Retain,
    /// Drop the updates; the job still completes.
    Discard,
}

impl Default for StaleJobPolicy {
    fn default() -> Self {
        Self::Retain
    }
}

/// Retry schedule for job handlers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WorkerPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
            backoff_factor: 2.0,
        }
    }
}

/// One post-processing job the pipeline schedules after a send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub enabled: bool,
    /// Subflow the worker runs, `id@version`.
    #[serde(rename = "ref")]
    pub reference: String,
    /// State keys the job refreshes; marked pending while it runs.
    #[serde(default)]
    pub pending_keys: Vec<String>,
}

/// The post-processing schedule around each send.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobScheduleConfig {
    /// Gating state refresh; blocks the next round until it completes.
    pub status_update: JobSpec,
    /// Non-blocking guidance pass.
    pub guidance: JobSpec,
    /// Non-blocking rolling summary over the snapshot's turn range.
    pub summarize: JobSpec,
}

impl Default for JobScheduleConfig {
    fn default() -> Self {
        Self {
            status_update: JobSpec {
                enabled: true,
                reference: "postprocess@1".to_string(),
                pending_keys: vec!["protagonist_mood".to_string()],
            },
            guidance: JobSpec {
                enabled: true,
                reference: "guidance@1".to_string(),
                pending_keys: vec!["guidance".to_string()],
            },
            summarize: JobSpec {
                enabled: true,
                reference: "summarize@1".to_string(),
                pending_keys: vec!["story_summary".to_string()],
            },
        }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage_dir: PathBuf,
    pub flow_dirs: Vec<PathBuf>,
    pub bind_addr: String,
    /// Outbox poller period.
    pub poll_interval_ms: u64,
    /// Wall-clock cap on one main IR run; the round fails past it.
    pub main_flow_timeout_secs: u64,
    pub fail_round_on_blocker_failure: bool,
    pub stale_job_outputs: StaleJobPolicy,
    pub jobs: JobScheduleConfig,
    pub worker: WorkerPolicy,
    /// World state seeded into new sessions when the caller asks for it.
    pub initial_state: StateMap,
    /// HTTP adapter config; absent means the deterministic mock adapter.
    pub adapter: Option<AdapterConfig>,
    pub traffic_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut initial_state = StateMap::default();
        initial_state.insert("location".to_string(), json!("tavern"));
        initial_state.insert("turn_count".to_string(), json!(0));
        initial_state.insert("protagonist_mood".to_string(), json!("neutral"));
        Self {
            storage_dir: PathBuf::from("storage/sessions"),
            flow_dirs: vec![PathBuf::from("flows")],
            bind_addr: "127.0.0.1:8192".to_string(),
            poll_interval_ms: 250,
            main_flow_timeout_secs: 120,
            fail_round_on_blocker_failure: true,
            stale_job_outputs: StaleJobPolicy::default(),
            jobs: JobScheduleConfig::default(),
            worker: WorkerPolicy::default(),
            initial_state,
            adapter: None,
            traffic_capacity: 300,
        }
    }
}

impl EngineConfig {
    /// Loads configuration: defaults, then the YAML file when present,
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
            }
            Some(path) => {
                tracing::info!(path = %path.display(), "config file missing, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("TALELOOM_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("TALELOOM_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(ms) = std::env::var("TALELOOM_POLL_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                self.poll_interval_ms = ms;
            }
        }
        if let Ok(key) = std::env::var("TALELOOM_LLM_API_KEY") {
            self.adapter.get_or_insert_with(AdapterConfig::default).api_key = Some(key);
        }
    }
}
