//! Configuration models for prefclean.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::record::fields;

/// Top-level configuration for a cleaning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OpenAI-compatible inference endpoint used by the scorer
    #[serde(default)]
    pub llm: LlmConfig,

    /// Source loading and pre-processing
    pub loader: LoaderConfig,

    /// Quality scoring
    pub scorer: ScorerConfig,

    /// Column pruning
    #[serde(default)]
    pub pruner: PrunerConfig,

    /// Curation sink (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkConfig>,

    /// Output settings
    pub output: OutputConfig,
}

/// Inference endpoint configuration.
///
/// K_i: The endpoint must speak the OpenAI chat completions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (supports ${ENV_VAR} expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    /// Leave unset for local endpoints without auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Custom headers to include in requests (values support ${ENV_VAR})
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://api-inference.huggingface.co/v1".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: Some("HF_TOKEN".to_string()),
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Source loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Input JSONL file, one record per line
    pub path: PathBuf,

    /// Records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Shuffle chosen/rejected into generations/order before loading
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Seed for the pair shuffler (random if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Output field renames (source -> target)
    #[serde(default = "default_rename")]
    pub rename: IndexMap<String, String>,
}

fn default_batch_size() -> usize {
    50
}

fn default_true() -> bool {
    true
}

/// Default rename table: `question -> instruction`.
pub fn default_rename() -> IndexMap<String, String> {
    IndexMap::from([(
        fields::QUESTION.to_string(),
        fields::INSTRUCTION.to_string(),
    )])
}

/// Quality aspect the scorer rates generations on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aspect {
    Helpfulness,
    Honesty,
    InstructionFollowing,
    Truthfulness,
    /// Holistic rating across all aspects (default)
    #[default]
    OverallRating,
}

impl Aspect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aspect::Helpfulness => "helpfulness",
            Aspect::Honesty => "honesty",
            Aspect::InstructionFollowing => "instruction-following",
            Aspect::Truthfulness => "truthfulness",
            Aspect::OverallRating => "overall-rating",
        }
    }
}

/// Scorer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Aspect to rate
    #[serde(default)]
    pub aspect: Aspect,

    /// Maximum concurrent scoring requests within a batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Remote model used for scoring
    pub model: ModelSpec,
}

fn default_concurrency() -> usize {
    4
}

/// Specification for a remote model.
///
/// K_i: Model ID format depends on the endpoint.
/// - Hugging Face / OpenRouter: "org/model" (e.g., "meta-llama/Meta-Llama-3.1-70B-Instruct")
/// - vLLM/Ollama: model name as loaded (e.g., "llama3.3:70b")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model ID
    pub id: String,

    /// Tokenizer ID, when the endpoint serves a model with a different tokenizer repo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_id: Option<String>,

    /// Maximum tokens for the completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Input price per 1M tokens (USD) - set to 0 for on-prem
    #[serde(default)]
    pub input_price_per_1m: f64,

    /// Output price per 1M tokens (USD) - set to 0 for on-prem
    #[serde(default)]
    pub output_price_per_1m: f64,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f64 {
    0.7
}

impl ModelSpec {
    /// Create a spec with default generation parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tokenizer_id: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            input_price_per_1m: 0.0,
            output_price_per_1m: 0.0,
        }
    }
}

/// Column pruner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunerConfig {
    /// Allow-listed columns, in output order
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
}

/// Default allow-list kept after scoring.
pub fn default_columns() -> Vec<String> {
    [
        fields::INSTRUCTION,
        fields::GENERATIONS,
        fields::ORDER,
        fields::RATINGS,
        fields::RATIONALES,
        fields::MODEL_NAME,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            columns: default_columns(),
        }
    }
}

/// Argilla curation sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Dataset name in the annotation server
    pub dataset_name: String,

    /// Workspace the dataset lives in
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Base URL of the Argilla server
    pub api_url: String,

    /// API key (supports ${ENV_VAR} expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_sink_api_key_env")]
    pub api_key_env: String,

    /// Records per upload request
    #[serde(default = "default_upload_batch_size")]
    pub batch_size: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_workspace() -> String {
    "argilla".to_string()
}

fn default_sink_api_key_env() -> String {
    "ARGILLA_API_KEY".to_string()
}

fn default_upload_batch_size() -> usize {
    100
}

impl SinkConfig {
    /// Resolve the sink API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(expand_env_vars(key));
        }
        std::env::var(&self.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            endpoint: "sink".to_string(),
            env_var: self.api_key_env.clone(),
        })
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Pruned records, JSONL
    pub path: PathBuf,

    /// Directory to save the run's distiset to (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distiset_dir: Option<PathBuf>,

    /// Write a dataset card alongside the distiset
    #[serde(default = "default_true")]
    pub save_card: bool,

    /// Copy the (redacted) configuration into the distiset
    #[serde(default = "default_true")]
    pub save_pipeline_config: bool,

    /// Copy the run log into the distiset
    #[serde(default = "default_true")]
    pub save_pipeline_log: bool,
}

impl OutputConfig {
    /// File the run log is written to: the output path with a `.log` extension.
    pub fn log_path(&self) -> PathBuf {
        self.path.with_extension("log")
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot drive a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loader.batch_size == 0 {
            return Err(ConfigError::Invalid("loader.batch_size must be > 0".into()));
        }
        if self.scorer.concurrency == 0 {
            return Err(ConfigError::Invalid("scorer.concurrency must be > 0".into()));
        }
        if self.scorer.model.id.trim().is_empty() {
            return Err(ConfigError::Invalid("scorer.model.id is empty".into()));
        }
        if self.llm.max_retries == 0 {
            return Err(ConfigError::Invalid("llm.max_retries must be > 0".into()));
        }
        if self.pruner.columns.is_empty() {
            return Err(ConfigError::Invalid("pruner.columns is empty".into()));
        }
        if let Some((from, _)) = self.loader.rename.iter().find(|(_, to)| to.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "loader.rename maps '{from}' to an empty name"
            )));
        }
        if let Some(sink) = &self.sink {
            if sink.batch_size == 0 {
                return Err(ConfigError::Invalid("sink.batch_size must be > 0".into()));
            }
        }
        Ok(())
    }

    /// Resolve the inference API key from config or environment.
    ///
    /// Returns `None` when no key is configured (valid for local endpoints).
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(key) = &self.llm.api_key {
            return Ok(Some(expand_env_vars(key)));
        }

        match &self.llm.api_key_env {
            Some(env_var) => std::env::var(env_var)
                .map(Some)
                .map_err(|_| ConfigError::MissingApiKey {
                    endpoint: "llm".to_string(),
                    env_var: env_var.clone(),
                }),
            None => Ok(None),
        }
    }

    /// Copy of this config without literal secrets, for persisting.
    ///
    /// Keys and headers written as `${VAR}` references are kept. Literal keys
    /// are dropped so that loading the copy falls back to `api_key_env`, and
    /// literal headers are dropped.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.llm.api_key = config.llm.api_key.take().filter(|k| references_env(k));
        config.llm.headers.retain(|_, v| references_env(v));
        if let Some(sink) = config.sink.as_mut() {
            sink.api_key = sink.api_key.take().filter(|k| references_env(k));
        }
        config
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("static env var pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
fn references_env(s: &str) -> bool {
    ENV_VAR_RE.is_match(s)
}

pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_RE.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error, invalid values
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing API key for '{endpoint}': set {env_var} env var or api_key in config")]
    MissingApiKey { endpoint: String, env_var: String },
}
