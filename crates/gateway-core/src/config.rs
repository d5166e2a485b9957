use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Global configuration instance.
static CONFIG: RwLock<Option<Config>> = RwLock::new(None);

/// Tuning knobs the orchestration core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Built-in LLM gateway configuration.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Debate timing/format defaults.
    #[serde(default)]
    pub debate: DebateConfig,

    /// Topic discussion timing defaults.
    #[serde(default)]
    pub topic: TopicConfig,

    /// Fact-check worker configuration.
    #[serde(default)]
    pub factcheck: FactcheckConfig,

    /// HTTP-facade knobs the core is aware of but does not enforce itself.
    #[serde(default)]
    pub boundary: BoundaryConfig,

    /// Metrics server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Primary built-in model identifier.
    #[serde(default = "default_claude_model")]
    pub claude_model: String,

    /// Ordered fallback models, tried in order on overload (429/529).
    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,

    /// Per-call request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum attempts per model before giving up (default 4).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential backoff cap in seconds (default 30s).
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Base URL of the LLM vendor collaborator.
    #[serde(default = "default_llm_url")]
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            claude_model: default_claude_model(),
            fallback_models: default_fallback_models(),
            request_timeout_secs: default_llm_timeout(),
            max_retries: default_max_retries(),
            backoff_cap_secs: default_backoff_cap_secs(),
            base_url: default_llm_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    #[serde(default = "default_turn_timeout")]
    pub default_turn_timeout_secs: u64,
    #[serde(default = "default_turn_cooldown")]
    pub default_turn_cooldown_secs: u64,
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default = "default_token_limit")]
    pub default_token_limit: usize,
    /// Agent counts per format: 1v1=2, 2v2=4, 3v3=6.
    #[serde(default = "default_format_agent_counts")]
    pub format_agent_counts: FormatCounts,
    /// Default turn counts per format: 1v1=10, 2v2=8, 3v3=6.
    #[serde(default = "default_format_turn_counts")]
    pub format_turn_counts: FormatCounts,
    #[serde(default = "default_sandbox_turns")]
    pub sandbox_turns: u32,
    #[serde(default = "default_max_concurrent_external")]
    pub max_concurrent_debates_per_external: usize,
    #[serde(default = "default_external_turn_timeout")]
    pub external_turn_timeout_secs: u64,
    #[serde(default = "default_comment_timeout")]
    pub comment_timeout_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            default_turn_timeout_secs: default_turn_timeout(),
            default_turn_cooldown_secs: default_turn_cooldown(),
            default_max_turns: default_max_turns(),
            default_token_limit: default_token_limit(),
            format_agent_counts: default_format_agent_counts(),
            format_turn_counts: default_format_turn_counts(),
            sandbox_turns: default_sandbox_turns(),
            max_concurrent_debates_per_external: default_max_concurrent_external(),
            external_turn_timeout_secs: default_external_turn_timeout(),
            comment_timeout_secs: default_comment_timeout(),
            health_check_timeout_secs: default_health_check_timeout(),
        }
    }
}

/// Per-format counts for 1v1/2v2/3v3.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FormatCounts {
    pub one_v_one: u32,
    pub two_v_two: u32,
    pub three_v_three: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_polling_interval")]
    pub default_polling_interval_secs: u64,
    #[serde(default = "default_inter_agent_pause")]
    pub inter_agent_pause_secs: u64,
    #[serde(default = "default_skip_pause")]
    pub skip_pause_secs: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            default_polling_interval_secs: default_polling_interval(),
            inter_agent_pause_secs: default_inter_agent_pause(),
            skip_pause_secs: default_skip_pause(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactcheckConfig {
    #[serde(default = "default_factcheck_max_per_debate")]
    pub max_per_debate: usize,
    #[serde(default = "default_url_fetch_timeout")]
    pub url_fetch_timeout_secs: u64,
    #[serde(default = "default_citation_body_limit")]
    pub citation_body_limit_bytes: usize,
    #[serde(default = "default_content_match_limit")]
    pub content_match_limit_bytes: usize,
}

impl Default for FactcheckConfig {
    fn default() -> Self {
        Self {
            max_per_debate: default_factcheck_max_per_debate(),
            url_fetch_timeout_secs: default_url_fetch_timeout(),
            citation_body_limit_bytes: default_citation_body_limit(),
            content_match_limit_bytes: default_content_match_limit(),
        }
    }
}

/// Knobs owned by the HTTP/API facade (out of scope, §1) that this core is
/// merely aware of per §6 — no middleware here enforces them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_auth_lockout_threshold")]
    pub auth_lockout_threshold: u32,
    #[serde(default = "default_auth_lockout_window_secs")]
    pub auth_lockout_window_secs: u64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: default_body_limit_bytes(),
            auth_lockout_threshold: default_auth_lockout_threshold(),
            auth_lockout_window_secs: default_auth_lockout_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

fn default_claude_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_fallback_models() -> Vec<String> {
    vec!["claude-haiku-4-5".to_string(), "claude-sonnet-4-5".to_string()]
}
fn default_llm_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    4
}
fn default_backoff_cap_secs() -> u64 {
    30
}
fn default_llm_url() -> String {
    "http://llm-gateway:8000".to_string()
}
fn default_turn_timeout() -> u64 {
    120
}
fn default_turn_cooldown() -> u64 {
    10
}
fn default_max_turns() -> u32 {
    10
}
fn default_token_limit() -> usize {
    500
}
fn default_format_agent_counts() -> FormatCounts {
    FormatCounts {
        one_v_one: 2,
        two_v_two: 4,
        three_v_three: 6,
    }
}
fn default_format_turn_counts() -> FormatCounts {
    FormatCounts {
        one_v_one: 10,
        two_v_two: 8,
        three_v_three: 6,
    }
}
fn default_sandbox_turns() -> u32 {
    6
}
fn default_max_concurrent_external() -> usize {
    3
}
fn default_external_turn_timeout() -> u64 {
    120
}
fn default_comment_timeout() -> u64 {
    120
}
fn default_health_check_timeout() -> u64 {
    10
}
fn default_polling_interval() -> u64 {
    30
}
fn default_inter_agent_pause() -> u64 {
    5
}
fn default_skip_pause() -> u64 {
    2
}
fn default_factcheck_max_per_debate() -> usize {
    20
}
fn default_url_fetch_timeout() -> u64 {
    5
}
fn default_citation_body_limit() -> usize {
    5_000
}
fn default_content_match_limit() -> usize {
    3_000
}
fn default_body_limit_bytes() -> usize {
    10 * 1024
}
fn default_auth_lockout_threshold() -> u32 {
    5
}
fn default_auth_lockout_window_secs() -> u64 {
    3600
}
fn default_metrics_port() -> u16 {
    2113
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            debate: DebateConfig::default(),
            topic: TopicConfig::default(),
            factcheck: FactcheckConfig::default(),
            boundary: BoundaryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or environment.
    pub fn load() -> GatewayResult<Self> {
        if let Ok(config_path) = env::var("AGON_CONFIG_PATH") {
            Self::from_file(&config_path)
        } else if Path::new("/app/config/agon.yaml").exists() {
            Self::from_file("/app/config/agon.yaml")
        } else if Path::new("config/agon.yaml").exists() {
            Self::from_file("config/agon.yaml")
        } else {
            Ok(Self::from_env(Self::default()))
        }
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file(path: &str) -> GatewayResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| GatewayError::ConfigurationError(format!("failed to read config file: {e}")))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::ConfigurationError(format!("failed to parse config: {e}")))?;

        Ok(Self::from_env(config))
    }

    /// Override configuration with environment variables.
    pub fn from_env(mut config: Config) -> Self {
        if let Ok(v) = env::var("CLAUDE_MODEL") {
            config.llm.claude_model = v;
        }
        if let Ok(v) = env::var("LLM_SERVICE_URL") {
            config.llm.base_url = v;
        }
        if let Ok(v) = env::var("LLM_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.llm.request_timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var("DEFAULT_TURN_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.debate.default_turn_timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var("DEFAULT_TURN_COOLDOWN_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.debate.default_turn_cooldown_secs = secs;
            }
        }
        if let Ok(v) = env::var("DEFAULT_MAX_TURNS") {
            if let Ok(n) = v.parse::<u32>() {
                config.debate.default_max_turns = n;
            }
        }
        if let Ok(v) = env::var("FACTCHECK_MAX_PER_DEBATE") {
            if let Ok(n) = v.parse::<usize>() {
                config.factcheck.max_per_debate = n;
            }
        }
        if let Ok(v) = env::var("METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.metrics.port = port;
            }
        }

        config
    }

    /// Get the global configuration instance, initializing it on first use.
    pub fn global() -> GatewayResult<Config> {
        let guard = CONFIG
            .read()
            .map_err(|e| GatewayError::InternalError(format!("config lock poisoned: {e}")))?;

        if let Some(ref config) = *guard {
            Ok(config.clone())
        } else {
            drop(guard);
            Self::initialize()
        }
    }

    /// Initialize the global configuration.
    pub fn initialize() -> GatewayResult<Config> {
        let config = Self::load()?;

        let mut guard = CONFIG
            .write()
            .map_err(|e| GatewayError::InternalError(format!("config lock poisoned: {e}")))?;

        *guard = Some(config.clone());
        Ok(config)
    }

    /// Replace the global configuration (used by tests and hot reload).
    pub fn update(config: Config) -> GatewayResult<()> {
        let mut guard = CONFIG
            .write()
            .map_err(|e| GatewayError::InternalError(format!("config lock poisoned: {e}")))?;

        *guard = Some(config);
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.debate.default_turn_timeout_secs)
    }

    pub fn turn_cooldown(&self) -> Duration {
        Duration::from_secs(self.debate.default_turn_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.llm.max_retries, 4);
        assert_eq!(config.debate.default_token_limit, 500);
        assert_eq!(config.factcheck.max_per_debate, 20);
        assert_eq!(config.debate.format_agent_counts.three_v_three, 6);
        assert_eq!(config.debate.format_turn_counts.one_v_one, 10);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: test-local environment variables, serialized via #[serial].
        unsafe {
            env::set_var("LLM_SERVICE_URL", "http://custom:9000");
            env::set_var("DEFAULT_MAX_TURNS", "12");
        }

        let config = Config::from_env(Config::default());

        assert_eq!(config.llm.base_url, "http://custom:9000");
        assert_eq!(config.debate.default_max_turns, 12);

        // SAFETY: see above.
        unsafe {
            env::remove_var("LLM_SERVICE_URL");
            env::remove_var("DEFAULT_MAX_TURNS");
        }
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.llm_timeout(), Duration::from_secs(30));
        assert_eq!(config.turn_timeout(), Duration::from_secs(120));
        assert_eq!(config.turn_cooldown(), Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn test_global_config() {
        let config = Config::global().expect("should load global config");
        assert!(config.llm.max_retries > 0);

        let mut new_config = config.clone();
        new_config.metrics.port = 9999;
        Config::update(new_config).expect("should update config");

        let updated = Config::global().expect("should get updated config");
        assert_eq!(updated.metrics.port, 9999);
    }
}
