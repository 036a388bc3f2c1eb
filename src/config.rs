//! Configuration management for the task engine.
//!
//! Configuration can be built from defaults, loaded from a JSON file, or read
//! from environment variables:
//! - `TASKTREE_MAX_DEPTH` - Optional. Recursion ceiling. Defaults to `3`.
//! - `TASKTREE_MAX_ATTEMPTS` - Optional. Attempts per node. Defaults to `3`.
//! - `TASKTREE_CONCURRENCY_LIMIT` - Optional. Concurrent provider calls. Defaults to `4`.
//! - `TASKTREE_PER_NODE_TIMEOUT_MS` - Optional. Timeout per provider call. Defaults to `120000`.
//! - `TASKTREE_RETRY_BACKOFF_MS` - Optional. Base retry delay. Defaults to `1000`.
//! - `TASKTREE_MAX_BACKOFF_MS` - Optional. Retry delay ceiling. Defaults to `60000`.
//! - `TASKTREE_PARTIAL_SUCCESS_POLICY` - Optional. `strict` or `best_effort`. Defaults to `strict`.
//! - `TASKTREE_VERIFY_ENABLED` - Optional. Defaults to `true`.
//! - `TASKTREE_VERIFY_MAX_DEPTH` - Optional. Skip verification below this depth.
//! - `TASKTREE_VERIFY_ATOMIC` - Optional. Also verify atomic nodes. Defaults to `false`.
//! - `TASKTREE_AGGREGATION_STRATEGY` - Optional. `synthesize` or `concatenate`. Defaults to `synthesize`.
//! - `TASKTREE_PROGRESS_BUFFER` - Optional. Progress channel capacity. Defaults to `256`.
//! - `TASKTREE_HISTORY_LIMIT` - Optional. Runs kept in history. Defaults to `100`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::NodeKind;

const ENV_PREFIX: &str = "TASKTREE_";

/// Depth above which a warning is emitted; trees this deep are rarely useful.
const DEEP_TREE_WARNING: u32 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How a composite node treats failed children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialSuccessPolicy {
    /// Any failed child fails the parent
    #[default]
    Strict,
    /// Aggregate whatever succeeded; fail only if nothing did
    #[serde(alias = "bestEffort")]
    BestEffort,
}

impl FromStr for PartialSuccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "strict" => Ok(Self::Strict),
            "besteffort" => Ok(Self::BestEffort),
            other => Err(format!("unknown partial success policy '{}'", other)),
        }
    }
}

/// How child results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Ask the generate provider to synthesize a combined answer
    #[default]
    Synthesize,
    /// Join child results locally, no provider call
    Concatenate,
}

impl AggregationStrategy {
    /// The strategy used when a verifier rejects an aggregate.
    pub fn alternate(&self) -> Self {
        match self {
            Self::Synthesize => Self::Concatenate,
            Self::Concatenate => Self::Synthesize,
        }
    }
}

impl FromStr for AggregationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synthesize" | "synthesise" => Ok(Self::Synthesize),
            "concatenate" | "concat" => Ok(Self::Concatenate),
            other => Err(format!("unknown aggregation strategy '{}'", other)),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Recursion ceiling; nodes at this depth are forced atomic
    #[serde(alias = "maxDepth")]
    pub max_depth: u32,

    /// Attempts per node, including the first
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,

    /// Concurrent provider calls
    #[serde(alias = "concurrencyLimit")]
    pub concurrency_limit: usize,

    /// Timeout applied to each provider call
    #[serde(alias = "perNodeTimeoutMs")]
    pub per_node_timeout_ms: u64,

    /// Base delay for exponential retry backoff
    #[serde(alias = "retryBackoffMs")]
    pub retry_backoff_ms: u64,

    /// Upper bound for retry delays
    #[serde(alias = "maxBackoffMs")]
    pub max_backoff_ms: u64,

    #[serde(alias = "partialSuccessPolicy")]
    pub partial_success_policy: PartialSuccessPolicy,

    #[serde(alias = "verifyEnabled")]
    pub verify_enabled: bool,

    /// Nodes deeper than this are not verified
    #[serde(alias = "verifyMaxDepth")]
    pub verify_max_depth: Option<u32>,

    /// Verify atomic results as well as aggregates
    #[serde(alias = "verifyAtomic")]
    pub verify_atomic: bool,

    #[serde(alias = "aggregationStrategy")]
    pub aggregation_strategy: AggregationStrategy,

    /// Capacity of the progress broadcast channel
    #[serde(alias = "progressBuffer")]
    pub progress_buffer: usize,

    /// Finished runs kept in the engine history
    #[serde(alias = "historyLimit")]
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_attempts: 3,
            concurrency_limit: 4,
            per_node_timeout_ms: 120_000,
            retry_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            partial_success_policy: PartialSuccessPolicy::Strict,
            verify_enabled: true,
            verify_max_depth: None,
            verify_atomic: false,
            aggregation_strategy: AggregationStrategy::Synthesize,
            progress_buffer: 256,
            history_limit: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            max_depth: env_or("MAX_DEPTH", defaults.max_depth)?,
            max_attempts: env_or("MAX_ATTEMPTS", defaults.max_attempts)?,
            concurrency_limit: env_or("CONCURRENCY_LIMIT", defaults.concurrency_limit)?,
            per_node_timeout_ms: env_or("PER_NODE_TIMEOUT_MS", defaults.per_node_timeout_ms)?,
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            max_backoff_ms: env_or("MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            partial_success_policy: env_or(
                "PARTIAL_SUCCESS_POLICY",
                defaults.partial_success_policy,
            )?,
            verify_enabled: env_or("VERIFY_ENABLED", defaults.verify_enabled)?,
            verify_max_depth: match std::env::var(format!("{}VERIFY_MAX_DEPTH", ENV_PREFIX)) {
                Ok(raw) => Some(parse_var("VERIFY_MAX_DEPTH", &raw)?),
                Err(_) => defaults.verify_max_depth,
            },
            verify_atomic: env_or("VERIFY_ATOMIC", defaults.verify_atomic)?,
            aggregation_strategy: env_or("AGGREGATION_STRATEGY", defaults.aggregation_strategy)?,
            progress_buffer: env_or("PROGRESS_BUFFER", defaults.progress_buffer)?,
            history_limit: env_or("HISTORY_LIMIT", defaults.history_limit)?,
        })
    }

    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check the configuration.
    ///
    /// Returns soft warnings on success; hard errors are values the engine
    /// cannot run with.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.concurrency_limit == 0 {
            return Err(invalid("concurrency_limit", "must be at least 1"));
        }
        if self.per_node_timeout_ms == 0 {
            return Err(invalid("per_node_timeout_ms", "must be greater than 0"));
        }
        if self.progress_buffer == 0 {
            return Err(invalid("progress_buffer", "must be at least 1"));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(invalid(
                "max_backoff_ms",
                "must not be smaller than retry_backoff_ms",
            ));
        }

        let mut warnings = Vec::new();
        if self.max_depth > DEEP_TREE_WARNING {
            warnings.push(format!(
                "max_depth {} is unusually deep; trees grow exponentially with depth",
                self.max_depth
            ));
        }
        if let Some(verify_depth) = self.verify_max_depth {
            if verify_depth > self.max_depth {
                warnings.push(format!(
                    "verify_max_depth {} exceeds max_depth {} and has no effect",
                    verify_depth, self.max_depth
                ));
            }
        }
        if !self.verify_enabled && self.verify_atomic {
            warnings.push("verify_atomic is ignored while verify_enabled is false".to_string());
        }
        Ok(warnings)
    }

    pub fn per_node_timeout(&self) -> Duration {
        Duration::from_millis(self.per_node_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Whether a node of `kind` at `depth` goes through the verifier.
    pub fn should_verify(&self, kind: NodeKind, depth: u32) -> bool {
        if !self.verify_enabled {
            return false;
        }
        if kind == NodeKind::Atomic && !self.verify_atomic {
            return false;
        }
        self.verify_max_depth.map_or(true, |max| depth <= max)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue(key.to_string(), reason.to_string())
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{}{}", ENV_PREFIX, name), format!("{}", e)))
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(format!("{}{}", ENV_PREFIX, name)) {
        Ok(raw) => parse_var(name, &raw),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate().expect("valid"), Vec::<String>::new());
        assert_eq!(config.per_node_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = EngineConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(key, _)) if key == "max_attempts"));

        let config = EngineConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let config = EngineConfig {
            max_depth: 2,
            verify_max_depth: Some(5),
            ..Default::default()
        };
        let warnings = config.validate().expect("valid");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("verify_max_depth"));
    }

    #[test]
    fn test_should_verify_gating() {
        let config = EngineConfig {
            verify_max_depth: Some(1),
            ..Default::default()
        };
        assert!(config.should_verify(NodeKind::Composite, 0));
        assert!(config.should_verify(NodeKind::Composite, 1));
        assert!(!config.should_verify(NodeKind::Composite, 2));
        assert!(!config.should_verify(NodeKind::Atomic, 0));

        let config = EngineConfig {
            verify_enabled: false,
            verify_atomic: true,
            ..Default::default()
        };
        assert!(!config.should_verify(NodeKind::Atomic, 0));
        assert!(!config.should_verify(NodeKind::Composite, 0));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("bestEffort".parse::<PartialSuccessPolicy>(), Ok(PartialSuccessPolicy::BestEffort));
        assert_eq!("best_effort".parse::<PartialSuccessPolicy>(), Ok(PartialSuccessPolicy::BestEffort));
        assert_eq!("STRICT".parse::<PartialSuccessPolicy>(), Ok(PartialSuccessPolicy::Strict));
        assert!("lenient".parse::<PartialSuccessPolicy>().is_err());
        assert_eq!(AggregationStrategy::Synthesize.alternate(), AggregationStrategy::Concatenate);
    }

    #[tokio::test]
    async fn test_load_file_camel_case() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"maxDepth": 5, "partialSuccessPolicy": "bestEffort", "perNodeTimeoutMs": 500}}"#
        )
        .expect("write");

        let config = EngineConfig::load_file(file.path()).await.expect("load");
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.partial_success_policy, PartialSuccessPolicy::BestEffort);
        assert_eq!(config.per_node_timeout_ms, 500);
        assert_eq!(config.max_attempts, 3);
    }
}
