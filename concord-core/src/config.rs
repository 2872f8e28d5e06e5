//! Configuration types

use crate::{ConcordError, ConcordResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Read and parse an environment variable, ignoring unset or malformed values.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|s| {
        let s = s.trim().to_lowercase();
        s == "true" || s == "1" || s == "yes"
    })
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConcordError {
    ConcordError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// ============================================================================
// BUS CONFIG
// ============================================================================

/// Message bus tuning and distributed-channel identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Cap on the JSON-encoded payload size in bytes
    pub max_message_size: usize,
    pub default_request_timeout: Duration,
    /// Endpoints without a heartbeat for this long are not live
    pub heartbeat_window: Duration,
    pub sweep_interval: Duration,
    /// How long settled correlation ids are remembered to drop late duplicates
    pub settled_retention: Duration,
    /// Maximum concurrently running handler invocations
    pub delivery_concurrency: usize,
    pub project_id: Option<String>,
    pub region: Option<String>,
    /// Distributed channel topic used for cross-process fan-out
    pub distributed_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            default_request_timeout: Duration::from_secs(30),
            heartbeat_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            settled_retention: Duration::from_secs(60),
            delivery_concurrency: 64,
            project_id: None,
            region: None,
            distributed_topic: "agent-messages".to_string(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> ConcordResult<()> {
        if self.max_message_size == 0 {
            return Err(invalid(
                "max_message_size",
                self.max_message_size,
                "max_message_size must be greater than 0",
            ));
        }
        if self.default_request_timeout.is_zero() {
            return Err(invalid(
                "default_request_timeout",
                format!("{:?}", self.default_request_timeout),
                "default_request_timeout must be positive",
            ));
        }
        if self.heartbeat_window.is_zero() {
            return Err(invalid(
                "heartbeat_window",
                format!("{:?}", self.heartbeat_window),
                "heartbeat_window must be positive",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid(
                "sweep_interval",
                format!("{:?}", self.sweep_interval),
                "sweep_interval must be positive",
            ));
        }
        if self.delivery_concurrency == 0 {
            return Err(invalid(
                "delivery_concurrency",
                self.delivery_concurrency,
                "delivery_concurrency must be greater than 0",
            ));
        }
        if self.distributed_topic.trim().is_empty() {
            return Err(ConcordError::Config(ConfigError::MissingRequired {
                field: "distributed_topic".to_string(),
            }));
        }
        Ok(())
    }

    /// Load from `CONCORD_BUS_*` environment variables over defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_message_size: env_parse("CONCORD_BUS_MAX_MESSAGE_SIZE")
                .unwrap_or(defaults.max_message_size),
            default_request_timeout: env_millis("CONCORD_BUS_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.default_request_timeout),
            heartbeat_window: env_millis("CONCORD_BUS_HEARTBEAT_WINDOW_MS")
                .unwrap_or(defaults.heartbeat_window),
            sweep_interval: env_millis("CONCORD_BUS_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval),
            settled_retention: env_millis("CONCORD_BUS_SETTLED_RETENTION_MS")
                .unwrap_or(defaults.settled_retention),
            delivery_concurrency: env_parse("CONCORD_BUS_DELIVERY_CONCURRENCY")
                .unwrap_or(defaults.delivery_concurrency),
            project_id: std::env::var("CONCORD_PROJECT_ID").ok().or(defaults.project_id),
            region: std::env::var("CONCORD_REGION").ok().or(defaults.region),
            distributed_topic: std::env::var("CONCORD_BUS_DISTRIBUTED_TOPIC")
                .unwrap_or(defaults.distributed_topic),
        }
    }

    /// Fully qualified distributed topic, prefixed with project and region when set.
    pub fn qualified_topic(&self) -> String {
        match (&self.project_id, &self.region) {
            (Some(project), Some(region)) => {
                format!("{project}.{region}.{}", self.distributed_topic)
            }
            (Some(project), None) => format!("{project}.{}", self.distributed_topic),
            _ => self.distributed_topic.clone(),
        }
    }
}

// ============================================================================
// QUALITY CONFIG
// ============================================================================

/// Quality gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Overall score below which content is mitigated before use
    pub acceptable_score: f64,
    /// Poisoning/manipulation severity above which content is rejected.
    /// `None` disables hard rejection.
    pub hard_ceiling: Option<f64>,
    /// Run a language-model polish pass after any mitigation changed content
    pub polish_enabled: bool,
    /// Model name used for rewrites and polish
    pub rewrite_model: String,
    pub rewrite_max_tokens: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            acceptable_score: 0.7,
            hard_ceiling: Some(0.9),
            polish_enabled: true,
            rewrite_model: "default".to_string(),
            rewrite_max_tokens: 1024,
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> ConcordResult<()> {
        if !(0.0..=1.0).contains(&self.acceptable_score) {
            return Err(invalid(
                "acceptable_score",
                self.acceptable_score,
                "acceptable_score must be between 0.0 and 1.0",
            ));
        }
        if let Some(ceiling) = self.hard_ceiling {
            if !(0.0..=1.0).contains(&ceiling) {
                return Err(invalid(
                    "hard_ceiling",
                    ceiling,
                    "hard_ceiling must be between 0.0 and 1.0",
                ));
            }
        }
        if self.rewrite_max_tokens == 0 {
            return Err(invalid(
                "rewrite_max_tokens",
                self.rewrite_max_tokens,
                "rewrite_max_tokens must be greater than 0",
            ));
        }
        if self.rewrite_model.trim().is_empty() {
            return Err(ConcordError::Config(ConfigError::MissingRequired {
                field: "rewrite_model".to_string(),
            }));
        }
        Ok(())
    }

    /// Load from `CONCORD_QUALITY_*` environment variables over defaults.
    ///
    /// `CONCORD_QUALITY_HARD_CEILING=off` disables hard rejection.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let hard_ceiling = match std::env::var("CONCORD_QUALITY_HARD_CEILING") {
            Ok(s) if s.trim().eq_ignore_ascii_case("off") => None,
            Ok(s) => s.trim().parse().ok().or(defaults.hard_ceiling),
            Err(_) => defaults.hard_ceiling,
        };
        Self {
            acceptable_score: env_parse("CONCORD_QUALITY_ACCEPTABLE_SCORE")
                .unwrap_or(defaults.acceptable_score),
            hard_ceiling,
            polish_enabled: env_bool("CONCORD_QUALITY_POLISH").unwrap_or(defaults.polish_enabled),
            rewrite_model: std::env::var("CONCORD_QUALITY_REWRITE_MODEL")
                .unwrap_or(defaults.rewrite_model),
            rewrite_max_tokens: env_parse("CONCORD_QUALITY_REWRITE_MAX_TOKENS")
                .unwrap_or(defaults.rewrite_max_tokens),
        }
    }
}

// ============================================================================
// ORCHESTRATOR CONFIG
// ============================================================================

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Bus identity used as `from` on orchestrator requests
    pub orchestrator_id: String,
    /// Agent types used when a request names none
    pub default_agents: Vec<String>,
    pub agent_timeout: Duration,
    /// Multiplicative confidence discount per failed agent
    pub failure_discount: f64,
    /// Floor on a successful response's quality weight
    pub min_quality_weight: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: "orchestrator".to_string(),
            default_agents: Vec::new(),
            agent_timeout: Duration::from_secs(30),
            failure_discount: 0.1,
            min_quality_weight: 0.05,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ConcordResult<()> {
        if self.orchestrator_id.trim().is_empty() {
            return Err(ConcordError::Config(ConfigError::MissingRequired {
                field: "orchestrator_id".to_string(),
            }));
        }
        if self.agent_timeout.is_zero() {
            return Err(invalid(
                "agent_timeout",
                format!("{:?}", self.agent_timeout),
                "agent_timeout must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.failure_discount) {
            return Err(invalid(
                "failure_discount",
                self.failure_discount,
                "failure_discount must be in [0.0, 1.0)",
            ));
        }
        if !(self.min_quality_weight > 0.0 && self.min_quality_weight <= 1.0) {
            return Err(invalid(
                "min_quality_weight",
                self.min_quality_weight,
                "min_quality_weight must be in (0.0, 1.0]",
            ));
        }
        Ok(())
    }

    /// Load from `CONCORD_ORCHESTRATOR_*` environment variables over defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_agents = std::env::var("CONCORD_ORCHESTRATOR_DEFAULT_AGENTS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.default_agents);
        Self {
            orchestrator_id: std::env::var("CONCORD_ORCHESTRATOR_ID")
                .unwrap_or(defaults.orchestrator_id),
            default_agents,
            agent_timeout: env_millis("CONCORD_ORCHESTRATOR_AGENT_TIMEOUT_MS")
                .unwrap_or(defaults.agent_timeout),
            failure_discount: env_parse("CONCORD_ORCHESTRATOR_FAILURE_DISCOUNT")
                .unwrap_or(defaults.failure_discount),
            min_quality_weight: env_parse("CONCORD_ORCHESTRATOR_MIN_QUALITY_WEIGHT")
                .unwrap_or(defaults.min_quality_weight),
        }
    }
}

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

/// Complete configuration for a Concord runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConcordConfig {
    pub bus: BusConfig,
    pub quality: QualityConfig,
    pub orchestrator: OrchestratorConfig,
}

impl ConcordConfig {
    pub fn validate(&self) -> ConcordResult<()> {
        self.bus.validate()?;
        self.quality.validate()?;
        self.orchestrator.validate()?;

        if self.orchestrator.agent_timeout > self.bus.default_request_timeout * 10 {
            return Err(ConcordError::Config(ConfigError::IncompatibleOptions {
                option_a: "orchestrator.agent_timeout".to_string(),
                option_b: "bus.default_request_timeout".to_string(),
            }));
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            quality: QualityConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ConcordConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bus_defaults() {
        let cfg = BusConfig::default();
        assert_eq!(cfg.max_message_size, 1_048_576);
        assert_eq!(cfg.default_request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_window, Duration::from_secs(60));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.distributed_topic, "agent-messages");
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let cfg = BusConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "sweep_interval"
        ));
    }

    #[test]
    fn test_quality_ceiling_range() {
        let cfg = QualityConfig {
            hard_ceiling: Some(1.5),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = QualityConfig {
            hard_ceiling: None,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_failure_discount_range() {
        let cfg = OrchestratorConfig {
            failure_discount: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_incompatible_timeouts() {
        let mut cfg = ConcordConfig::default();
        cfg.bus.default_request_timeout = Duration::from_millis(10);
        cfg.orchestrator.agent_timeout = Duration::from_secs(10);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Config(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_qualified_topic() {
        let mut cfg = BusConfig::default();
        assert_eq!(cfg.qualified_topic(), "agent-messages");
        cfg.project_id = Some("proj".into());
        assert_eq!(cfg.qualified_topic(), "proj.agent-messages");
        cfg.region = Some("eu-west1".into());
        assert_eq!(cfg.qualified_topic(), "proj.eu-west1.agent-messages");
    }
}
