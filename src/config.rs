//! Runtime configuration
//!
//! Everything is read from the environment (a `.env` file is honoured by the
//! binaries through `dotenv`). Every value has a default so the engine runs
//! fully in-process with no external services.

use crate::audit::DEFAULT_ARCHIVE_CAPACITY;
use crate::error::InvestigationError;
use crate::models::{RiskCategory, SpecialistKind};
use crate::Result;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Specialist task runner settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Timeout applied to kinds without an explicit override
    pub default_timeout: Duration,
    pub kind_timeouts: HashMap<SpecialistKind, Duration>,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Backoff before retry `n` (1-based) is `retry_backoff * 2^(n-1)`
    pub retry_backoff: Duration,
    /// How long a cancelled specialist may take to wind down
    pub cancel_grace: Duration,
}

impl RunnerConfig {
    pub fn timeout_for(&self, kind: SpecialistKind) -> Duration {
        self.kind_timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            kind_timeouts: HashMap::new(),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// Session orchestration settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Session-level deadline once tasks are running
    pub session_timeout: Duration,
    /// Sessions without activity for this long are reaped
    pub idle_timeout: Duration,
    /// Per-subscriber event queue bound
    pub event_buffer: usize,
    /// Upper bound on waiting for the question generator
    pub question_timeout: Duration,
    /// Upper bound on any pattern memory call
    pub memory_timeout: Duration,
    /// Minimum confidence for a stored pattern to bias dispatch
    pub pattern_confidence_threshold: f64,
    /// Closed sessions kept in the archive
    pub archive_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(3600),
            event_buffer: 256,
            question_timeout: Duration::from_millis(5000),
            memory_timeout: Duration::from_millis(1500),
            pattern_confidence_threshold: 0.7,
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
        }
    }
}

/// Category weights as configured; validated by the risk model
#[derive(Debug, Clone)]
pub struct RiskWeights(pub Vec<(RiskCategory, f64)>);

impl Default for RiskWeights {
    fn default() -> Self {
        Self(RiskCategory::ALL.iter().map(|c| (*c, 0.25)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub gemini_api_key: Option<String>,
    pub specialist_api_base_url: Option<String>,
    pub database_url: Option<String>,
    pub runner: RunnerConfig,
    pub orchestrator: OrchestratorConfig,
    pub risk_weights: RiskWeights,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            gemini_api_key: None,
            specialist_api_base_url: None,
            database_url: None,
            runner: RunnerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            risk_weights: RiskWeights::default(),
        }
    }
}

impl Config {
    /// Load from process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(v) => parse_value("PORT", &v)?,
            None => defaults.port,
        };

        let mut runner = defaults.runner;
        if let Some(v) = get("SPECIALIST_TIMEOUT_SECS") {
            runner.default_timeout = Duration::from_secs(parse_value("SPECIALIST_TIMEOUT_SECS", &v)?);
        }
        for kind in SpecialistKind::ALL {
            let key = format!(
                "SPECIALIST_TIMEOUT_SECS_{}",
                kind.as_str().to_uppercase().replace('-', "_")
            );
            if let Some(v) = get(key.as_str()) {
                runner
                    .kind_timeouts
                    .insert(kind, Duration::from_secs(parse_value(&key, &v)?));
            }
        }
        if let Some(v) = get("RETRY_BACKOFF_MS") {
            runner.retry_backoff = Duration::from_millis(parse_value("RETRY_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("CANCEL_GRACE_MS") {
            runner.cancel_grace = Duration::from_millis(parse_value("CANCEL_GRACE_MS", &v)?);
        }

        let mut orchestrator = defaults.orchestrator;
        if let Some(v) = get("SESSION_TIMEOUT_SECS") {
            orchestrator.session_timeout =
                Duration::from_secs(parse_value("SESSION_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("IDLE_TIMEOUT_SECS") {
            orchestrator.idle_timeout = Duration::from_secs(parse_value("IDLE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("EVENT_BUFFER") {
            let buffer: usize = parse_value("EVENT_BUFFER", &v)?;
            if buffer == 0 {
                return Err(InvestigationError::ConfigError(
                    "EVENT_BUFFER must be at least 1".to_string(),
                ));
            }
            orchestrator.event_buffer = buffer;
        }
        if let Some(v) = get("QUESTION_TIMEOUT_MS") {
            orchestrator.question_timeout =
                Duration::from_millis(parse_value("QUESTION_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("ARCHIVE_CAPACITY") {
            let capacity: usize = parse_value("ARCHIVE_CAPACITY", &v)?;
            if capacity == 0 {
                return Err(InvestigationError::ConfigError(
                    "ARCHIVE_CAPACITY must be at least 1".to_string(),
                ));
            }
            orchestrator.archive_capacity = capacity;
        }
        if let Some(v) = get("PATTERN_CONFIDENCE_THRESHOLD") {
            orchestrator.pattern_confidence_threshold =
                parse_value("PATTERN_CONFIDENCE_THRESHOLD", &v)?;
        }

        let mut weights = defaults.risk_weights.0;
        for (category, weight) in weights.iter_mut() {
            let key = format!("RISK_WEIGHT_{}", format!("{:?}", category).to_uppercase());
            if let Some(v) = get(key.as_str()) {
                *weight = parse_value(&key, &v)?;
            }
        }

        Ok(Self {
            port,
            gemini_api_key: get("GEMINI_API_KEY"),
            specialist_api_base_url: get("SPECIALIST_API_BASE_URL"),
            database_url: get("DATABASE_URL"),
            runner,
            orchestrator,
            risk_weights: RiskWeights(weights),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        InvestigationError::ConfigError(format!("{} has an invalid value: {:?}", key, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.runner.max_retries, 1);
        assert!(config.database_url.is_none());
        let total: f64 = config.risk_weights.0.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("SPECIALIST_TIMEOUT_SECS", "5"),
            ("SPECIALIST_TIMEOUT_SECS_CHAIN_TRACING", "30"),
            ("RISK_WEIGHT_GEOGRAPHIC", "0.4"),
            ("GEMINI_API_KEY", "  "),
            ("ARCHIVE_CAPACITY", "25"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.orchestrator.archive_capacity, 25);
        assert_eq!(
            config.runner.timeout_for(SpecialistKind::EntityResearch),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.runner.timeout_for(SpecialistKind::ChainTracing),
            Duration::from_secs(30)
        );
        assert!(config
            .risk_weights
            .0
            .contains(&(RiskCategory::Geographic, 0.4)));
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let err = Config::from_lookup(lookup(&[("EVENT_BUFFER", "lots")])).unwrap_err();
        assert!(matches!(err, InvestigationError::ConfigError(_)));

        let err = Config::from_lookup(lookup(&[("EVENT_BUFFER", "0")])).unwrap_err();
        assert!(matches!(err, InvestigationError::ConfigError(_)));

        let err = Config::from_lookup(lookup(&[("ARCHIVE_CAPACITY", "0")])).unwrap_err();
        assert!(matches!(err, InvestigationError::ConfigError(_)));
    }
}
