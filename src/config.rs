//! Runtime configuration
//!
//! Values come from the process environment (after `.env` is loaded).
//! Every knob has a default so a bare environment still runs.

use crate::error::ResearchError;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://research.db";
pub const DEFAULT_CACHE_DIR: &str = ".research/cache";
pub const DEFAULT_FINANCIAL_API_BASE_URL: &str = "https://api.financialdatasets.ai";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Loop limits: the safety envelope of a single session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopLimits {
    pub max_steps: u32,
    pub max_cost_usd: f64,
    /// A digest seen more than this many times without progress trips the detector.
    pub loop_threshold: u32,
    /// Planners must not re-emit a digest attempted this many times.
    pub retry_ceiling: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_cost_usd: 1.0,
            loop_threshold: 2,
            retry_ceiling: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per dispatch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub max_concurrency: usize,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResearchConfig {
    /// `sqlite://...` for the durable store, `memory` for a process-local one.
    pub database_url: String,
    pub cache: CacheSettings,
    pub limits: LoopLimits,
    pub executor: ExecutorSettings,
    pub cost_per_call_usd: f64,
    pub financial_api_base_url: String,
    pub financial_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub port: u16,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            cache: CacheSettings::default(),
            limits: LoopLimits::default(),
            executor: ExecutorSettings::default(),
            cost_per_call_usd: 0.01,
            financial_api_base_url: DEFAULT_FINANCIAL_API_BASE_URL.to_string(),
            financial_api_key: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            port: 8080,
        }
    }
}

impl ResearchConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let limits = LoopLimits {
            max_steps: parse_or(&get, "RESEARCH_MAX_STEPS", defaults.limits.max_steps)?,
            max_cost_usd: parse_or(&get, "RESEARCH_MAX_COST_USD", defaults.limits.max_cost_usd)?,
            loop_threshold: parse_or(
                &get,
                "RESEARCH_LOOP_THRESHOLD",
                defaults.limits.loop_threshold,
            )?,
            retry_ceiling: parse_or(&get, "RESEARCH_RETRY_CEILING", defaults.limits.retry_ceiling)?,
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(
                &get,
                "RESEARCH_MAX_ATTEMPTS",
                defaults.executor.retry.max_attempts,
            )?,
            base_delay: Duration::from_millis(parse_or(&get, "RESEARCH_RETRY_BASE_MS", 500u64)?),
            max_delay: Duration::from_millis(parse_or(&get, "RESEARCH_RETRY_MAX_MS", 8_000u64)?),
            jitter: parse_or(&get, "RESEARCH_RETRY_JITTER", true)?,
        };

        let executor = ExecutorSettings {
            max_concurrency: parse_or(
                &get,
                "RESEARCH_MAX_CONCURRENCY",
                defaults.executor.max_concurrency,
            )?,
            call_timeout: Duration::from_secs(parse_or(&get, "RESEARCH_CALL_TIMEOUT_SECS", 30u64)?),
            retry,
        };

        let cache = CacheSettings {
            enabled: parse_or(&get, "RESEARCH_CACHE_ENABLED", true)?,
            dir: get("RESEARCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache.dir),
            ttl: Duration::from_secs(parse_or(&get, "RESEARCH_CACHE_TTL_SECS", 86_400u64)?),
        };

        let config = Self {
            database_url: get("RESEARCH_DATABASE_URL")
                .or_else(|| get("DATABASE_URL"))
                .unwrap_or(defaults.database_url),
            cache,
            limits,
            executor,
            cost_per_call_usd: parse_or(
                &get,
                "RESEARCH_COST_PER_CALL_USD",
                defaults.cost_per_call_usd,
            )?,
            financial_api_base_url: get("FINANCIAL_API_BASE_URL")
                .unwrap_or(defaults.financial_api_base_url)
                .trim_end_matches('/')
                .to_string(),
            financial_api_key: get("FINANCIAL_DATASETS_API_KEY"),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            port: match get("PORT").or_else(|| get("API_PORT")) {
                Some(raw) => parse_value("PORT", &raw)?,
                None => defaults.port,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // NaN compares false against everything, so check finiteness first
        if !self.limits.max_cost_usd.is_finite() || self.limits.max_cost_usd < 0.0 {
            return Err(ResearchError::Config(
                "RESEARCH_MAX_COST_USD must be a finite, non-negative amount".to_string(),
            ));
        }
        if !self.cost_per_call_usd.is_finite() || self.cost_per_call_usd < 0.0 {
            return Err(ResearchError::Config(
                "RESEARCH_COST_PER_CALL_USD must be a finite, non-negative amount".to_string(),
            ));
        }
        if self.executor.max_concurrency == 0 {
            return Err(ResearchError::Config(
                "RESEARCH_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.executor.retry.max_attempts == 0 {
            return Err(ResearchError::Config(
                "RESEARCH_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| ResearchError::Config(format!("{} has invalid value '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = ResearchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ResearchConfig::default());
        assert_eq!(config.cache.ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = ResearchConfig::from_lookup(lookup(&[
            ("RESEARCH_MAX_STEPS", "3"),
            ("RESEARCH_MAX_COST_USD", "0.25"),
            ("RESEARCH_CACHE_ENABLED", "false"),
            ("RESEARCH_DATABASE_URL", "memory"),
            ("FINANCIAL_API_BASE_URL", "http://localhost:9000/"),
            ("FINANCIAL_DATASETS_API_KEY", "  "),
            ("API_PORT", "9090"),
        ]))
        .unwrap();

        assert_eq!(config.limits.max_steps, 3);
        assert_eq!(config.limits.max_cost_usd, 0.25);
        assert!(!config.cache.enabled);
        assert_eq!(config.database_url, "memory");
        assert_eq!(config.financial_api_base_url, "http://localhost:9000");
        assert_eq!(config.financial_api_key, None);
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = ResearchConfig::from_lookup(lookup(&[("RESEARCH_MAX_STEPS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("RESEARCH_MAX_STEPS"));

        assert!(
            ResearchConfig::from_lookup(lookup(&[("RESEARCH_MAX_CONCURRENCY", "0")])).is_err()
        );
    }

    #[test]
    fn test_non_finite_costs_are_rejected() {
        for raw in ["NaN", "inf", "-1"] {
            let err = ResearchConfig::from_lookup(lookup(&[("RESEARCH_MAX_COST_USD", raw)]))
                .unwrap_err();
            assert!(err.to_string().contains("RESEARCH_MAX_COST_USD"), "{} accepted", raw);
        }
        assert!(
            ResearchConfig::from_lookup(lookup(&[("RESEARCH_COST_PER_CALL_USD", "NaN")])).is_err()
        );
    }
}
