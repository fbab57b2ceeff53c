//! Data providers and capability-indexed dispatch
//!
//! A provider declares its capability set once, at registration. The
//! registry never calls a provider to find out what it supports.

pub mod financial_datasets;

pub use financial_datasets::FinancialDatasetsProvider;

use crate::models::{Capability, CapabilitySet, FailureClass};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no registered provider supports '{0}'")]
    UnsupportedCapability(Capability),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("provider is not configured: {0}")]
    NotConfigured(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Network(_) => FailureClass::Transient,
            ProviderError::Upstream { status, .. } if *status == 408 || *status >= 500 => {
                FailureClass::Transient
            }
            _ => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Envelope every successful dispatch returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub data: Value,
    /// URL or synthetic identifier the data came from.
    pub source: String,
}

/// Trait for a financial data source
#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    /// Estimated USD cost of one call, used for budgeting.
    fn cost_per_call(&self, capability: Capability) -> f64;

    async fn fetch(
        &self,
        capability: Capability,
        args: &Value,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Registry mapping each capability to the first provider that declared it
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn DataProvider>>,
    routes: HashMap<Capability, usize>,
    supported: CapabilitySet,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            routes: HashMap::new(),
            supported: CapabilitySet::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn DataProvider>) {
        let declared = provider.capabilities();
        let index = self.providers.len();

        for capability in declared.iter() {
            self.routes.entry(capability).or_insert(index);
        }
        self.supported.extend(&declared);

        debug!(
            provider = provider.name(),
            capabilities = declared.len(),
            "provider registered"
        );
        self.providers.push(provider);
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.routes.contains_key(&capability)
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.supported
    }

    pub fn provider_for(&self, capability: Capability) -> Option<Arc<dyn DataProvider>> {
        self.routes
            .get(&capability)
            .and_then(|i| self.providers.get(*i))
            .cloned()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Cost charged against the budget for one dispatch; zero when unsupported.
    pub fn estimated_cost(&self, capability: Capability) -> f64 {
        self.provider_for(capability)
            .map(|p| p.cost_per_call(capability).max(0.0))
            .unwrap_or(0.0)
    }

    /// Unsupported capabilities and malformed arguments fail before any provider call.
    pub async fn dispatch(
        &self,
        capability: Capability,
        args: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        let provider = self
            .provider_for(capability)
            .ok_or(ProviderError::UnsupportedCapability(capability))?;

        validate_args(capability, args)?;
        provider.fetch(capability, args).await
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub const PERIODS: [&str; 3] = ["annual", "quarterly", "ttm"];

/// Argument shape check shared by every provider.
pub fn validate_args(capability: Capability, args: &Value) -> Result<(), ProviderError> {
    let map = args.as_object().ok_or_else(|| {
        ProviderError::InvalidArguments("arguments must be a JSON object".to_string())
    })?;

    match map.get("ticker").and_then(Value::as_str).map(str::trim) {
        Some(ticker) if !ticker.is_empty() => {}
        _ => {
            return Err(ProviderError::InvalidArguments(
                "'ticker' must be a non-empty string".to_string(),
            ))
        }
    }

    if let Some(period) = map.get("period") {
        match period.as_str() {
            Some(p) if PERIODS.contains(&p) => {}
            _ => {
                return Err(ProviderError::InvalidArguments(format!(
                    "'period' must be one of {}",
                    PERIODS.join(", ")
                )))
            }
        }
    }

    if let Some(limit) = map.get("limit") {
        if !matches!(limit.as_u64(), Some(n) if n > 0) {
            return Err(ProviderError::InvalidArguments(
                "'limit' must be a positive integer".to_string(),
            ));
        }
    }

    if capability == Capability::Prices {
        for key in ["start_date", "end_date"] {
            let raw = map.get(key).and_then(Value::as_str).ok_or_else(|| {
                ProviderError::InvalidArguments(format!("'{}' is required for prices", key))
            })?;
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ProviderError::InvalidArguments(format!("'{}' must be YYYY-MM-DD", key))
            })?;
        }
    }

    Ok(())
}
