//! HTTP provider for the Financial Datasets API

use super::{DataProvider, ProviderError, ProviderResponse};
use crate::config::ResearchConfig;
use crate::error::ResearchError;
use crate::models::{Capability, CapabilitySet};
use crate::Result;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct FinancialDatasetsProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    capabilities: CapabilitySet,
    cost_per_call: f64,
}

impl FinancialDatasetsProvider {
    pub fn new(base_url: &str, api_key: Option<String>, cost_per_call: f64) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ResearchError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            capabilities: CapabilitySet::all(),
            cost_per_call,
        })
    }

    pub fn from_config(config: &ResearchConfig) -> Result<Self> {
        Self::new(
            &config.financial_api_base_url,
            config.financial_api_key.clone(),
            config.cost_per_call_usd,
        )
    }

    /// Restricts the declared capability set, e.g. for a plan tier without insider data.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn endpoint(capability: Capability) -> &'static str {
        match capability {
            Capability::IncomeStatements => "/financials/income-statements/",
            Capability::BalanceSheets => "/financials/balance-sheets/",
            Capability::CashFlowStatements => "/financials/cash-flow-statements/",
            Capability::PriceSnapshot => "/prices/snapshot/",
            Capability::Prices => "/prices/",
            Capability::FinancialMetricsSnapshot => "/financial-metrics/snapshot/",
            Capability::FinancialMetrics => "/financial-metrics/",
            Capability::News => "/news/",
            Capability::AnalystEstimates => "/analyst-estimates/",
            Capability::InsiderTrades => "/insider-trades/",
            Capability::Filings => "/filings/",
            Capability::SegmentedRevenues => "/financials/segmented-revenues/",
        }
    }

    /// Request URL; credentials travel in a header, so this doubles as the source descriptor.
    pub fn request_url(&self, capability: Capability, args: &Value) -> Result<Url> {
        let url = format!("{}{}", self.base_url, Self::endpoint(capability));
        Url::parse_with_params(&url, query_pairs(capability, args))
            .map_err(|e| ResearchError::Config(format!("invalid provider url '{}': {}", url, e)))
    }
}

fn query_pairs(capability: Capability, args: &Value) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    if let Some(map) = args.as_object() {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
            let value = match &map[key] {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            pairs.push((key.clone(), value));
        }
    }

    let has = |pairs: &[(String, String)], key: &str| pairs.iter().any(|(k, _)| k == key);
    if capability == Capability::Prices {
        if !has(&pairs, "interval") {
            pairs.push(("interval".to_string(), "day".to_string()));
        }
        if !has(&pairs, "interval_multiplier") {
            pairs.push(("interval_multiplier".to_string(), "1".to_string()));
        }
    }
    if capability.accepts_period() && !has(&pairs, "period") {
        pairs.push(("period".to_string(), "annual".to_string()));
    }

    pairs
}

/// Maps an HTTP status to the provider error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited { retry_after };
    }
    let mut body = body.to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    ProviderError::Upstream {
        status: status.as_u16(),
        body,
    }
}

fn classify_transport(err: &reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Network(err.to_string())
    }
}

#[async_trait::async_trait]
impl DataProvider for FinancialDatasetsProvider {
    fn name(&self) -> &str {
        "financial-datasets"
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn cost_per_call(&self, _capability: Capability) -> f64 {
        self.cost_per_call
    }

    async fn fetch(
        &self,
        capability: Capability,
        args: &Value,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ProviderError::NotConfigured("FINANCIAL_DATASETS_API_KEY is not set".to_string())
        })?;

        let url = self
            .request_url(capability, args)
            .map_err(|e| ProviderError::InvalidArguments(e.to_string()))?;
        let source = url.to_string();

        debug!(capability = %capability, url = %source, "provider request");

        let response = self
            .client
            .get(url)
            .header("X-API-KEY", api_key)
            .send()
            .await
            .map_err(|e| classify_transport(&e, REQUEST_TIMEOUT))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&e, REQUEST_TIMEOUT))?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &text));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::MalformedResponse(format!("invalid JSON: {}", e)))?;
        if !data.is_object() {
            return Err(ProviderError::MalformedResponse(
                "expected a JSON object".to_string(),
            ));
        }

        Ok(ProviderResponse { data, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureClass;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/financials/income-statements/",
                get(|headers: HeaderMap| async move {
                    if headers.get("X-API-KEY").is_none() {
                        return (AxumStatus::UNAUTHORIZED, "missing key".to_string());
                    }
                    (
                        AxumStatus::OK,
                        json!({"income_statements": [{"ticker": "AAPL", "revenue": 1}]})
                            .to_string(),
                    )
                }),
            )
            .route(
                "/news/",
                get(|| async {
                    (
                        AxumStatus::TOO_MANY_REQUESTS,
                        [("Retry-After", "3")],
                        "slow down",
                    )
                }),
            )
            .route(
                "/filings/",
                get(|| async { (AxumStatus::BAD_GATEWAY, "upstream down") }),
            )
            .route("/prices/snapshot/", get(|| async { "<html>" }))
    }

    #[test]
    fn test_request_url_carries_args_and_defaults() {
        let provider =
            FinancialDatasetsProvider::new("https://api.example.test/", Some("secret".into()), 0.01)
                .unwrap();
        let url = provider
            .request_url(
                Capability::IncomeStatements,
                &json!({"ticker": "AAPL", "limit": 4}),
            )
            .unwrap()
            .to_string();

        assert!(url.starts_with("https://api.example.test/financials/income-statements/?"));
        assert!(url.contains("ticker=AAPL"));
        assert!(url.contains("limit=4"));
        assert!(url.contains("period=annual"));
        assert!(!url.contains("secret"));
    }

    #[tokio::test]
    async fn test_http_outcomes_are_classified() {
        let base = serve(test_router()).await;
        let provider = FinancialDatasetsProvider::new(&base, Some("k".into()), 0.01).unwrap();
        let args = json!({"ticker": "AAPL"});

        let ok = provider
            .fetch(Capability::IncomeStatements, &args)
            .await
            .unwrap();
        assert_eq!(ok.data["income_statements"][0]["ticker"], "AAPL");
        assert!(ok.source.contains("/financials/income-statements/"));

        let limited = provider.fetch(Capability::News, &args).await.unwrap_err();
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(limited.class(), FailureClass::Transient);

        let upstream = provider.fetch(Capability::Filings, &args).await.unwrap_err();
        assert!(matches!(upstream, ProviderError::Upstream { status: 502, .. }));
        assert!(upstream.is_transient());

        let malformed = provider
            .fetch(Capability::PriceSnapshot, &args)
            .await
            .unwrap_err();
        assert!(matches!(malformed, ProviderError::MalformedResponse(_)));
        assert_eq!(malformed.class(), FailureClass::Permanent);

        let missing = provider.fetch(Capability::Prices, &args).await.unwrap_err();
        assert_eq!(missing.class(), FailureClass::Permanent);
    }

    #[tokio::test]
    async fn test_missing_key_is_permanent() {
        let provider = FinancialDatasetsProvider::new("http://127.0.0.1:9", None, 0.01).unwrap();
        let err = provider
            .fetch(Capability::News, &json!({"ticker": "AAPL"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(!err.is_transient());
    }
}
