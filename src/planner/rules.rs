//! Deterministic intent-routing planner
//!
//! Routes a query to capabilities by keyword, one task per ticker and
//! capability. Re-planning walks each (capability, ticker) group forward:
//! keep what is outstanding, widen what came back thin, substitute what the
//! provider set cannot serve, and give up on the rest.

use super::{Planner, PlanningContext};
use crate::error::ResearchError;
use crate::models::{Capability, FailureClass, Plan, Task, Verdict};
use crate::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

const STATEMENT_LIMIT: u64 = 4;
const LIST_LIMIT: u64 = 10;
const MAX_LIMIT: u64 = 20;

const COMPANIES: &[(&str, &str)] = &[
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("alphabet", "GOOGL"),
    ("google", "GOOGL"),
    ("amazon", "AMZN"),
    ("meta", "META"),
    ("facebook", "META"),
    ("nvidia", "NVDA"),
    ("tesla", "TSLA"),
    ("netflix", "NFLX"),
    ("intel", "INTC"),
    ("amd", "AMD"),
    ("oracle", "ORCL"),
    ("salesforce", "CRM"),
    ("adobe", "ADBE"),
    ("ibm", "IBM"),
    ("berkshire", "BRK.B"),
    ("jpmorgan", "JPM"),
    ("walmart", "WMT"),
    ("disney", "DIS"),
    ("coca-cola", "KO"),
    ("visa", "V"),
];

/// Upper-case tokens that look like tickers but never are.
const NOT_TICKERS: &[&str] = &[
    "A", "I", "AI", "AND", "OR", "THE", "FOR", "OF", "IN", "ON", "VS", "US", "USA", "USD", "CEO",
    "CFO", "EPS", "TTM", "FY", "YOY", "QOQ", "SEC", "GAAP", "PE", "ETF", "IPO", "EBIT", "EBITDA",
    "FCF", "ROE", "ROA", "R&D", "Q1", "Q2", "Q3", "Q4", "WHAT", "HOW", "IS", "WAS", "ARE",
];

const KEYWORDS: &[(Capability, &[&str])] = &[
    (
        Capability::IncomeStatements,
        &["revenue", "sales", "income", "earnings", "profit", "margin", "eps", "net loss"],
    ),
    (
        Capability::BalanceSheets,
        &["balance sheet", "debt", "assets", "liabilities", "equity", "cash position"],
    ),
    (
        Capability::CashFlowStatements,
        &["cash flow", "free cash", "fcf", "capex", "capital expenditure", "buyback"],
    ),
    (
        Capability::Prices,
        &["price history", "performance", "chart", "over the last", "past year", "returns"],
    ),
    (
        Capability::PriceSnapshot,
        &["stock price", "share price", "price", "quote", "trading at"],
    ),
    (
        Capability::FinancialMetrics,
        &["historical metrics", "ratios over", "metrics over", "margin trend"],
    ),
    (
        Capability::FinancialMetricsSnapshot,
        &["valuation", "p/e", "pe ratio", "ratio", "metrics", "market cap", "multiple"],
    ),
    (Capability::News, &["news", "headline", "sentiment", "announcement"]),
    (
        Capability::AnalystEstimates,
        &["estimate", "forecast", "analyst", "consensus", "guidance"],
    ),
    (Capability::InsiderTrades, &["insider"]),
    (
        Capability::Filings,
        &["filing", "10-k", "10-q", "8-k", "sec report", "annual report"],
    ),
    (
        Capability::SegmentedRevenues,
        &["segment", "by product", "by region", "breakdown", "business line"],
    ),
];

/// What the query asks for, independent of what has been gathered.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryIntent {
    pub tickers: Vec<String>,
    pub period: Option<&'static str>,
    pub capabilities: Vec<Capability>,
    /// False when no keyword matched and the snapshot defaults were used.
    pub explicit: bool,
}

impl QueryIntent {
    pub fn parse(query: &str) -> Self {
        let lowered = query.to_lowercase();
        let words = words(&lowered);
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| contains_phrase(&words, k));

        let mut capabilities: Vec<Capability> = Vec::new();
        for (capability, keywords) in KEYWORDS {
            if has_any(keywords) && !capabilities.contains(capability) {
                capabilities.push(*capability);
            }
        }
        // a price history request already answers "what is the price"
        if capabilities.contains(&Capability::Prices) {
            capabilities.retain(|c| *c != Capability::PriceSnapshot);
        }

        let explicit = !capabilities.is_empty();
        if !explicit {
            capabilities = vec![
                Capability::PriceSnapshot,
                Capability::FinancialMetricsSnapshot,
            ];
        }

        Self {
            tickers: extract_tickers(query),
            period: extract_period(&lowered),
            capabilities,
            explicit,
        }
    }
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Whole-word phrase match; a trailing "s"/"es" on a query word is tolerated.
fn contains_phrase(query_words: &[&str], phrase: &str) -> bool {
    let keys = words(phrase);
    if keys.is_empty() || keys.len() > query_words.len() {
        return false;
    }
    query_words.windows(keys.len()).any(|window| {
        window.iter().zip(&keys).all(|(word, key)| {
            word == key || word.strip_suffix('s') == Some(*key) || word.strip_suffix("es") == Some(*key)
        })
    })
}

pub fn extract_tickers(query: &str) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    let mut push = |t: &str| {
        if !tickers.iter().any(|x| x == t) {
            tickers.push(t.to_string());
        }
    };

    let separators = |c: char| {
        c.is_whitespace() || matches!(c, ',' | ';' | '?' | '!' | '(' | ')' | '\'' | '"')
    };

    for raw in query.split(separators) {
        let token = raw.trim_matches(|c: char| matches!(c, '.' | ':'));
        if token.is_empty() {
            continue;
        }

        let lowered = token.to_lowercase();
        if let Some((_, ticker)) = COMPANIES.iter().find(|(name, _)| *name == lowered) {
            push(*ticker);
            continue;
        }

        if let Some(symbol) = token.strip_prefix('$') {
            if is_ticker_shaped(symbol) {
                push(&symbol.to_uppercase());
            }
            continue;
        }

        if is_ticker_shaped(token)
            && token.chars().all(|c| !c.is_ascii_lowercase())
            && token.len() >= 2
            && !NOT_TICKERS.contains(&token)
        {
            push(token);
        }
    }

    tickers
}

fn is_ticker_shaped(token: &str) -> bool {
    let (base, class) = match token.split_once('.') {
        Some((base, class)) => (base, Some(class)),
        None => (token, None),
    };
    let base_ok = (1..=5).contains(&base.len()) && base.chars().all(|c| c.is_ascii_alphabetic());
    let class_ok =
        class.map_or(true, |c| c.len() == 1 && c.chars().all(|ch| ch.is_ascii_alphabetic()));
    base_ok && class_ok
}

fn extract_period(lowered: &str) -> Option<&'static str> {
    let words = words(lowered);
    let has = |w: &str| words.contains(&w);

    if ["q1", "q2", "q3", "q4", "quarter", "quarterly", "quarters", "qoq"]
        .iter()
        .any(|w| has(w))
    {
        Some("quarterly")
    } else if has("ttm") || has("trailing") {
        Some("ttm")
    } else if ["annual", "annually", "yearly", "fy", "fiscal", "yoy"]
        .iter()
        .any(|w| has(w))
    {
        Some("annual")
    } else {
        None
    }
}

/// Default arguments for one capability and ticker.
///
/// Price windows end at `as_of`, the session's creation date, so a session
/// plans the same digests on every day it is resumed.
pub fn default_args(
    capability: Capability,
    ticker: &str,
    period: Option<&str>,
    as_of: NaiveDate,
) -> Value {
    let mut args = Map::new();
    args.insert("ticker".to_string(), json!(ticker));

    if capability.accepts_period() {
        args.insert("period".to_string(), json!(period.unwrap_or("annual")));
        args.insert("limit".to_string(), json!(STATEMENT_LIMIT));
    }

    match capability {
        Capability::News | Capability::InsiderTrades | Capability::Filings => {
            args.insert("limit".to_string(), json!(LIST_LIMIT));
        }
        Capability::Prices => {
            let end = as_of;
            let start = end - Duration::days(365);
            args.insert("start_date".to_string(), json!(start.format("%Y-%m-%d").to_string()));
            args.insert("end_date".to_string(), json!(end.format("%Y-%m-%d").to_string()));
        }
        _ => {}
    }

    Value::Object(args)
}

/// Asks for more data: annual instead of quarterly/ttm, then a larger window.
fn widen(task: &Task) -> Option<Value> {
    let mut args = task.args.as_object()?.clone();
    let mut changed = false;

    if let Some(period) = args.get("period").and_then(Value::as_str) {
        if period != "annual" {
            args.insert("period".to_string(), json!("annual"));
            changed = true;
        }
    }

    if let Some(limit) = args.get("limit").and_then(Value::as_u64) {
        let wider = (limit * 2).min(MAX_LIMIT);
        if wider > limit {
            args.insert("limit".to_string(), json!(wider));
            changed = true;
        }
    }

    if task.capability == Capability::Prices {
        if let Some(start) = args
            .get("start_date")
            .and_then(Value::as_str)
            .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        {
            let earlier = start - Duration::days(365);
            args.insert("start_date".to_string(), json!(earlier.format("%Y-%m-%d").to_string()));
            changed = true;
        }
    }

    changed.then_some(Value::Object(args))
}

/// Carries ticker and period over to a substitute capability.
fn substitute_args(substitute: Capability, task: &Task, as_of: NaiveDate) -> Value {
    let ticker = task.ticker().unwrap_or_default();
    default_args(substitute, ticker, task.period(), as_of)
}

pub struct RuleBasedPlanner;

impl RuleBasedPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Tasks the query asks for, before anything has been gathered.
    fn base_tasks(intent: &QueryIntent, as_of: NaiveDate) -> Vec<Task> {
        let mut tasks = Vec::new();

        for ticker in &intent.tickers {
            let mut income: Option<Task> = None;
            let mut per_ticker = Vec::new();

            for capability in &intent.capabilities {
                let task = Task::new(*capability, default_args(*capability, ticker, intent.period, as_of));
                if *capability == Capability::IncomeStatements {
                    income = Some(task.clone());
                }
                per_ticker.push(task);
            }

            // the segment split is read against the consolidated top line
            if let Some(income) = &income {
                for task in per_ticker.iter_mut() {
                    if task.capability == Capability::SegmentedRevenues {
                        let dependent = task.clone().after(income);
                        *task = dependent;
                    }
                }
            }
            tasks.extend(per_ticker);
        }

        tasks
    }

    /// Moves one base task forward given what happened to its group so far.
    fn advance(ctx: &PlanningContext, task: Task, notes: &mut Vec<String>) -> Option<Task> {
        let ticker = task.ticker()?.to_string();

        if ctx.is_covered(task.capability, &ticker) {
            return None;
        }

        if !ctx.capabilities.contains(task.capability) {
            // only worth substituting once the gap is known from a dispatch
            if ctx.latest_outcome(task.capability, &ticker).is_none() && !ctx.is_replan() {
                return Some(task);
            }
            return match task.capability.fallback() {
                Some(sub) if ctx.capabilities.contains(sub) => {
                    if ctx.is_covered(sub, &ticker) {
                        notes.push(format!(
                            "{} unavailable; covered by {}",
                            task.label(),
                            sub
                        ));
                        None
                    } else {
                        notes.push(format!("{} unavailable; substituting {}", task.label(), sub));
                        let mut substitute = Task::new(sub, substitute_args(sub, &task, ctx.as_of));
                        substitute.depends_on = task.depends_on.clone();
                        Some(substitute)
                    }
                }
                _ => {
                    notes.push(format!("{} unavailable from registered providers", task.label()));
                    None
                }
            };
        }

        let latest = match ctx.latest_outcome(task.capability, &ticker) {
            Some(latest) => latest,
            None => return Some(task),
        };

        match &latest.verdict {
            Verdict::Satisfied => None,
            Verdict::InsufficientData(reason) => match widen(&latest.task) {
                Some(args) => {
                    notes.push(format!("{} was thin ({}); widening", latest.task.label(), reason));
                    let mut wider = Task::new(task.capability, args);
                    wider.depends_on = task.depends_on.clone();
                    Some(wider)
                }
                None => {
                    notes.push(format!("{} cannot be widened further", latest.task.label()));
                    None
                }
            },
            Verdict::Error(reason) => {
                if latest.failure == Some(FailureClass::Permanent) {
                    notes.push(format!("{} failed permanently: {}", latest.task.label(), reason));
                    None
                } else {
                    let mut retry = latest.task.clone();
                    retry.id = task.id;
                    retry.status = task.status;
                    retry.depends_on = task.depends_on.clone();
                    Some(retry)
                }
            }
        }
    }
}

impl Default for RuleBasedPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Planner for RuleBasedPlanner {
    fn name(&self) -> &str {
        "rules"
    }

    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan> {
        let intent = QueryIntent::parse(&ctx.query);
        if intent.tickers.is_empty() {
            return Err(ResearchError::PlanningFailed(
                "could not identify a company or ticker in the query".to_string(),
            ));
        }

        let mut notes = Vec::new();
        let mut candidates = Vec::new();
        for task in Self::base_tasks(&intent, ctx.as_of) {
            if let Some(next) = Self::advance(ctx, task, &mut notes) {
                candidates.push(next);
            }
        }

        // dependencies on tasks that advanced away are treated as met
        let ids: HashSet<Uuid> = candidates.iter().map(|t| t.id).collect();
        for task in candidates.iter_mut() {
            task.depends_on.retain(|d| ids.contains(d));
        }

        let (tasks, admission_notes) = ctx.admit(candidates);
        notes.extend(admission_notes);

        debug!(
            session_id = %ctx.session_id,
            version = ctx.version,
            tasks = tasks.len(),
            "rule planner produced plan"
        );

        let mut rationale = format!(
            "{} for {}",
            intent
                .capabilities
                .iter()
                .map(Capability::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            intent.tickers.join(", ")
        );
        if !notes.is_empty() {
            rationale.push_str("; ");
            rationale.push_str(&notes.join("; "));
        }

        Ok(Plan::new(ctx.version, tasks)?.with_rationale(rationale))
    }
}
