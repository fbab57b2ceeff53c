//! Final answer synthesis
//!
//! A composer writes the body; the synthesizer wraps it with the partial-data
//! banner, the limitations section and the source list, persists it, and
//! closes the session.

use crate::llm::LanguageModel;
use crate::models::{
    Capability, Citation, FinalAnswer, HistoryEntry, LoopRecord, MessageRole, ResearchArtifact,
    SessionStatus, StopReason, TaskOutcome, Verdict,
};
use crate::store::SessionStore;
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_PAYLOAD_CHARS: usize = 4000;

/// Fields worth surfacing first when summarizing a record.
const KEY_FIELDS: &[&str] = &[
    "report_period",
    "revenue",
    "net_income",
    "gross_profit",
    "operating_income",
    "earnings_per_share",
    "total_assets",
    "total_liabilities",
    "shareholders_equity",
    "free_cash_flow",
    "net_cash_flow_from_operations",
    "price",
    "close",
    "market_cap",
    "price_to_earnings_ratio",
    "segment",
    "transaction_shares",
];

/// One gathered artifact as the composer sees it.
#[derive(Debug, Clone)]
pub struct Evidence<'a> {
    pub artifact: &'a ResearchArtifact,
    /// 1-based index into the citation list.
    pub citation: usize,
    pub verdict: Option<&'a Verdict>,
}

impl Evidence<'_> {
    pub fn is_usable(&self) -> bool {
        self.verdict.map_or(true, Verdict::is_satisfied)
    }
}

/// Writes the answer body from the gathered evidence.
#[async_trait]
pub trait AnswerComposer: Send + Sync {
    fn name(&self) -> &str;

    async fn compose(&self, query: &str, evidence: &[Evidence<'_>]) -> Result<String>;
}

//
// ================= Template composer =================
//

/// Deterministic per-artifact digest.
pub struct TemplateComposer;

impl TemplateComposer {
    pub fn render(query: &str, evidence: &[Evidence<'_>]) -> String {
        let lines: Vec<String> = evidence
            .iter()
            .filter(|e| e.is_usable())
            .map(|e| {
                format!(
                    "- {}: {} [{}]",
                    artifact_label(e.artifact),
                    summarize_payload(e.artifact.capability, &e.artifact.payload),
                    e.citation
                )
            })
            .collect();

        if lines.is_empty() {
            return format!("No usable data was gathered for \"{}\".", query);
        }

        format!("Findings for \"{}\":\n{}", query, lines.join("\n"))
    }
}

#[async_trait]
impl AnswerComposer for TemplateComposer {
    fn name(&self) -> &str {
        "template"
    }

    async fn compose(&self, query: &str, evidence: &[Evidence<'_>]) -> Result<String> {
        Ok(Self::render(query, evidence))
    }
}

fn artifact_label(artifact: &ResearchArtifact) -> String {
    let mut parts = Vec::new();
    for key in ["ticker", "period"] {
        if let Some(value) = artifact.args.get(key).and_then(Value::as_str) {
            parts.push(value.to_string());
        }
    }
    format!("{}({})", artifact.capability, parts.join(", "))
}

fn summarize_payload(capability: Capability, payload: &Value) -> String {
    match payload.get(capability.payload_field()) {
        Some(Value::Array(rows)) if rows.is_empty() => "no rows".to_string(),
        Some(Value::Array(rows)) => {
            let titles: Vec<&str> = rows
                .iter()
                .take(3)
                .filter_map(|r| r.get("title").and_then(Value::as_str))
                .collect();
            if !titles.is_empty() {
                return format!("{} item(s); latest: {}", rows.len(), titles.join(" | "));
            }
            match rows[0].as_object() {
                Some(first) => format!("{} row(s); latest {}", rows.len(), describe_fields(first)),
                None => format!("{} row(s)", rows.len()),
            }
        }
        Some(Value::Object(record)) => describe_fields(record),
        _ => "no data".to_string(),
    }
}

fn describe_fields(record: &Map<String, Value>) -> String {
    let mut picked: Vec<(&str, &Value)> = KEY_FIELDS
        .iter()
        .filter_map(|k| record.get(*k).map(|v| (*k, v)))
        .filter(|(_, v)| is_scalar(v))
        .take(5)
        .collect();

    if picked.is_empty() {
        picked = record
            .iter()
            .filter(|(_, v)| is_scalar(v))
            .map(|(k, v)| (k.as_str(), v))
            .take(4)
            .collect();
    }

    picked
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

//
// ================= Gemini composer =================
//

const COMPOSER_SYSTEM_PROMPT: &str = "You are a financial research analyst. \
Answer the question using only the data provided. Cite every figure with its \
source marker such as [1]. Do not invent figures that are not in the data.";

pub struct GeminiComposer {
    llm: Arc<dyn LanguageModel>,
}

impl GeminiComposer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    fn build_prompt(query: &str, evidence: &[Evidence<'_>]) -> String {
        let mut data = String::new();
        for e in evidence.iter().filter(|e| e.is_usable()) {
            let mut payload = e.artifact.payload.to_string();
            if payload.len() > MAX_PAYLOAD_CHARS {
                let cut = (0..=MAX_PAYLOAD_CHARS)
                    .rev()
                    .find(|i| payload.is_char_boundary(*i))
                    .unwrap_or(0);
                payload.truncate(cut);
                payload.push_str("...");
            }
            data.push_str(&format!("[{}] {}: {}\n", e.citation, artifact_label(e.artifact), payload));
        }

        format!(
            "QUESTION:\n{}\n\nDATA:\n{}\nWrite a concise answer in plain prose.",
            query, data
        )
    }
}

#[async_trait]
impl AnswerComposer for GeminiComposer {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn compose(&self, query: &str, evidence: &[Evidence<'_>]) -> Result<String> {
        if !evidence.iter().any(Evidence::is_usable) {
            return Ok(TemplateComposer::render(query, evidence));
        }
        let answer = self
            .llm
            .complete(COMPOSER_SYSTEM_PROMPT, &Self::build_prompt(query, evidence))
            .await?;
        Ok(answer.trim().to_string())
    }
}

//
// ================= Synthesizer =================
//

pub struct SynthesisRequest<'a> {
    pub session_id: Uuid,
    pub query: &'a str,
    pub history: &'a [HistoryEntry],
    pub outcomes: &'a [TaskOutcome],
    pub stop: StopReason,
    pub steps_used: u32,
}

pub struct Synthesizer {
    store: Arc<dyn SessionStore>,
    composer: Arc<dyn AnswerComposer>,
}

impl Synthesizer {
    pub fn new(store: Arc<dyn SessionStore>, composer: Arc<dyn AnswerComposer>) -> Self {
        Self { store, composer }
    }

    pub fn composer_name(&self) -> &str {
        self.composer.name()
    }

    /// Composes, persists and closes. Cancelled sessions stay active.
    pub async fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<FinalAnswer> {
        let artifacts: Vec<&ResearchArtifact> = request
            .history
            .iter()
            .filter_map(HistoryEntry::as_artifact)
            .collect();

        let citations = build_citations(&artifacts);
        let index_of: HashMap<&str, usize> = citations
            .iter()
            .map(|c| (c.source.as_str(), c.index))
            .collect();

        let verdicts: HashMap<Uuid, &Verdict> = request
            .outcomes
            .iter()
            .filter_map(|o| o.artifact_id.map(|id| (id, &o.verdict)))
            .collect();

        let evidence: Vec<Evidence<'_>> = artifacts
            .iter()
            .map(|a| Evidence {
                artifact: a,
                citation: index_of.get(a.source.as_str()).copied().unwrap_or(0),
                verdict: verdicts.get(&a.id).copied(),
            })
            .collect();

        let body = match self.composer.compose(request.query, &evidence).await {
            Ok(body) if !body.trim().is_empty() => body,
            Ok(_) => TemplateComposer::render(request.query, &evidence),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    session_id = %request.session_id,
                    composer = self.composer.name(),
                    error = %e,
                    "composer failed; using template"
                );
                TemplateComposer::render(request.query, &evidence)
            }
        };

        let partial = request.stop.is_partial();
        let mut sections = Vec::new();
        if let Some(banner) = banner(request.stop) {
            sections.push(banner.to_string());
        }
        sections.push(body);

        let gaps = limitations(request.outcomes);
        if !gaps.is_empty() {
            sections.push(format!("Limitations:\n- {}", gaps.join("\n- ")));
        }

        if !citations.is_empty() {
            let sources: Vec<String> = citations
                .iter()
                .map(|c| {
                    let caps: Vec<&str> = c.capabilities.iter().map(Capability::as_str).collect();
                    format!("[{}] {} ({})", c.index, c.source, caps.join(", "))
                })
                .collect();
            sections.push(format!("Sources:\n{}", sources.join("\n")));
        }

        let text = sections.join("\n\n");

        self.store
            .append_message(request.session_id, MessageRole::Assistant, &text)
            .await?;

        if request.stop == StopReason::Cancelled {
            let record = LoopRecord::Interrupted {
                steps_used: request.steps_used,
            };
            self.store
                .append_message_with_metadata(
                    request.session_id,
                    MessageRole::System,
                    &format!(
                        "Research interrupted after {} step(s); resume to continue",
                        request.steps_used
                    ),
                    Some(serde_json::to_value(&record)?),
                )
                .await?;
        } else {
            self.store
                .update_status(request.session_id, SessionStatus::Completed)
                .await?;
        }

        info!(
            session_id = %request.session_id,
            stop = ?request.stop,
            citations = citations.len(),
            partial,
            "answer synthesized"
        );

        Ok(FinalAnswer {
            text,
            citations,
            partial,
        })
    }

    /// Records an aborted run and marks the session as errored.
    pub async fn close_aborted(&self, session_id: Uuid, reason: &str) -> Result<String> {
        let text = format!("Research stopped without a complete answer: {}.", reason);

        self.store
            .append_message(session_id, MessageRole::Assistant, &text)
            .await?;
        let record = LoopRecord::Aborted {
            reason: reason.to_string(),
        };
        self.store
            .append_message_with_metadata(
                session_id,
                MessageRole::System,
                &format!("Loop aborted: {}", reason),
                Some(serde_json::to_value(&record)?),
            )
            .await?;
        self.store
            .update_status(session_id, SessionStatus::Error)
            .await?;

        warn!(session_id = %session_id, reason, "session aborted");
        Ok(text)
    }
}

fn banner(stop: StopReason) -> Option<&'static str> {
    match stop {
        StopReason::Completed | StopReason::PlanExhausted => None,
        StopReason::BudgetExhausted => Some(
            "Partial answer: the research budget ran out before every task finished, \
so this answer is based on incomplete data.",
        ),
        StopReason::Stalled => Some(
            "Partial answer: research kept repeating requests without progress, \
so this answer is based on incomplete data.",
        ),
        StopReason::Cancelled => Some(
            "Partial answer: research was interrupted, so this answer is based on \
incomplete data. Resume the session to continue.",
        ),
    }
}

/// One citation per distinct source, in first-seen order.
fn build_citations(artifacts: &[&ResearchArtifact]) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();

    for artifact in artifacts {
        match citations.iter_mut().find(|c| c.source == artifact.source) {
            Some(existing) => {
                if !existing.capabilities.contains(&artifact.capability) {
                    existing.capabilities.push(artifact.capability);
                }
            }
            None => citations.push(Citation {
                index: citations.len() + 1,
                source: artifact.source.clone(),
                capabilities: vec![artifact.capability],
            }),
        }
    }

    citations
}

/// Latest unresolved reason per (capability, ticker) that never got covered.
fn limitations(outcomes: &[TaskOutcome]) -> Vec<String> {
    let key = |o: &TaskOutcome| (o.task.capability, o.task.ticker().unwrap_or_default().to_string());

    let covered: HashSet<(Capability, String)> = outcomes
        .iter()
        .filter(|o| o.verdict.is_satisfied())
        .map(key)
        .collect();

    let mut seen = HashSet::new();
    let mut notes = Vec::new();
    for outcome in outcomes.iter().rev() {
        let k = key(outcome);
        if covered.contains(&k) || !seen.insert(k) {
            continue;
        }
        if let Some(reason) = outcome.verdict.reason() {
            notes.push(format!("{}: {}", outcome.task.label(), reason));
        }
    }
    notes.reverse();
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureClass, NewArtifact, Task};
    use crate::store::InMemorySessionStore;
    use crate::testing::ScriptedLlm;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        session_id: Uuid,
        history: Vec<HistoryEntry>,
        outcomes: Vec<TaskOutcome>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let session_id = store.create_session("Apple revenue and insider trades").await.unwrap().id;

        let income = Task::new(
            Capability::IncomeStatements,
            json!({"ticker": "AAPL", "period": "annual", "limit": 4}),
        );
        let artifact = store
            .append_artifact(
                session_id,
                NewArtifact {
                    capability: income.capability,
                    args: income.args.clone(),
                    digest: income.digest.clone(),
                    payload: json!({"income_statements": [
                        {"report_period": "2024-09-28", "revenue": 391035000000u64, "net_income": 93736000000u64}
                    ]}),
                    source: "https://api.financialdatasets.ai/financials/income-statements".into(),
                    cost_usd: 0.01,
                    from_cache: false,
                },
            )
            .await
            .unwrap();

        let insider = Task::new(Capability::InsiderTrades, json!({"ticker": "AAPL", "limit": 10}));
        let outcomes = vec![
            TaskOutcome {
                task: income,
                verdict: Verdict::Satisfied,
                failure: None,
                artifact_id: Some(artifact.id),
            },
            TaskOutcome {
                task: insider,
                verdict: Verdict::Error("no registered provider supports 'insider-trades'".into()),
                failure: Some(FailureClass::Permanent),
                artifact_id: None,
            },
        ];

        let history = store.load_history(session_id).await.unwrap();
        Fixture {
            store,
            session_id,
            history,
            outcomes,
        }
    }

    fn request<'a>(f: &'a Fixture, stop: StopReason) -> SynthesisRequest<'a> {
        SynthesisRequest {
            session_id: f.session_id,
            query: "Apple revenue and insider trades",
            history: &f.history,
            outcomes: &f.outcomes,
            stop,
            steps_used: 2,
        }
    }

    #[tokio::test]
    async fn test_template_answer_cites_and_notes_limitations() {
        let f = fixture().await;
        let synthesizer = Synthesizer::new(f.store.clone(), Arc::new(TemplateComposer));

        let answer = synthesizer
            .synthesize(request(&f, StopReason::PlanExhausted))
            .await
            .unwrap();

        assert!(!answer.partial);
        assert_eq!(answer.citations.len(), 1);
        assert!(answer.text.contains("revenue=391035000000, net_income=93736000000 [1]"));
        assert!(answer.text.contains("[1] https://api.financialdatasets.ai/financials/income-statements"));
        assert!(answer.text.contains("Limitations:\n- insider-trades(AAPL)"));

        let session = f.store.get_session(f.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_stalled_answer_is_flagged_partial() {
        let f = fixture().await;
        let synthesizer = Synthesizer::new(f.store.clone(), Arc::new(TemplateComposer));

        let answer = synthesizer.synthesize(request(&f, StopReason::Stalled)).await.unwrap();
        assert!(answer.partial);
        assert!(answer.text.starts_with("Partial answer"));
        assert!(answer.text.contains("incomplete data"));
    }

    #[tokio::test]
    async fn test_cancelled_keeps_session_active() {
        let f = fixture().await;
        let synthesizer = Synthesizer::new(f.store.clone(), Arc::new(TemplateComposer));

        synthesizer.synthesize(request(&f, StopReason::Cancelled)).await.unwrap();

        let session = f.store.get_session(f.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let history = f.store.load_history(f.session_id).await.unwrap();
        let last = history.last().unwrap().as_message().unwrap();
        let record: LoopRecord = serde_json::from_value(last.metadata.clone().unwrap()).unwrap();
        assert_eq!(record, LoopRecord::Interrupted { steps_used: 2 });
    }

    #[tokio::test]
    async fn test_llm_composer_falls_back_to_template() {
        let f = fixture().await;
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("Apple earned $391B in revenue [1].".to_string()),
            Err("quota exceeded".to_string()),
        ]));
        let synthesizer = Synthesizer::new(f.store.clone(), Arc::new(GeminiComposer::new(llm.clone())));

        let prose = synthesizer.synthesize(request(&f, StopReason::Completed)).await.unwrap();
        assert!(prose.text.starts_with("Apple earned $391B"));
        assert!(llm.prompts()[0].contains("[1] income-statements(AAPL, annual)"));

        let fallback = synthesizer.synthesize(request(&f, StopReason::Completed)).await.unwrap();
        assert!(fallback.text.starts_with("Findings for"));
        // the source list is appended regardless of composer
        assert!(fallback.text.contains("Sources:\n[1]"));
    }

    #[tokio::test]
    async fn test_close_aborted_marks_error() {
        let f = fixture().await;
        let synthesizer = Synthesizer::new(f.store.clone(), Arc::new(TemplateComposer));

        let text = synthesizer
            .close_aborted(f.session_id, "could not identify a company")
            .await
            .unwrap();
        assert!(text.contains("stopped without a complete answer"));

        let session = f.store.get_session(f.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
    }

    #[test]
    fn test_citations_group_by_source() {
        let a = |cap: Capability, source: &str| ResearchArtifact {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            seq: 0,
            capability: cap,
            args: json!({}),
            digest: String::new(),
            payload: json!({}),
            source: source.to_string(),
            cost_usd: 0.0,
            from_cache: false,
            timestamp: chrono::Utc::now(),
        };
        let first = a(Capability::News, "s1");
        let second = a(Capability::Filings, "s2");
        let third = a(Capability::Prices, "s1");

        let citations = build_citations(&[&first, &second, &third]);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].capabilities, vec![Capability::News, Capability::Prices]);
        assert_eq!(citations[1].index, 2);
    }
}
