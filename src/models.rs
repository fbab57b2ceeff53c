//! Core data models for the research loop

use crate::digest::task_digest;
use crate::error::ResearchError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//
// ================= Session =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            other => Err(ResearchError::Persistence(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// UUIDv7: sorts by creation time.
    pub id: Uuid,
    pub query: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//
// ================= History =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(ResearchError::Persistence(format!(
                "unknown message role '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Per-session sequence shared with artifacts; breaks timestamp ties.
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchArtifact {
    pub id: Uuid,
    pub session_id: Uuid,
    pub seq: u64,
    pub capability: Capability,
    pub args: Value,
    pub digest: String,
    pub payload: Value,
    pub source: String,
    pub cost_usd: f64,
    pub from_cache: bool,
    pub timestamp: DateTime<Utc>,
}

/// Artifact fields supplied by the writer; the store assigns id, seq and timestamp.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub capability: Capability,
    pub args: Value,
    pub digest: String,
    pub payload: Value,
    pub source: String,
    pub cost_usd: f64,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    Message(Message),
    Artifact(ResearchArtifact),
}

impl HistoryEntry {
    pub fn seq(&self) -> u64 {
        match self {
            HistoryEntry::Message(m) => m.seq,
            HistoryEntry::Artifact(a) => a.seq,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HistoryEntry::Message(m) => m.timestamp,
            HistoryEntry::Artifact(a) => a.timestamp,
        }
    }

    pub fn as_artifact(&self) -> Option<&ResearchArtifact> {
        match self {
            HistoryEntry::Artifact(a) => Some(a),
            HistoryEntry::Message(_) => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            HistoryEntry::Message(m) => Some(m),
            HistoryEntry::Artifact(_) => None,
        }
    }
}

/// Structured record stored in a system message's metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopRecord {
    DispatchFailed(FailedDispatch),
    Interrupted { steps_used: u32 },
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedDispatch {
    pub capability: Capability,
    pub args: Value,
    pub digest: String,
    pub class: FailureClass,
    pub reason: String,
    pub attempts: u32,
    pub cost_usd: f64,
}

//
// ================= Capabilities =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    IncomeStatements,
    BalanceSheets,
    CashFlowStatements,
    PriceSnapshot,
    Prices,
    FinancialMetricsSnapshot,
    FinancialMetrics,
    News,
    AnalystEstimates,
    InsiderTrades,
    Filings,
    SegmentedRevenues,
}

impl Capability {
    pub const ALL: [Capability; 12] = [
        Capability::IncomeStatements,
        Capability::BalanceSheets,
        Capability::CashFlowStatements,
        Capability::PriceSnapshot,
        Capability::Prices,
        Capability::FinancialMetricsSnapshot,
        Capability::FinancialMetrics,
        Capability::News,
        Capability::AnalystEstimates,
        Capability::InsiderTrades,
        Capability::Filings,
        Capability::SegmentedRevenues,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::IncomeStatements => "income-statements",
            Capability::BalanceSheets => "balance-sheets",
            Capability::CashFlowStatements => "cash-flow-statements",
            Capability::PriceSnapshot => "price-snapshot",
            Capability::Prices => "prices",
            Capability::FinancialMetricsSnapshot => "financial-metrics-snapshot",
            Capability::FinancialMetrics => "financial-metrics",
            Capability::News => "news",
            Capability::AnalystEstimates => "analyst-estimates",
            Capability::InsiderTrades => "insider-trades",
            Capability::Filings => "filings",
            Capability::SegmentedRevenues => "segmented-revenues",
        }
    }

    /// Top-level field a provider response must carry for this capability.
    pub fn payload_field(&self) -> &'static str {
        match self {
            Capability::IncomeStatements => "income_statements",
            Capability::BalanceSheets => "balance_sheets",
            Capability::CashFlowStatements => "cash_flow_statements",
            Capability::PriceSnapshot => "snapshot",
            Capability::Prices => "prices",
            Capability::FinancialMetricsSnapshot => "snapshot",
            Capability::FinancialMetrics => "financial_metrics",
            Capability::News => "news",
            Capability::AnalystEstimates => "analyst_estimates",
            Capability::InsiderTrades => "insider_trades",
            Capability::Filings => "filings",
            Capability::SegmentedRevenues => "segmented_revenues",
        }
    }

    /// Snapshots are single records; everything else is a row collection.
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            Capability::PriceSnapshot | Capability::FinancialMetricsSnapshot
        )
    }

    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            Capability::News
                | Capability::AnalystEstimates
                | Capability::InsiderTrades
                | Capability::Filings
                | Capability::SegmentedRevenues
        )
    }

    /// Closest substitute when a provider set lacks this capability.
    pub fn fallback(&self) -> Option<Capability> {
        match self {
            Capability::SegmentedRevenues => Some(Capability::IncomeStatements),
            Capability::AnalystEstimates => Some(Capability::FinancialMetricsSnapshot),
            Capability::Filings => Some(Capability::News),
            Capability::FinancialMetrics => Some(Capability::FinancialMetricsSnapshot),
            Capability::Prices => Some(Capability::PriceSnapshot),
            _ => None,
        }
    }

    pub fn accepts_period(&self) -> bool {
        matches!(
            self,
            Capability::IncomeStatements
                | Capability::BalanceSheets
                | Capability::CashFlowStatements
                | Capability::FinancialMetrics
                | Capability::AnalystEstimates
                | Capability::SegmentedRevenues
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Capability::ALL
            .iter()
            .find(|c| c.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// Capability descriptor, computed once when a provider registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Capability::ALL.iter().copied().collect()
    }

    /// Every non-optional capability.
    pub fn core() -> Self {
        Capability::ALL
            .iter()
            .copied()
            .filter(|c| !c.is_optional())
            .collect()
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.0.remove(&capability);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn extend(&mut self, other: &CapabilitySet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

//
// ================= Plan =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Satisfied,
    Insufficient,
    Failed,
}

impl TaskStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Satisfied | TaskStatus::Insufficient | TaskStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub capability: Capability,
    pub args: Value,
    pub depends_on: Vec<Uuid>,
    pub status: TaskStatus,
    /// Digest of capability + canonical args; shared key for cache and loop detector.
    pub digest: String,
}

impl Task {
    pub fn new(capability: Capability, args: Value) -> Self {
        let digest = task_digest(capability.as_str(), &args);
        Self {
            id: Uuid::new_v4(),
            capability,
            args,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            digest,
        }
    }

    pub fn after(mut self, dependency: &Task) -> Self {
        if !self.depends_on.contains(&dependency.id) {
            self.depends_on.push(dependency.id);
        }
        self
    }

    pub fn ticker(&self) -> Option<&str> {
        self.args.get("ticker").and_then(Value::as_str)
    }

    pub fn period(&self) -> Option<&str> {
        self.args.get("period").and_then(Value::as_str)
    }

    /// Short human label, e.g. `income-statements(AAPL, quarterly)`.
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ticker) = self.ticker() {
            parts.push(ticker.to_string());
        }
        if let Some(period) = self.period() {
            parts.push(period.to_string());
        }
        format!("{}({})", self.capability, parts.join(", "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub version: u32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Builds a plan ordered by dependency, then declaration order.
    ///
    /// Unknown dependency ids and cycles are rejected.
    pub fn new(version: u32, tasks: Vec<Task>) -> Result<Self> {
        let known: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();

        for task in &tasks {
            if let Some(missing) = task.depends_on.iter().find(|d| !known.contains(d)) {
                return Err(ResearchError::InvalidPlan(format!(
                    "task {} depends on unknown task {}",
                    task.label(),
                    missing
                )));
            }
        }

        let mut remaining = tasks;
        let mut ordered: Vec<Task> = Vec::with_capacity(remaining.len());
        let mut placed: HashSet<Uuid> = HashSet::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|t| t.depends_on.iter().all(|d| placed.contains(d)));

            match next {
                Some(index) => {
                    let task = remaining.remove(index);
                    placed.insert(task.id);
                    ordered.push(task);
                }
                None => {
                    let labels: Vec<String> = remaining.iter().map(Task::label).collect();
                    return Err(ResearchError::InvalidPlan(format!(
                        "dependency cycle among: {}",
                        labels.join(", ")
                    )));
                }
            }
        }

        Ok(Self {
            plan_id: Uuid::new_v4(),
            version,
            tasks: ordered,
            rationale: None,
            created_at: Utc::now(),
        })
    }

    pub fn empty(version: u32) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            version,
            tasks: Vec::new(),
            rationale: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn set_status(&mut self, id: Uuid, status: TaskStatus) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            task.status = status;
        }
    }

    /// Pending tasks whose dependencies are all satisfied, in plan order.
    pub fn ready_tasks(&self) -> Vec<Task> {
        let statuses: HashMap<Uuid, TaskStatus> =
            self.tasks.iter().map(|t| (t.id, t.status)).collect();

        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|d| statuses.get(d) == Some(&TaskStatus::Satisfied))
            })
            .cloned()
            .collect()
    }

    /// Fails pending tasks whose dependencies can no longer be satisfied.
    pub fn fail_unreachable(&mut self) -> Vec<Task> {
        let mut failed = Vec::new();

        loop {
            let statuses: HashMap<Uuid, TaskStatus> =
                self.tasks.iter().map(|t| (t.id, t.status)).collect();

            let blocked: Vec<Uuid> = self
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .filter(|t| {
                    t.depends_on.iter().any(|d| {
                        matches!(
                            statuses.get(d),
                            Some(TaskStatus::Insufficient) | Some(TaskStatus::Failed)
                        )
                    })
                })
                .map(|t| t.id)
                .collect();

            if blocked.is_empty() {
                return failed;
            }

            for id in blocked {
                self.set_status(id, TaskStatus::Failed);
                if let Some(task) = self.get(id) {
                    failed.push(task.clone());
                }
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Pending)
    }

    pub fn all_satisfied(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Satisfied)
    }
}

//
// ================= Budget =================
//

const COST_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    pub steps_used: u32,
    pub max_steps: u32,
    pub cost_used_usd: f64,
    pub max_cost_usd: f64,
}

impl Budget {
    pub fn new(max_steps: u32, max_cost_usd: f64) -> Self {
        Self {
            steps_used: 0,
            max_steps,
            cost_used_usd: 0.0,
            max_cost_usd,
        }
    }

    pub fn remaining_steps(&self) -> u32 {
        self.max_steps.saturating_sub(self.steps_used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.steps_used >= self.max_steps || self.cost_used_usd > self.max_cost_usd + COST_EPSILON
    }

    /// Whether one more dispatch fits after `queued` dispatches costing `queued_cost`.
    pub fn admits(&self, queued: u32, queued_cost: f64, next_cost: f64) -> bool {
        self.steps_used.saturating_add(queued) < self.max_steps
            && self.cost_used_usd + queued_cost + next_cost <= self.max_cost_usd + COST_EPSILON
    }

    /// Every dispatch costs one step regardless of outcome.
    pub fn charge(&mut self, cost_usd: f64) {
        self.steps_used = self.steps_used.saturating_add(1);
        self.cost_used_usd += cost_usd.max(0.0);
    }
}

//
// ================= Verdicts =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Satisfied,
    InsufficientData(String),
    Error(String),
}

impl Verdict {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Verdict::Satisfied)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Satisfied => None,
            Verdict::InsufficientData(reason) | Verdict::Error(reason) => Some(reason),
        }
    }

    pub fn task_status(&self) -> TaskStatus {
        match self {
            Verdict::Satisfied => TaskStatus::Satisfied,
            Verdict::InsufficientData(_) => TaskStatus::Insufficient,
            Verdict::Error(_) => TaskStatus::Failed,
        }
    }
}

/// Settled result of one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub task: Task,
    pub verdict: Verdict,
    #[serde(default)]
    pub failure: Option<FailureClass>,
    #[serde(default)]
    pub artifact_id: Option<Uuid>,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    PlanExhausted,
    BudgetExhausted,
    Stalled,
    Cancelled,
}

impl StopReason {
    pub fn is_partial(&self) -> bool {
        !matches!(self, StopReason::Completed | StopReason::PlanExhausted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum Termination {
    Done(StopReason),
    Aborted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub index: usize,
    pub source: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub termination: Termination,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub partial: bool,
    pub budget: Budget,
    pub plan_version: u32,
    pub reasoning_trace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_round_trip_names() {
        for capability in Capability::ALL {
            let parsed: Capability = capability.as_str().parse().unwrap();
            assert_eq!(parsed, capability);
        }
        assert_eq!(
            "income_statements".parse::<Capability>().unwrap(),
            Capability::IncomeStatements
        );
        assert!("dividends".parse::<Capability>().is_err());
    }

    #[test]
    fn test_core_set_excludes_optional_capabilities() {
        let core = CapabilitySet::core();
        assert!(core.contains(Capability::IncomeStatements));
        assert!(!core.contains(Capability::InsiderTrades));
        assert_eq!(core.len(), 7);
    }

    #[test]
    fn test_plan_orders_dependencies_before_dependents() {
        let income = Task::new(Capability::IncomeStatements, json!({"ticker": "AAPL"}));
        let segments =
            Task::new(Capability::SegmentedRevenues, json!({"ticker": "AAPL"})).after(&income);
        let news = Task::new(Capability::News, json!({"ticker": "AAPL"}));

        let plan = Plan::new(1, vec![segments.clone(), news.clone(), income.clone()]).unwrap();
        let order: Vec<Uuid> = plan.tasks.iter().map(|t| t.id).collect();

        // news has no dependency and is declared before income, so it keeps its slot
        assert_eq!(order, vec![news.id, income.id, segments.id]);
    }

    #[test]
    fn test_plan_rejects_cycles_and_unknown_dependencies() {
        let mut a = Task::new(Capability::News, json!({"ticker": "A"}));
        let b = Task::new(Capability::Prices, json!({"ticker": "B"})).after(&a);
        a.depends_on.push(b.id);
        assert!(matches!(
            Plan::new(1, vec![a, b]),
            Err(ResearchError::InvalidPlan(_))
        ));

        let mut orphan = Task::new(Capability::News, json!({"ticker": "C"}));
        orphan.depends_on.push(Uuid::new_v4());
        assert!(Plan::new(1, vec![orphan]).is_err());
    }

    #[test]
    fn test_ready_tasks_wait_for_satisfied_dependencies() {
        let income = Task::new(Capability::IncomeStatements, json!({"ticker": "AAPL"}));
        let segments =
            Task::new(Capability::SegmentedRevenues, json!({"ticker": "AAPL"})).after(&income);
        let mut plan = Plan::new(1, vec![income.clone(), segments.clone()]).unwrap();

        let ready: Vec<Uuid> = plan.ready_tasks().iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![income.id]);

        plan.set_status(income.id, TaskStatus::Insufficient);
        let failed = plan.fail_unreachable();
        assert_eq!(failed.len(), 1);
        assert_eq!(plan.get(segments.id).unwrap().status, TaskStatus::Failed);
        assert!(plan.ready_tasks().is_empty());
    }

    #[test]
    fn test_budget_admission_and_exhaustion() {
        let mut budget = Budget::new(3, 0.05);
        assert!(budget.admits(0, 0.0, 0.02));
        assert!(budget.admits(1, 0.02, 0.02));
        assert!(!budget.admits(2, 0.04, 0.02));

        budget.charge(0.02);
        budget.charge(0.02);
        assert!(!budget.is_exhausted());
        budget.charge(0.0);
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining_steps(), 0);
    }

    #[test]
    fn test_loop_record_serialization_is_tagged() {
        let record = LoopRecord::Interrupted { steps_used: 2 };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "interrupted");
        let back: LoopRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
