//! Planner trait and shared planning context
//!
//! A planner turns the query (plus everything gathered so far) into a
//! versioned plan. Re-planning never mutates a dispatched task: it emits a
//! fresh plan whose tasks pass the admission filter below.

use crate::models::{
    Capability, CapabilitySet, FailureClass, HistoryEntry, Plan, ResearchArtifact, Task,
    TaskOutcome, Verdict,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub mod gemini;
pub mod rules;

pub use gemini::GeminiPlanner;
pub use rules::RuleBasedPlanner;

/// Everything a planner may look at.
#[derive(Debug, Clone)]
pub struct PlanningContext {
    pub session_id: Uuid,
    pub query: String,
    pub history: Vec<HistoryEntry>,
    /// Settled outcomes in dispatch order, replayed ones included.
    pub outcomes: Vec<TaskOutcome>,
    /// Why the previous plan did not finish; `None` on a first plan.
    pub failure_reason: Option<String>,
    /// What the registered providers can serve.
    pub capabilities: CapabilitySet,
    /// Dispatch count per task digest.
    pub attempts: HashMap<String, u32>,
    pub satisfied: HashSet<String>,
    pub retry_ceiling: u32,
    /// Version the new plan must carry.
    pub version: u32,
    /// Anchor for date windows; the session's creation date.
    pub as_of: NaiveDate,
}

impl PlanningContext {
    pub fn new(session_id: Uuid, query: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            session_id,
            query: query.into(),
            history: Vec::new(),
            outcomes: Vec::new(),
            failure_reason: None,
            capabilities,
            attempts: HashMap::new(),
            satisfied: HashSet::new(),
            retry_ceiling: 2,
            version: 1,
            as_of: Utc::now().date_naive(),
        }
    }

    pub fn is_replan(&self) -> bool {
        self.failure_reason.is_some() || !self.outcomes.is_empty()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ResearchArtifact> {
        self.history.iter().filter_map(HistoryEntry::as_artifact)
    }

    pub fn attempts_for(&self, digest: &str) -> u32 {
        self.attempts.get(digest).copied().unwrap_or(0)
    }

    /// Whether a task may appear in a new plan.
    pub fn admits(&self, task: &Task) -> bool {
        !self.satisfied.contains(&task.digest) && self.attempts_for(&task.digest) < self.retry_ceiling
    }

    /// Latest outcome for the same capability and ticker, under any arguments.
    pub fn latest_outcome(&self, capability: Capability, ticker: &str) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .rev()
            .find(|o| o.task.capability == capability && o.task.ticker() == Some(ticker))
    }

    /// True once any variant of `capability` for `ticker` has been satisfied.
    pub fn is_covered(&self, capability: Capability, ticker: &str) -> bool {
        self.outcomes.iter().any(|o| {
            o.verdict.is_satisfied()
                && o.task.capability == capability
                && o.task.ticker() == Some(ticker)
        })
    }

    /// Permanent failures that were not caused by a missing capability.
    pub fn failed_permanently(&self, outcome: &TaskOutcome) -> bool {
        matches!(outcome.verdict, Verdict::Error(_))
            && outcome.failure == Some(FailureClass::Permanent)
    }

    /// Applies the admission filter to a candidate task list.
    ///
    /// Dropped tasks take their dependents with them, except that a task
    /// dropped because it is already satisfied still counts as satisfied.
    /// Duplicate digests collapse onto the first occurrence.
    pub fn admit(&self, tasks: Vec<Task>) -> (Vec<Task>, Vec<String>) {
        let mut kept: Vec<Task> = Vec::with_capacity(tasks.len());
        let mut notes = Vec::new();
        let mut seen: HashMap<String, Uuid> = HashMap::new();
        let mut satisfied_ids: HashSet<Uuid> = HashSet::new();
        let mut rejected_ids: HashSet<Uuid> = HashSet::new();
        let mut alias: HashMap<Uuid, Uuid> = HashMap::new();

        for mut task in tasks {
            if let Some(first) = seen.get(&task.digest) {
                alias.insert(task.id, *first);
                continue;
            }

            if self.satisfied.contains(&task.digest) {
                satisfied_ids.insert(task.id);
                continue;
            }

            task.depends_on = task
                .depends_on
                .iter()
                .map(|d| alias.get(d).copied().unwrap_or(*d))
                .filter(|d| !satisfied_ids.contains(d))
                .collect();

            if task.depends_on.iter().any(|d| rejected_ids.contains(d)) {
                notes.push(format!("{} skipped: a prerequisite was dropped", task.label()));
                rejected_ids.insert(task.id);
                continue;
            }

            if self.attempts_for(&task.digest) >= self.retry_ceiling {
                notes.push(format!(
                    "{} not retried: attempted {} times",
                    task.label(),
                    self.attempts_for(&task.digest)
                ));
                rejected_ids.insert(task.id);
                continue;
            }

            seen.insert(task.digest.clone(), task.id);
            kept.push(task);
        }

        (kept, notes)
    }
}

/// Trait for plan generation
#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// Builds the next plan. An error means no task can be formed for the query.
    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_admission_filter_drops_satisfied_and_ceilinged() {
        let income = Task::new(
            Capability::IncomeStatements,
            json!({"ticker": "AAPL", "period": "quarterly"}),
        );
        let segments =
            Task::new(Capability::SegmentedRevenues, json!({"ticker": "AAPL"})).after(&income);
        let news = Task::new(Capability::News, json!({"ticker": "AAPL"}));
        let news_again = Task::new(Capability::News, json!({"ticker": "AAPL"}));
        let insider = Task::new(Capability::InsiderTrades, json!({"ticker": "AAPL"}));
        let filings = Task::new(Capability::Filings, json!({"ticker": "AAPL"})).after(&insider);

        let mut ctx = PlanningContext::new(Uuid::now_v7(), "q", CapabilitySet::all());
        ctx.satisfied.insert(income.digest.clone());
        ctx.attempts.insert(income.digest.clone(), 1);
        ctx.attempts.insert(insider.digest.clone(), 2);

        let (kept, notes) = ctx.admit(vec![
            income.clone(),
            segments.clone(),
            news.clone(),
            news_again,
            insider,
            filings,
        ]);

        let ids: Vec<Uuid> = kept.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![segments.id, news.id]);
        // the satisfied prerequisite no longer blocks its dependent
        assert!(kept[0].depends_on.is_empty());
        assert_eq!(notes.len(), 2);
    }

    #[test]
    fn test_latest_outcome_and_coverage() {
        let quarterly = Task::new(
            Capability::IncomeStatements,
            json!({"ticker": "AAPL", "period": "quarterly"}),
        );
        let annual = Task::new(
            Capability::IncomeStatements,
            json!({"ticker": "AAPL", "period": "annual"}),
        );

        let mut ctx = PlanningContext::new(Uuid::now_v7(), "q", CapabilitySet::all());
        ctx.outcomes.push(TaskOutcome {
            task: quarterly,
            verdict: Verdict::InsufficientData("no rows".into()),
            failure: None,
            artifact_id: None,
        });
        assert!(!ctx.is_covered(Capability::IncomeStatements, "AAPL"));

        ctx.outcomes.push(TaskOutcome {
            task: annual.clone(),
            verdict: Verdict::Satisfied,
            failure: None,
            artifact_id: None,
        });
        assert_eq!(
            ctx.latest_outcome(Capability::IncomeStatements, "AAPL")
                .unwrap()
                .task
                .id,
            annual.id
        );
        assert!(ctx.is_covered(Capability::IncomeStatements, "AAPL"));
        assert!(ctx.is_replan());
    }
}
