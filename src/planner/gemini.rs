//! Gemini-powered planner
//!
//! Uses an LLM to decompose open-ended questions into data-gathering tasks.
//! High-confidence first plans and every LLM failure go through the rule
//! planner instead.

use super::rules::{QueryIntent, RuleBasedPlanner};
use super::{Planner, PlanningContext};
use crate::error::ResearchError;
use crate::llm::{extract_json_block, LanguageModel};
use crate::models::{Capability, Plan, Task, Verdict};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are a financial research planning engine. \
You decompose a research question into data-gathering tasks against a fixed \
set of data capabilities. You never answer the question yourself. \
Return ONLY valid JSON, no explanation text.";

pub struct GeminiPlanner {
    llm: Arc<dyn LanguageModel>,
    fallback: RuleBasedPlanner,
}

impl GeminiPlanner {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            fallback: RuleBasedPlanner::new(),
        }
    }

    /// Build structured planning prompt
    fn build_prompt(&self, ctx: &PlanningContext) -> String {
        let capabilities: Vec<&str> = ctx.capabilities.iter().map(|c| c.as_str()).collect();

        let mut gathered = Vec::new();
        for outcome in &ctx.outcomes {
            let status = match &outcome.verdict {
                Verdict::Satisfied => "satisfied".to_string(),
                Verdict::InsufficientData(r) => format!("insufficient: {}", r),
                Verdict::Error(r) => format!("failed: {}", r),
            };
            gathered.push(format!(
                "- {} {} -> {}",
                outcome.task.capability, outcome.task.args, status
            ));
        }

        let base_prompt = format!(
            r#"QUESTION:
{}

AVAILABLE CAPABILITIES:
- {}

Argument guidance:
- every task: {{ "ticker": "<symbol>" }}
- statements, financial-metrics, analyst-estimates, segmented-revenues: add "period" (annual | quarterly | ttm) and "limit" (positive integer)
- prices: add "start_date" and "end_date" (YYYY-MM-DD)
- news, insider-trades, filings: optional "limit"

ALREADY GATHERED:
{}

Rules:
- Only use available capabilities
- Do not repeat a task that is already satisfied
- "depends_on" lists indexes of earlier tasks in this response
- At most 8 tasks
- JSON format:

{{
  "tasks": [
    {{ "capability": "income-statements", "args": {{ "ticker": "AAPL", "period": "quarterly", "limit": 4 }}, "depends_on": [] }}
  ],
  "rationale": "..."
}}
"#,
            ctx.query,
            capabilities.join("\n- "),
            if gathered.is_empty() {
                "(nothing yet)".to_string()
            } else {
                gathered.join("\n")
            },
        );

        match &ctx.failure_reason {
            Some(reason) => format!(
                "The previous plan did not finish:\n{}\n\nGenerate a DIFFERENT plan for what is still missing.\n\n{}",
                reason, base_prompt
            ),
            None => base_prompt,
        }
    }

    async fn plan_with_llm(&self, ctx: &PlanningContext) -> Result<Plan> {
        let prompt = self.build_prompt(ctx);
        let response = self.llm.complete(SYSTEM_PROMPT, &prompt).await?;
        let plan = parse_plan_response(&response, ctx)?;

        if plan.is_empty() && !ctx.is_replan() {
            return Err(ResearchError::InvalidPlan(
                "LLM returned no admissible tasks".to_string(),
            ));
        }
        Ok(plan)
    }
}

#[async_trait]
impl Planner for GeminiPlanner {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan> {
        // Deterministic intent routing for high-confidence first plans.
        let intent = QueryIntent::parse(&ctx.query);
        if !ctx.is_replan() && intent.explicit && !intent.tickers.is_empty() {
            return self.fallback.plan(ctx).await;
        }

        match self.plan_with_llm(ctx).await {
            Ok(plan) => {
                debug!(
                    session_id = %ctx.session_id,
                    version = plan.version,
                    tasks = plan.tasks.len(),
                    "LLM plan accepted"
                );
                Ok(plan)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "LLM planning failed; using rules");
                self.fallback.plan(ctx).await
            }
        }
    }
}

/// Parse a task list from the LLM response.
fn parse_plan_response(response: &str, ctx: &PlanningContext) -> Result<Plan> {
    let cleaned = extract_json_block(response).ok_or_else(|| {
        ResearchError::Llm(format!("No JSON in planner response | raw={}", response))
    })?;

    let json: Value = serde_json::from_str(cleaned)
        .map_err(|e| ResearchError::Llm(format!("Failed to parse plan response: {}", e)))?;

    let tasks_json = json
        .get("tasks")
        .ok_or_else(|| ResearchError::InvalidPlan("No tasks in response".to_string()))?
        .as_array()
        .ok_or_else(|| ResearchError::InvalidPlan("tasks is not an array".to_string()))?;

    let mut tasks: Vec<Task> = Vec::with_capacity(tasks_json.len());

    for (index, task_json) in tasks_json.iter().enumerate() {
        let capability: Capability = task_json
            .get("capability")
            .and_then(Value::as_str)
            .ok_or_else(|| ResearchError::InvalidPlan("Missing capability".to_string()))?
            .parse()
            .map_err(ResearchError::InvalidPlan)?;

        let args = task_json
            .get("args")
            .filter(|a| a.is_object())
            .cloned()
            .ok_or_else(|| {
                ResearchError::InvalidPlan(format!("task {} has no args object", index))
            })?;

        let mut task = Task::new(capability, args);

        if let Some(deps) = task_json.get("depends_on").and_then(Value::as_array) {
            for dep in deps {
                let dep_index = dep.as_u64().map(|d| d as usize).filter(|d| *d < index);
                let dependency = dep_index.and_then(|d| tasks.get(d)).ok_or_else(|| {
                    ResearchError::InvalidPlan(format!(
                        "task {} depends on invalid index {}",
                        index, dep
                    ))
                })?;
                task = task.after(dependency);
            }
        }

        tasks.push(task);
    }

    let (admitted, notes) = ctx.admit(tasks);

    let mut rationale = json
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or("LLM plan")
        .to_string();
    if !notes.is_empty() {
        rationale.push_str("; ");
        rationale.push_str(&notes.join("; "));
    }

    Ok(Plan::new(ctx.version, admitted)?.with_rationale(rationale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CapabilitySet;
    use crate::testing::ScriptedLlm;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(query: &str) -> PlanningContext {
        PlanningContext::new(Uuid::now_v7(), query, CapabilitySet::all())
    }

    #[test]
    fn test_parse_plan_with_dependencies() {
        let response = r#"```json
{
  "tasks": [
    {"capability": "income-statements", "args": {"ticker": "NVDA", "period": "annual", "limit": 4}, "depends_on": []},
    {"capability": "segmented_revenues", "args": {"ticker": "NVDA"}, "depends_on": [0]}
  ],
  "rationale": "top line then segments"
}
```"#;
        let plan = parse_plan_response(response, &ctx("nvidia growth drivers")).unwrap();

        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].capability, Capability::SegmentedRevenues);
        assert_eq!(plan.tasks[1].depends_on, vec![plan.tasks[0].id]);
        assert_eq!(plan.rationale.as_deref(), Some("top line then segments"));
    }

    #[test]
    fn test_parse_rejects_bad_plans() {
        let c = ctx("q");
        assert!(parse_plan_response("I cannot help", &c).is_err());
        assert!(parse_plan_response(r#"{"tasks": [{"capability": "dividends", "args": {}}]}"#, &c).is_err());
        assert!(parse_plan_response(
            r#"{"tasks": [{"capability": "news", "args": {"ticker": "A"}, "depends_on": [0]}]}"#,
            &c
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_explicit_first_plan_skips_llm() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let planner = GeminiPlanner::new(llm.clone());

        let plan = planner.plan(&ctx("Apple Q4 revenue")).await.unwrap();
        assert_eq!(plan.tasks[0].capability, Capability::IncomeStatements);
        assert!(llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_open_question_uses_llm_and_falls_back() {
        let reply = json!({
            "tasks": [{"capability": "news", "args": {"ticker": "TSLA", "limit": 5}}],
            "rationale": "recent coverage"
        })
        .to_string();
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(reply), Err("quota".to_string())]));
        let planner = GeminiPlanner::new(llm.clone());

        let plan = planner.plan(&ctx("Tell me about TSLA")).await.unwrap();
        assert_eq!(plan.tasks[0].capability, Capability::News);
        assert_eq!(llm.prompts().len(), 1);

        // second call errors, so the rule planner's snapshot defaults apply
        let plan = planner.plan(&ctx("Tell me about TSLA")).await.unwrap();
        assert_eq!(plan.tasks[0].capability, Capability::PriceSnapshot);
    }
}
