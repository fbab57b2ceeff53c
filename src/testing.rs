//! Scripted collaborators for unit tests

use crate::error::ResearchError;
use crate::llm::LanguageModel;
use crate::models::{Capability, CapabilitySet, Plan, ResearchArtifact, Task};
use crate::planner::{Planner, PlanningContext};
use crate::providers::{DataProvider, ProviderError, ProviderResponse};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Scripted = std::result::Result<Value, ProviderError>;

/// Provider that answers from per-capability scripts, then from a sticky
/// override, then with one synthetic row.
pub struct ScriptedProvider {
    name: String,
    capabilities: CapabilitySet,
    cost: f64,
    delay: Option<Duration>,
    queued: Mutex<HashMap<Capability, VecDeque<Scripted>>>,
    sticky: HashMap<Capability, Scripted>,
    cancel_on_call: Option<CancellationToken>,
    calls: AtomicUsize,
    log: Mutex<Vec<(Capability, Value)>>,
}

impl ScriptedProvider {
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            name: "scripted".to_string(),
            capabilities,
            cost: 0.01,
            delay: None,
            queued: Mutex::new(HashMap::new()),
            sticky: HashMap::new(),
            cancel_on_call: None,
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Responses consumed in order before falling back to the default.
    pub fn script(self, capability: Capability, responses: Vec<Scripted>) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(capability)
            .or_default()
            .extend(responses);
        self
    }

    /// Response returned for every call once the script runs out.
    pub fn always(mut self, capability: Capability, response: Scripted) -> Self {
        self.sticky.insert(capability, response);
        self
    }

    /// Cancels `token` during the first call.
    pub fn cancel_on_call(mut self, token: CancellationToken) -> Self {
        self.cancel_on_call = Some(token);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, capability: Capability) -> usize {
        self.log().iter().filter(|(c, _)| *c == capability).count()
    }

    pub fn log(&self) -> Vec<(Capability, Value)> {
        self.log.lock().unwrap().clone()
    }
}

pub fn sample_payload(capability: Capability, ticker: &str) -> Value {
    let field = capability.payload_field();
    if capability.is_snapshot() {
        json!({ field: {"ticker": ticker, "price": 189.5, "market_cap": 2_900_000_000_000u64} })
    } else {
        json!({ field: [{"ticker": ticker, "report_period": "2024-09-28", "revenue": 94_930_000_000u64}] })
    }
}

pub fn sample_source(capability: Capability, ticker: &str) -> String {
    format!("test://{}/{}", capability, ticker)
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn cost_per_call(&self, _capability: Capability) -> f64 {
        self.cost
    }

    async fn fetch(
        &self,
        capability: Capability,
        args: &Value,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push((capability, args.clone()));

        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let ticker = args.get("ticker").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let scripted = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&capability)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.sticky.get(&capability).cloned());

        let data = match scripted {
            Some(result) => result?,
            None => sample_payload(capability, ticker),
        };

        Ok(ProviderResponse {
            data,
            source: sample_source(capability, ticker),
        })
    }
}

/// Language model that replays canned replies and records prompts.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    model: Mutex<String>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            model: Mutex::new("scripted-model".to_string()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn set_model(&self, model: &str) {
        *self.model.lock().unwrap() = model.to_string();
    }

    async fn complete(&self, _system_prompt: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(ResearchError::Llm(e)),
            None => Err(ResearchError::Llm("no scripted reply left".to_string())),
        }
    }
}

/// Emits the same task on every call and ignores the admission filter.
pub struct RepeatingPlanner {
    capability: Capability,
    args: Value,
    calls: AtomicUsize,
}

impl RepeatingPlanner {
    pub fn new(capability: Capability, args: Value) -> Self {
        Self {
            capability,
            args,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for RepeatingPlanner {
    fn name(&self) -> &str {
        "repeating"
    }

    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Plan::new(ctx.version, vec![Task::new(self.capability, self.args.clone())])
    }
}

/// Emits `per_plan` brand-new news tasks on every call.
pub struct ExpandingPlanner {
    per_plan: usize,
}

impl ExpandingPlanner {
    pub fn new(per_plan: usize) -> Self {
        Self { per_plan }
    }
}

#[async_trait]
impl Planner for ExpandingPlanner {
    fn name(&self) -> &str {
        "expanding"
    }

    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan> {
        let tasks = (0..self.per_plan)
            .map(|i| {
                let limit = ctx.version as usize * 100 + i + 1;
                Task::new(Capability::News, json!({"ticker": "AAPL", "limit": limit}))
            })
            .collect();
        Plan::new(ctx.version, tasks)
    }
}

pub fn artifact_for(task: &Task, payload: Value, source: &str) -> ResearchArtifact {
    ResearchArtifact {
        id: Uuid::new_v4(),
        session_id: Uuid::nil(),
        seq: 0,
        capability: task.capability,
        args: task.args.clone(),
        digest: task.digest.clone(),
        payload,
        source: source.to_string(),
        cost_usd: 0.0,
        from_cache: false,
        timestamp: chrono::Utc::now(),
    }
}
