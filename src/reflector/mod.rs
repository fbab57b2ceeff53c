//! Research loop
//!
//! PLAN → EXECUTE → VALIDATE → REFLECT → (PLAN | SYNTHESIZE | ABORT)
//!
//! Drives the state machine in `machine` for one session at a time. Every
//! dispatch leaves a history entry behind, so a resumed run can rebuild its
//! budget, attempt counts and outcomes by replaying the session.

pub mod machine;

pub use machine::{transition, LoopDetector, LoopEvent, LoopState, Reflection, TransitionError};

use crate::config::LoopLimits;
use crate::error::ResearchError;
use crate::executor::{Dispatch, Executor};
use crate::models::{
    Budget, FailureClass, FinalAnswer, HistoryEntry, LoopRecord, MessageRole, Plan,
    ResearchOutcome, Session, SessionStatus, StopReason, Task, TaskOutcome, Termination, Verdict,
};
use crate::planner::{Planner, PlanningContext};
use crate::store::{LeaseGuard, SessionLeases, SessionStore};
use crate::synthesizer::{SynthesisRequest, Synthesizer};
use crate::validator::Validator;
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Mutable state of one loop execution.
struct Run {
    session: Session,
    budget: Budget,
    ctx: PlanningContext,
    plan: Option<Plan>,
    detector: LoopDetector,
    wave: Vec<Task>,
    dispatches: Vec<Dispatch>,
    wave_outcomes: Vec<TaskOutcome>,
    answer: Option<FinalAnswer>,
    trace: Vec<String>,
}

impl Run {
    fn usable_artifacts(&self) -> usize {
        self.ctx
            .outcomes
            .iter()
            .filter(|o| o.verdict.is_satisfied() && o.artifact_id.is_some())
            .count()
    }

    fn plan_version(&self) -> u32 {
        self.plan.as_ref().map_or(0, |p| p.version)
    }

    fn finish(self, termination: Termination, aborted_text: Option<String>) -> ResearchOutcome {
        let status = match &termination {
            Termination::Done(StopReason::Cancelled) => SessionStatus::Active,
            Termination::Done(_) => SessionStatus::Completed,
            Termination::Aborted(_) => SessionStatus::Error,
        };
        let plan_version = self.plan_version();

        let (answer, citations, partial) = match (self.answer, aborted_text) {
            (Some(answer), _) => (answer.text, answer.citations, answer.partial),
            (None, Some(text)) => (text, Vec::new(), true),
            (None, None) => (String::new(), Vec::new(), true),
        };

        ResearchOutcome {
            session_id: self.session.id,
            status,
            termination,
            answer,
            citations,
            partial,
            budget: self.budget,
            plan_version,
            reasoning_trace: self.trace,
        }
    }
}

pub struct ReflectorLoop {
    planner: Arc<dyn Planner>,
    executor: Arc<Executor>,
    validator: Arc<Validator>,
    synthesizer: Arc<Synthesizer>,
    store: Arc<dyn SessionStore>,
    leases: SessionLeases,
    limits: LoopLimits,
}

impl ReflectorLoop {
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: Arc<Executor>,
        validator: Arc<Validator>,
        synthesizer: Arc<Synthesizer>,
        store: Arc<dyn SessionStore>,
        leases: SessionLeases,
        limits: LoopLimits,
    ) -> Self {
        Self {
            planner,
            executor,
            validator,
            synthesizer,
            store,
            leases,
            limits,
        }
    }

    pub fn leases(&self) -> &SessionLeases {
        &self.leases
    }

    /// Creates the session and records the user's question.
    pub async fn begin(&self, query: &str) -> Result<Session> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResearchError::PlanningFailed("query is empty".to_string()));
        }

        let session = self.store.create_session(query).await?;
        self.store
            .append_message(session.id, MessageRole::User, query)
            .await?;

        info!(session_id = %session.id, query, "session created");
        Ok(session)
    }

    pub async fn start(&self, query: &str, cancel: &CancellationToken) -> Result<ResearchOutcome> {
        let session = self.begin(query).await?;
        self.run(session.id, cancel).await
    }

    pub async fn resume(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<ResearchOutcome> {
        info!(session_id = %session_id, "resuming session");
        self.run(session_id, cancel).await
    }

    /// Runs an active session to a terminal state, replaying whatever it already holds.
    pub async fn run(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<ResearchOutcome> {
        let lease = self.leases.acquire(session_id)?;
        self.run_leased(lease, cancel).await
    }

    /// Like `run`, under a lease the caller already took from `leases()`.
    ///
    /// The status is read while the lease is held: a writer that finished
    /// just before has already marked the session, so it is never driven twice.
    pub async fn run_leased(
        &self,
        lease: LeaseGuard,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutcome> {
        let session_id = lease.session_id();
        let session = self.store.get_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(ResearchError::SessionNotResumable {
                id: session_id,
                status: session.status,
            });
        }

        let history = self.store.load_history(session_id).await?;
        let mut run = self.new_run(session);
        let replayed = self.replay(&mut run, &history);
        if replayed > 0 {
            run.ctx.failure_reason = Some(format!(
                "resumed after {} earlier dispatch(es)",
                replayed
            ));
            run.trace.push(format!(
                "RESUME: replayed {} dispatch(es), {} step(s) used",
                replayed, run.budget.steps_used
            ));
        }

        let result = self.drive(run, cancel).await;

        if let Err(e) = &result {
            error!(session_id = %session_id, error = %e, "research loop failed");
            if let Err(status_err) = self
                .store
                .update_status(session_id, SessionStatus::Error)
                .await
            {
                error!(
                    session_id = %session_id,
                    error = %status_err,
                    "could not mark session as errored"
                );
            }
        }

        drop(lease);
        result
    }

    fn new_run(&self, session: Session) -> Run {
        let mut ctx = PlanningContext::new(
            session.id,
            session.query.clone(),
            self.executor.registry().capabilities().clone(),
        );
        ctx.retry_ceiling = self.limits.retry_ceiling;
        ctx.as_of = session.created_at.date_naive();

        Run {
            session,
            budget: Budget::new(self.limits.max_steps, self.limits.max_cost_usd),
            ctx,
            plan: None,
            detector: LoopDetector::new(self.limits.loop_threshold),
            wave: Vec::new(),
            dispatches: Vec::new(),
            wave_outcomes: Vec::new(),
            answer: None,
            trace: vec!["INPUT: query received".to_string()],
        }
    }

    /// Rebuilds budget, attempts and outcomes from persisted dispatches.
    fn replay(&self, run: &mut Run, history: &[HistoryEntry]) -> usize {
        let mut replayed = 0;

        for entry in history {
            let (task, verdict, failure, artifact_id, cost) = match entry {
                HistoryEntry::Artifact(artifact) => {
                    let task = Task::new(artifact.capability, artifact.args.clone());
                    let verdict = self.validator.evaluate(&task, artifact);
                    (task, verdict, None, Some(artifact.id), artifact.cost_usd)
                }
                HistoryEntry::Message(message) => {
                    let record = message
                        .metadata
                        .clone()
                        .and_then(|m| serde_json::from_value::<LoopRecord>(m).ok());
                    match record {
                        Some(LoopRecord::DispatchFailed(failed)) => (
                            Task::new(failed.capability, failed.args),
                            Verdict::Error(failed.reason),
                            Some(failed.class),
                            None,
                            failed.cost_usd,
                        ),
                        _ => continue,
                    }
                }
            };

            run.budget.charge(cost);
            self.settle(run, task, verdict, failure, artifact_id);
            replayed += 1;
        }

        replayed
    }

    async fn drive(&self, mut run: Run, cancel: &CancellationToken) -> Result<ResearchOutcome> {
        let mut state = LoopState::Planning;

        loop {
            let event = match &state {
                LoopState::Planning => self.plan_phase(&mut run, cancel).await?,
                LoopState::Executing => self.execute_phase(&mut run, cancel).await?,
                LoopState::Validating => self.validate_phase(&mut run),
                LoopState::Reflecting => self.reflect_phase(&mut run, cancel),
                LoopState::Synthesizing(stop) => self.synthesize_phase(&mut run, *stop).await?,
                LoopState::Done(stop) => {
                    info!(
                        session_id = %run.session.id,
                        stop = ?stop,
                        steps = run.budget.steps_used,
                        cost_usd = run.budget.cost_used_usd,
                        "research loop finished"
                    );
                    return Ok(run.finish(Termination::Done(*stop), None));
                }
                LoopState::Aborted(reason) => {
                    let text = self.synthesizer.close_aborted(run.session.id, reason).await?;
                    run.trace.push(format!("ABORT: {}", reason));
                    return Ok(run.finish(Termination::Aborted(reason.clone()), Some(text)));
                }
            };

            let next = transition(&state, event)?;
            info!(
                session_id = %run.session.id,
                from = %state,
                to = %next,
                "loop transition"
            );
            state = next;
        }
    }

    // === PLAN ===
    async fn plan_phase(&self, run: &mut Run, cancel: &CancellationToken) -> Result<LoopEvent> {
        if cancel.is_cancelled() {
            run.trace.push("PLAN: cancellation observed".to_string());
            return Ok(LoopEvent::Cancelled);
        }
        if run.budget.is_exhausted() {
            run.trace.push("PLAN: budget already exhausted".to_string());
            return Ok(LoopEvent::BudgetExhausted);
        }

        if run.plan.is_none() || run.ctx.failure_reason.is_some() {
            run.ctx.version = run.plan.as_ref().map_or(1, |p| p.version + 1);
            run.ctx.history = self.store.load_history(run.session.id).await?;

            match self.planner.plan(&run.ctx).await {
                Ok(plan) => {
                    debug!(
                        session_id = %run.session.id,
                        planner = self.planner.name(),
                        version = plan.version,
                        tasks = plan.tasks.len(),
                        "plan created"
                    );
                    run.trace.push(format!(
                        "PLAN: v{} with {} task(s){}",
                        plan.version,
                        plan.tasks.len(),
                        plan.rationale
                            .as_deref()
                            .map(|r| format!(" ({})", r))
                            .unwrap_or_default()
                    ));
                    run.plan = Some(plan);
                    run.ctx.failure_reason = None;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(session_id = %run.session.id, error = %e, "planner failed");
                    run.trace.push(format!("PLAN: planner failed: {}", e));
                    if run.usable_artifacts() == 0 {
                        return Ok(LoopEvent::PlannerFailed(e.to_string()));
                    }
                    return Ok(LoopEvent::PlanExhausted {
                        usable_artifacts: true,
                    });
                }
            }
        }

        let usable_artifacts = run.usable_artifacts() > 0;
        let plan = match run.plan.as_mut() {
            Some(plan) => plan,
            None => return Ok(LoopEvent::PlanExhausted { usable_artifacts }),
        };

        for task in plan.fail_unreachable() {
            run.trace.push(format!(
                "PLAN: {} skipped, a prerequisite was not satisfied",
                task.label()
            ));
        }

        let ready = plan.ready_tasks();
        let registry = self.executor.registry();
        let mut wave = Vec::with_capacity(ready.len());
        let mut queued_cost = 0.0;

        for task in &ready {
            let cost = registry.estimated_cost(task.capability);
            if !run.budget.admits(wave.len() as u32, queued_cost, cost) {
                break;
            }
            queued_cost += cost;
            wave.push(task.clone());
        }

        if wave.is_empty() {
            if !ready.is_empty() {
                run.trace.push("PLAN: no ready task fits the remaining budget".to_string());
                return Ok(LoopEvent::BudgetExhausted);
            }
            run.trace.push("PLAN: nothing left to dispatch".to_string());
            return Ok(LoopEvent::PlanExhausted { usable_artifacts });
        }

        if wave.len() < ready.len() {
            run.trace.push(format!(
                "PLAN: wave truncated to {} of {} ready task(s) by budget",
                wave.len(),
                ready.len()
            ));
        }

        for task in &wave {
            plan.set_status(task.id, crate::models::TaskStatus::InProgress);
        }
        run.wave = wave;
        Ok(LoopEvent::PlanReady)
    }

    // === EXECUTE ===
    async fn execute_phase(&self, run: &mut Run, cancel: &CancellationToken) -> Result<LoopEvent> {
        let session_id = run.session.id;
        let mut workers = JoinSet::new();

        for (index, task) in std::mem::take(&mut run.wave).into_iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let cancel = cancel.clone();
            workers.spawn(async move { (index, executor.run(session_id, &task, &cancel).await) });
        }

        // barrier: every in-flight dispatch settles before validation
        let mut settled: Vec<(usize, Dispatch)> = Vec::new();
        let mut first_error: Option<ResearchError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(dispatch))) => settled.push((index, dispatch)),
                Ok((_, Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(ResearchError::Internal(format!(
                        "dispatch worker failed: {}",
                        join_err
                    )));
                }
            }
        }
        settled.sort_by_key(|(index, _)| *index);

        for (_, dispatch) in &settled {
            run.budget.charge(dispatch.cost_usd);
            let summary = match &dispatch.outcome {
                Ok(_) if dispatch.from_cache => "served from cache".to_string(),
                Ok(_) => format!("fetched in {} attempt(s)", dispatch.attempts),
                Err(failure) => format!("failed ({:?}): {}", failure.class, failure.error),
            };
            run.trace.push(format!("EXECUTE: {} {}", dispatch.task.label(), summary));
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        run.dispatches = settled.into_iter().map(|(_, d)| d).collect();
        Ok(LoopEvent::WaveSettled)
    }

    // === VALIDATE ===
    fn validate_phase(&self, run: &mut Run) -> LoopEvent {
        run.wave_outcomes.clear();

        for dispatch in std::mem::take(&mut run.dispatches) {
            let (verdict, failure, artifact_id) = match &dispatch.outcome {
                Ok(artifact) => (
                    self.validator.evaluate(&dispatch.task, artifact),
                    None,
                    Some(artifact.id),
                ),
                Err(failure) => (
                    Verdict::Error(failure.error.to_string()),
                    Some(failure.class),
                    None,
                ),
            };

            if let Some(plan) = run.plan.as_mut() {
                plan.set_status(dispatch.task.id, verdict.task_status());
            }
            run.trace.push(format!(
                "VERIFY: {} {}",
                dispatch.task.label(),
                match verdict.reason() {
                    Some(reason) => format!("{:?}: {}", verdict.task_status(), reason),
                    None => "satisfied".to_string(),
                }
            ));

            let outcome = self.settle(run, dispatch.task, verdict, failure, artifact_id);
            run.wave_outcomes.push(outcome);
        }

        LoopEvent::Validated
    }

    /// Books one settled dispatch into the planning context and loop detector.
    fn settle(
        &self,
        run: &mut Run,
        mut task: Task,
        verdict: Verdict,
        failure: Option<FailureClass>,
        artifact_id: Option<Uuid>,
    ) -> TaskOutcome {
        task.status = verdict.task_status();
        let satisfied = verdict.is_satisfied();

        *run.ctx.attempts.entry(task.digest.clone()).or_insert(0) += 1;
        if satisfied {
            run.ctx.satisfied.insert(task.digest.clone());
        }

        if run.detector.record(&task.digest, satisfied) {
            warn!(
                session_id = %run.session.id,
                task = %task.label(),
                attempts = run.ctx.attempts_for(&task.digest),
                "loop detector tripped"
            );
            run.trace.push(format!(
                "REFLECT: {} keeps recurring without progress",
                task.label()
            ));
        }

        let outcome = TaskOutcome {
            task,
            verdict,
            failure,
            artifact_id,
        };
        run.ctx.outcomes.push(outcome.clone());
        outcome
    }

    // === REFLECT ===
    fn reflect_phase(&self, run: &mut Run, cancel: &CancellationToken) -> LoopEvent {
        let capabilities = self.executor.registry().capabilities();
        let failures: Vec<&TaskOutcome> = run
            .wave_outcomes
            .iter()
            .filter(|o| !o.verdict.is_satisfied())
            .collect();

        let (all_satisfied, has_pending) = run
            .plan
            .as_ref()
            .map_or((false, false), |p| (p.all_satisfied(), p.has_pending()));

        let substitutable = failures.iter().any(|o| {
            !capabilities.contains(o.task.capability)
                && o.task
                    .capability
                    .fallback()
                    .map_or(false, |f| capabilities.contains(f))
        });

        let dead_end = run.usable_artifacts() == 0
            && !failures.is_empty()
            && !has_pending
            && !substitutable
            && failures.iter().all(|o| run.ctx.failed_permanently(o));

        let failure_reason = (!failures.is_empty()).then(|| {
            failures
                .iter()
                .map(|o| format!("{}: {}", o.task.label(), o.verdict.reason().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join("; ")
        });

        let reflection = Reflection {
            all_satisfied,
            dead_end,
            cancelled: cancel.is_cancelled(),
            budget_exhausted: run.budget.is_exhausted(),
            stalled: run.detector.is_tripped(),
        };

        run.trace.push(format!(
            "REFLECT: {} of {} wave task(s) satisfied, {}/{} steps, ${:.4}/${:.4}",
            run.wave_outcomes.len() - failures.len(),
            run.wave_outcomes.len(),
            run.budget.steps_used,
            run.budget.max_steps,
            run.budget.cost_used_usd,
            run.budget.max_cost_usd
        ));
        run.ctx.failure_reason = failure_reason;

        LoopEvent::Reflected(reflection)
    }

    // === SYNTHESIZE ===
    async fn synthesize_phase(&self, run: &mut Run, stop: StopReason) -> Result<LoopEvent> {
        let history = self.store.load_history(run.session.id).await?;

        let answer = self
            .synthesizer
            .synthesize(SynthesisRequest {
                session_id: run.session.id,
                query: &run.session.query,
                history: &history,
                outcomes: &run.ctx.outcomes,
                stop,
                steps_used: run.budget.steps_used,
            })
            .await?;

        run.trace.push(format!(
            "SYNTHESIZE: {:?}, {} citation(s){}",
            stop,
            answer.citations.len(),
            if answer.partial { ", partial" } else { "" }
        ));
        run.answer = Some(answer);
        Ok(LoopEvent::Synthesized)
    }
}
