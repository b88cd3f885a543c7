//! The conductor drives one request through the staged pipeline.
//!
//! Phases run strictly in order: intent, context, plan, execute, validate,
//! and the fix loop between validate and completion. Each stage call goes
//! through [`Conductor::invoke`], which owns retry with backoff, per-attempt
//! tracing, metrics and lifecycle events. Phase methods handle the
//! recoverable cases that are local to them (plan re-generation, context
//! starvation, the fix loop) and turn everything else into a [`Halt`].
//!
//! A conductor holds no per-request state; everything a request accumulates
//! lives in a [`Run`] created by [`Conductor::run`].

mod fix_loop;
pub mod recovery;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::domain::errors::{AgentError, ErrorKind, Severity};
use crate::domain::models::{
    AccumulatedContext, Config, ContextStarvedPolicy, ExecutionResult, Intent, Phase, PhaseStatus,
    PipelineEvent, PipelineMetrics, Plan, ProcessOutcome, ProcessResult, RetrievedContext,
    StageId, StageTrace, TokenUsage, TraceEntry, Transition,
};
use crate::domain::ports::{EventSink, RepositoryAccessor};
use crate::services::event_stream::EventQueue;
use crate::services::executor::write_artifacts;
use crate::services::retry::{self, sleep_or_cancel, RetryPolicy};
use crate::services::stage::{
    ExecutionInput, IntentInput, PlanInput, Stage, StageContext, StageOutcome, StageSet,
};

pub use recovery::{recovery_for, Halt, Recovery};

/// Labels recorded with each stage attempt.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AttemptTag<'a> {
    step_id: Option<&'a str>,
    iteration: Option<u32>,
}

impl<'a> AttemptTag<'a> {
    fn step(step_id: &'a str, iteration: Option<u32>) -> Self {
        Self {
            step_id: Some(step_id),
            iteration,
        }
    }
}

/// State of one request. Owned by exactly one conductor call.
pub(crate) struct Run {
    ctx: StageContext,
    accumulated: AccumulatedContext,
    metrics: PipelineMetrics,
    trace: StageTrace,
    phase: Phase,
    steps_completed: usize,
    steps_total: usize,
}

impl Run {
    fn request_id(&self) -> Uuid {
        self.ctx.request_id
    }

    /// Move to `to`, recording and announcing the change. Returns false if
    /// the transition is not allowed.
    fn transition(&mut self, to: Phase) -> bool {
        let from = self.phase;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!(request_id = %self.request_id(), %from, %to, "invalid phase transition");
            return false;
        }
        self.trace.transitions.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        self.ctx.events.emit(PipelineEvent::PhaseChanged {
            request_id: self.request_id(),
            from,
            to,
        });
        debug!(request_id = %self.request_id(), %from, %to, "phase transition");
        self.phase = to;
        true
    }

    fn emit_stage(&self, stage: StageId, status: PhaseStatus, attempt: u32, duration_ms: u64, usage: TokenUsage) {
        self.ctx.events.emit(PipelineEvent::Stage {
            request_id: self.request_id(),
            phase: self.phase,
            stage,
            status,
            attempt,
            duration_ms,
            usage,
            steps_completed: self.steps_completed,
            steps_total: self.steps_total,
        });
    }
}

/// Orchestrates the stages for one request at a time.
pub struct Conductor {
    stages: StageSet,
    config: Arc<Config>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
    repository: Option<Arc<dyn RepositoryAccessor>>,
}

impl Conductor {
    pub fn new(stages: StageSet, config: Arc<Config>, events: Arc<dyn EventSink>) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            stages,
            config,
            retry,
            events,
            repository: None,
        }
    }

    /// Repository that receives artifacts when `pipeline.write_artifacts`
    /// is set.
    pub fn with_repository(mut self, repository: Arc<dyn RepositoryAccessor>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Process one request to a terminal outcome. Never fails: every error
    /// is reported inside the returned [`ProcessResult`].
    pub async fn run(
        &self,
        request: &str,
        prior_summary: Option<String>,
        cancel: CancellationToken,
    ) -> ProcessResult {
        let started = Instant::now();
        let (queue, pump) = EventQueue::start(self.events.clone(), self.config.streaming.queue_capacity);

        let accumulated = AccumulatedContext::new(request, prior_summary);
        let request_id = accumulated.request_id;
        let mut run = Run {
            ctx: StageContext::new(request_id, cancel, queue.clone()),
            accumulated,
            metrics: PipelineMetrics::default(),
            trace: StageTrace::default(),
            phase: Phase::Intent,
            steps_completed: 0,
            steps_total: 0,
        };

        info!(%request_id, "request started");
        let outcome = match self
            .drive(&mut run)
            .instrument(info_span!("request", %request_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(halt) => halt.into_outcome(),
        };

        let terminal = match &outcome {
            ProcessOutcome::Completed { .. } | ProcessOutcome::FixLoopExhausted { .. } => Phase::Complete,
            ProcessOutcome::NeedsClarification { .. } => Phase::NeedsClarification,
            ProcessOutcome::Failed { .. } => Phase::Failed,
        };
        if !run.transition(terminal) {
            run.phase = terminal;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        run.metrics.total_duration_ms = duration_ms;
        match &outcome {
            ProcessOutcome::Failed { error } => error!(
                %request_id,
                stage = %error.stage,
                kind = %error.kind,
                duration_ms,
                "request failed: {}",
                error.message
            ),
            other => info!(%request_id, outcome = other.label(), duration_ms, "request finished"),
        }

        run.ctx.events.emit(PipelineEvent::Finished {
            request_id,
            outcome: outcome.label().to_string(),
            duration_ms,
        });
        pump.finish().await;
        run.metrics.dropped_stream_events = queue.dropped();

        ProcessResult {
            request_id,
            outcome,
            context: run.accumulated,
            metrics: run.metrics,
            trace: run.trace,
            final_phase: run.phase,
        }
    }

    async fn drive(&self, run: &mut Run) -> Result<ProcessOutcome, Halt> {
        let intent = self.intent_phase(run).await?;
        let context = self.context_phase(run, &intent).await?;
        let plan = self.plan_phase(run, &intent, &context).await?;
        let results = self.execute_phase(run, &plan, &context).await?;

        match self.validate_and_fix(run, &plan, &context, results).await? {
            ProcessOutcome::Completed {
                artifacts,
                warnings,
                ..
            } if self.config.pipeline.write_artifacts => {
                let Some(repository) = &self.repository else {
                    warn!("write_artifacts is set but no repository is configured");
                    return Ok(ProcessOutcome::Completed {
                        artifacts,
                        warnings,
                        written: false,
                    });
                };
                write_artifacts(repository.as_ref(), &artifacts).await?;
                Ok(ProcessOutcome::Completed {
                    artifacts,
                    warnings,
                    written: true,
                })
            }
            other => Ok(other),
        }
    }

    async fn intent_phase(&self, run: &mut Run) -> Result<Intent, Halt> {
        let input = IntentInput {
            request: run.accumulated.request.clone(),
            prior_summary: run.accumulated.prior_summary.clone(),
        };
        let intent = self
            .invoke(run, self.stages.intent(), &input, AttemptTag::default())
            .await?;
        run.accumulated.intent = Some(intent.clone());

        if intent.needs_clarification {
            return Err(Halt::Clarify(recovery::clarification_for_intent(
                intent,
                self.config.intent.confidence_threshold,
            )));
        }
        Ok(intent)
    }

    async fn context_phase(&self, run: &mut Run, intent: &Intent) -> Result<Arc<RetrievedContext>, Halt> {
        run.transition(Phase::Context);
        match self
            .invoke(run, self.stages.context(), intent, AttemptTag::default())
            .await
        {
            Ok(context) => {
                let added = run.accumulated.absorb_chunks(&context.chunks);
                debug!(added, total = run.accumulated.chunks.len(), "context absorbed");
                Ok(Arc::new(context))
            }
            Err(Halt::Fail(err)) if err.kind == ErrorKind::InsufficientContext => {
                match self.config.pipeline.context_starved_policy {
                    ContextStarvedPolicy::Halt => {
                        Err(Halt::Fail(err.escalate("context_starved_policy is halt")))
                    }
                    ContextStarvedPolicy::Proceed => {
                        warn!(reason = %err.message, "proceeding without context");
                        Ok(Arc::new(RetrievedContext::starved(self.config.context.token_budget)))
                    }
                }
            }
            Err(halt) => Err(halt),
        }
    }

    async fn plan_phase(
        &self,
        run: &mut Run,
        intent: &Intent,
        context: &Arc<RetrievedContext>,
    ) -> Result<Plan, Halt> {
        run.transition(Phase::Plan);
        let mut feedback = None;
        let mut regenerations = 0;

        loop {
            let input = PlanInput {
                intent: intent.clone(),
                context: context.clone(),
                feedback: feedback.take(),
            };
            match self
                .invoke(run, self.stages.plan(), &input, AttemptTag::default())
                .await
            {
                Ok(plan) => {
                    run.steps_total = plan.steps.len();
                    run.accumulated.plan = Some(plan.clone());
                    return Ok(plan);
                }
                Err(Halt::Fail(err)) if err.severity == Severity::Recoverable => {
                    if regenerations >= self.config.planning.max_regenerations {
                        return Err(Halt::Fail(
                            err.escalate(format!("still failing after {regenerations} re-generation(s)")),
                        ));
                    }
                    regenerations += 1;
                    info!(regeneration = regenerations, reason = %err.message, "re-generating plan");
                    feedback = Some(err.message);
                }
                Err(halt) => return Err(halt),
            }
        }
    }

    async fn execute_phase(
        &self,
        run: &mut Run,
        plan: &Plan,
        context: &Arc<RetrievedContext>,
    ) -> Result<Vec<ExecutionResult>, Halt> {
        run.transition(Phase::Execute);
        let mut results = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            let predecessor = step
                .primary_target()
                .and_then(|path| latest_on_path(&results, path, results.len()))
                .cloned();
            let input = ExecutionInput::new(step.clone(), context.clone(), run.accumulated.decisions.clone())
                .after(predecessor);
            let result = self
                .execute_step(run, input, AttemptTag::step(&step.id, None))
                .await?;
            absorb_source(run, &result);
            run.steps_completed += 1;
            results.push(result);
        }
        Ok(results)
    }

    /// Execute one step, re-generating with the error as feedback when the
    /// execution stage reports a recoverable failure.
    async fn execute_step(
        &self,
        run: &mut Run,
        mut input: ExecutionInput,
        tag: AttemptTag<'_>,
    ) -> Result<ExecutionResult, Halt> {
        let mut regenerations = 0;
        loop {
            match self.invoke(run, self.stages.execution(), &input, tag).await {
                Ok(result) => return Ok(result),
                Err(Halt::Fail(err)) if err.severity == Severity::Recoverable => {
                    if regenerations >= self.config.planning.max_regenerations {
                        return Err(Halt::Fail(
                            err.escalate(format!("still failing after {regenerations} re-generation(s)")),
                        ));
                    }
                    regenerations += 1;
                    info!(step_id = %input.step.id, regeneration = regenerations, reason = %err.message, "re-generating step");
                    input.feedback = Some(err.message);
                }
                Err(halt) => return Err(halt),
            }
        }
    }

    /// Call a stage until it succeeds or a non-retryable outcome arrives.
    /// Transient failures back off and retry within the retry budget; an
    /// exhausted budget is escalated to Fatal. Other failures are returned
    /// for the calling phase to handle.
    async fn invoke<I, O>(
        &self,
        run: &mut Run,
        stage: &Arc<dyn Stage<Input = I, Output = O>>,
        input: &I,
        tag: AttemptTag<'_>,
    ) -> Result<O, Halt>
    where
        I: Send + Sync,
        O: Send,
    {
        let stage_id = stage.id();
        let mut state = self.retry.state(stage_id);
        run.metrics.stage_mut(stage_id).invocations += 1;

        loop {
            if run.ctx.is_cancelled() {
                return Err(Halt::Fail(AgentError::cancelled(stage_id)));
            }
            let attempt = state.begin_attempt();
            if attempt == 1 {
                run.emit_stage(stage_id, PhaseStatus::Started, attempt, 0, TokenUsage::default());
            }

            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = tokio::select! {
                () = run.ctx.cancel.cancelled() => StageOutcome::Failed(AgentError::cancelled(stage_id)),
                outcome = stage.run(input, &run.ctx) => outcome,
            };
            let duration_ms = clock.elapsed().as_millis() as u64;
            let usage = run.ctx.take_usage();

            let metrics = run.metrics.stage_mut(stage_id);
            metrics.attempts += 1;
            metrics.total_latency_ms += duration_ms;
            metrics.input_tokens += usage.input_tokens;
            metrics.output_tokens += usage.output_tokens;
            if matches!(outcome, StageOutcome::Failed(_)) {
                metrics.failures += 1;
            }

            let mut entry = TraceEntry {
                phase: run.phase,
                stage: stage_id,
                attempt,
                iteration: tag.iteration,
                step_id: tag.step_id.map(str::to_string),
                started_at,
                duration_ms,
                status: PhaseStatus::Completed,
                usage,
                detail: None,
            };

            match outcome {
                StageOutcome::Done(value) => {
                    run.trace.entries.push(entry);
                    run.emit_stage(stage_id, PhaseStatus::Completed, attempt, duration_ms, usage);
                    return Ok(value);
                }
                StageOutcome::NeedsInput(request) => {
                    entry.detail = Some(format!("needs input: {}", request.reason));
                    run.trace.entries.push(entry);
                    run.emit_stage(stage_id, PhaseStatus::Completed, attempt, duration_ms, usage);
                    return Err(Halt::Clarify(request));
                }
                StageOutcome::Failed(err) => {
                    entry.detail = Some(err.to_string());
                    let recovery = recovery_for(&err, state.can_retry());

                    if recovery == Recovery::Retry {
                        entry.status = PhaseStatus::Retrying;
                        run.trace.entries.push(entry);
                        run.emit_stage(stage_id, PhaseStatus::Retrying, attempt, duration_ms, usage);

                        let backoff = self.retry.next_backoff(attempt);
                        warn!(
                            stage = %stage_id,
                            attempt,
                            max_attempts = state.max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "transient stage failure, retrying"
                        );
                        if sleep_or_cancel(backoff, &run.ctx.cancel).await {
                            return Err(Halt::Fail(AgentError::cancelled(stage_id)));
                        }
                        continue;
                    }

                    entry.status = PhaseStatus::Failed;
                    run.trace.entries.push(entry);
                    run.emit_stage(stage_id, PhaseStatus::Failed, attempt, duration_ms, usage);

                    return Err(match recovery {
                        Recovery::Abort if err.is_transient() => {
                            Halt::Fail(retry::exhausted(err, state.attempts))
                        }
                        Recovery::Clarify => Halt::from(err),
                        _ => Halt::Fail(err),
                    });
                }
            }
        }
    }
}

/// Last result before `before` that touched `path`.
pub(crate) fn latest_on_path<'a>(
    results: &'a [ExecutionResult],
    path: &str,
    before: usize,
) -> Option<&'a ExecutionResult> {
    results[..before.min(results.len())].iter().rev().find(|r| r.path == path)
}

/// Fold the file a step read from the repository into the request context.
fn absorb_source(run: &mut Run, result: &ExecutionResult) {
    let Some(original) = &result.original_content else {
        return;
    };
    if run.accumulated.absorb_file(&result.path, original) {
        debug!(path = %result.path, total = run.accumulated.chunks.len(), "target file absorbed");
    }
}
