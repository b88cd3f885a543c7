//! Validate-and-fix loop.
//!
//! Every executed step is validated once. While actionable issues remain
//! and the iteration budget allows, the highest-severity issue (earliest
//! plan step on ties) is targeted: its step is re-executed with the issue
//! as input and then re-validated. An issue that comes back after being
//! targeted or resolved means the fixes are oscillating and the request is
//! aborted.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{latest_on_path, AttemptTag, Conductor, Halt, Run};
use crate::domain::errors::{AgentError, ErrorKind};
use crate::domain::models::{
    ExecutionResult, IssueSeverity, IssueStatus, Observation, Phase, PipelineEvent, Plan,
    ProcessOutcome, RetrievedContext, StageId, ValidationIssue,
};
use crate::services::precision_edit::unified_diff;
use crate::services::stage::{ExecutionInput, ValidationInput};
use crate::services::validator::established_decisions;

impl Conductor {
    pub(super) async fn validate_and_fix(
        &self,
        run: &mut Run,
        plan: &Plan,
        context: &Arc<RetrievedContext>,
        mut results: Vec<ExecutionResult>,
    ) -> Result<ProcessOutcome, Halt> {
        run.transition(Phase::Validate);
        let max_iterations = self.config.fix_loop.max_iterations.max(1);
        let mut iteration = 1;

        let mut issues = Vec::with_capacity(results.len());
        for result in &results {
            issues.push(self.validate_step(run, result, context, iteration).await?);
        }

        loop {
            let actionable = prioritize(&issues, plan);
            if actionable.is_empty() {
                let warnings = issues.into_iter().flatten().collect();
                return Ok(ProcessOutcome::Completed {
                    artifacts: results,
                    warnings,
                    written: false,
                });
            }

            if iteration >= max_iterations {
                let diagnosis = validation_failure(&actionable, iteration);
                warn!(iterations = iteration, unresolved = actionable.len(), error = %diagnosis, "fix loop exhausted");
                return Ok(ProcessOutcome::FixLoopExhausted {
                    artifacts: results,
                    unresolved: actionable,
                    iterations: iteration,
                    diagnosis,
                });
            }

            let target = actionable[0].clone();
            let (index, step) = match (
                results.iter().position(|r| r.step_id == target.step_id),
                plan.step(&target.step_id),
            ) {
                (Some(index), Some(step)) => (index, step.clone()),
                _ => {
                    return Err(Halt::Fail(AgentError::new(
                        StageId::Validation,
                        ErrorKind::ContradictionDetected,
                        format!("issue {} refers to unknown step {}", target.signature, target.step_id),
                    )))
                }
            };

            run.transition(Phase::FixLoop);
            iteration += 1;
            run.metrics.fix_iterations += 1;
            run.accumulated.issue_history.mark_targeted(&target.signature);
            run.ctx.events.emit(PipelineEvent::FixIteration {
                request_id: run.request_id(),
                iteration,
                step_id: target.step_id.clone(),
                target_signature: target.signature.clone(),
                open_issues: actionable.len(),
            });
            info!(
                iteration,
                step_id = %target.step_id,
                signature = %target.signature,
                open = actionable.len(),
                "fixing {}",
                target.message
            );

            // A later step on the same file already holds its latest content.
            let path = results[index].path.clone();
            let input = ExecutionInput {
                step,
                context: context.clone(),
                decisions: run.accumulated.decisions.clone(),
                prior_issues: vec![target.clone()],
                previous: Some(results[index].clone()),
                predecessor: latest_on_path(&results, &path, results.len())
                    .filter(|latest| latest.step_id != target.step_id)
                    .cloned(),
                feedback: None,
            };
            let fixed = self
                .execute_step(run, input, AttemptTag::step(&target.step_id, Some(iteration)))
                .await?;
            results[index] = fixed;
            rebase_later_steps(&mut results, index);

            run.transition(Phase::Validate);
            issues[index] = self
                .validate_step(run, &results[index], context, iteration)
                .await?;
        }
    }

    /// Validate one result and fold its issues into the history. Decisions
    /// from a result without actionable issues are recorded.
    async fn validate_step(
        &self,
        run: &mut Run,
        result: &ExecutionResult,
        context: &Arc<RetrievedContext>,
        iteration: u32,
    ) -> Result<Vec<ValidationIssue>, Halt> {
        let input = ValidationInput {
            result: result.clone(),
            context: context.clone(),
            decisions: run.accumulated.decisions.clone(),
            history: run.accumulated.issue_history.clone(),
        };
        let validation = self
            .invoke(
                run,
                self.stages.validation(),
                &input,
                AttemptTag::step(&result.step_id, Some(iteration)),
            )
            .await?;

        let mut issues = validation.issues;
        let mut seen = HashSet::with_capacity(issues.len());
        let mut oscillation = None;
        for issue in &mut issues {
            let observation = run.accumulated.issue_history.observe(issue, iteration);
            seen.insert(issue.signature.clone());
            if let Observation::Reappeared(status) = observation {
                if issue.severity.is_actionable() && oscillation.is_none() {
                    oscillation = Some((issue.clone(), status));
                }
            }
        }
        let resolved = run
            .accumulated
            .issue_history
            .resolve_absent(&result.step_id, &seen);
        debug!(step_id = %result.step_id, issues = issues.len(), resolved, "step validated");

        if let Some((issue, status)) = oscillation {
            let previously = match status {
                IssueStatus::Targeted => "targeted by a fix",
                IssueStatus::Resolved => "resolved",
                IssueStatus::Open => "open",
            };
            return Err(Halt::Fail(AgentError::new(
                StageId::Validation,
                ErrorKind::ContradictionDetected,
                format!(
                    "issue {} reappeared after being {}: {}",
                    issue.signature, previously, issue.message
                ),
            )));
        }

        if !issues.iter().any(|i| i.severity.is_actionable()) {
            for decision in established_decisions(result) {
                run.accumulated.record_decision(decision);
            }
        }
        Ok(issues)
    }
}

/// Carry a fixed step's content forward to later steps on the same file,
/// so the last result on each path keeps holding the file's content.
/// Issues recorded for those steps stay until they are next validated.
fn rebase_later_steps(results: &mut [ExecutionResult], index: usize) {
    let (done, later) = results.split_at_mut(index + 1);
    let fixed = &done[index];
    for result in later.iter_mut().filter(|r| r.path == fixed.path) {
        result.new_content.clone_from(&fixed.new_content);
        result.diff = unified_diff(&result.path, result.original_content.as_deref(), &result.new_content);
        debug!(step_id = %result.step_id, from = %fixed.step_id, "rebased on fixed step");
    }
}

/// Actionable issues, highest severity first, then by plan step order.
fn prioritize(issues: &[Vec<ValidationIssue>], plan: &Plan) -> Vec<ValidationIssue> {
    let mut actionable: Vec<ValidationIssue> = issues
        .iter()
        .flatten()
        .filter(|i| i.severity.is_actionable())
        .cloned()
        .collect();
    actionable.sort_by_key(|i| {
        (
            Reverse(i.severity),
            plan.step_index(&i.step_id).unwrap_or(usize::MAX),
        )
    });
    actionable
}

fn validation_failure(actionable: &[ValidationIssue], iterations: u32) -> AgentError {
    let severity = actionable
        .iter()
        .map(|i| i.severity)
        .max()
        .unwrap_or(IssueSeverity::Major);
    AgentError::new(
        StageId::Validation,
        ErrorKind::ValidationFailure(severity),
        format!("{} actionable issue(s) left after {iterations} iteration(s)", actionable.len()),
    )
}
