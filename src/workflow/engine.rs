//! Sequential workflow execution.
//!
//! The engine walks a validated [`WorkflowDag`] in execution order and drives
//! each step through a small state machine. History is appended through
//! [`WorkflowState`] after every step that reaches `completed`, `failed` or
//! `skipped`; blocked steps never start and write nothing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use super::dag::{StepDefinition, WorkflowDag};
use super::state::{params_hash, ExecutionStatus, FailureKind, NewExecution, WorkflowState};
use super::step::{Step, StepContext, StepRegistry};
use crate::error::{ErrorCategory, StoreError, StoreResult};
use crate::store::ExperimentStore;

/// Per-run status of a single step.
///
/// # State Machine
///
/// ```text
/// Pending ──start──> Running ──ok───> Completed
///    │                  │
///    │                  └──err──> Failed
///    │
///    ├──already done──> Skipped
///    │
///    └──dependency failed──> Blocked
/// ```
///
/// Every terminal state is final for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet considered
    Pending,
    /// Executing
    Running,
    /// Executed successfully
    Completed,
    /// Executed and failed, or could not start
    Failed,
    /// Already done with the same parameters
    Skipped,
    /// A dependency failed or was itself blocked
    Blocked,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Blocked => write!(f, "blocked"),
        }
    }
}

impl StepStatus {
    /// True once no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match self {
            StepStatus::Pending => matches!(
                next,
                StepStatus::Running
                    | StepStatus::Failed
                    | StepStatus::Skipped
                    | StepStatus::Blocked
            ),
            StepStatus::Running => matches!(next, StepStatus::Completed | StepStatus::Failed),
            _ => false,
        }
    }
}

/// How one step ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Ran to completion, with the step's optional message
    Completed { message: Option<String> },
    /// Ran and failed, or its inputs were missing
    Failed { kind: FailureKind, message: String },
    /// Already completed with the same parameters
    Skipped,
    /// Not executed because `dependency` failed or was blocked
    Blocked { dependency: String },
}

impl StepOutcome {
    /// Terminal status this outcome represents.
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Completed { .. } => StepStatus::Completed,
            StepOutcome::Failed { .. } => StepStatus::Failed,
            StepOutcome::Skipped => StepStatus::Skipped,
            StepOutcome::Blocked { .. } => StepStatus::Blocked,
        }
    }
}

/// Result for one step of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    /// Step name
    pub name: String,
    /// Step kind
    pub kind: String,
    /// Outcome
    pub outcome: StepOutcome,
    /// History row written for this step, if any
    pub execution_id: Option<i64>,
}

/// Summary of an engine run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Id recorded on every history row of this run
    pub run_id: Uuid,
    /// Workflow name
    pub workflow: String,
    /// Step reports in execution order
    pub steps: Vec<StepReport>,
}

impl RunReport {
    fn count(&self, status: StepStatus) -> usize {
        self.steps
            .iter()
            .filter(|step| step.outcome.status() == status)
            .count()
    }

    /// Steps that executed successfully.
    pub fn steps_completed(&self) -> usize {
        self.count(StepStatus::Completed)
    }

    /// Steps that failed.
    pub fn steps_failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    /// Steps skipped as already done.
    pub fn steps_skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    /// Steps blocked by an upstream failure.
    pub fn steps_blocked(&self) -> usize {
        self.count(StepStatus::Blocked)
    }

    /// Steps in the workflow.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Report for one step.
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// True when nothing failed or was blocked.
    pub fn is_success(&self) -> bool {
        self.steps_failed() == 0 && self.steps_blocked() == 0
    }
}

/// Executes workflows using a fixed set of step implementations.
pub struct WorkflowEngine<'r> {
    registry: &'r StepRegistry,
}

struct RunContext<'a> {
    run_id: Uuid,
    workflow: &'a str,
    statuses: HashMap<String, StepStatus>,
    executed: HashSet<String>,
    available: BTreeSet<String>,
}

impl RunContext<'_> {
    fn advance(&mut self, step: &str, next: StepStatus) {
        let current = self
            .statuses
            .get(step)
            .copied()
            .unwrap_or(StepStatus::Pending);
        debug_assert!(
            current.can_transition_to(next),
            "illegal step transition {current} -> {next} for '{step}'"
        );
        self.statuses.insert(step.to_string(), next);
    }

    fn failed_dependency(&self, dag: &WorkflowDag, step: &str) -> Option<String> {
        dag.dependencies(step)
            .into_iter()
            .find(|dep| {
                matches!(
                    self.statuses.get(*dep),
                    Some(StepStatus::Failed | StepStatus::Blocked)
                )
            })
            .map(str::to_string)
    }
}

impl<'r> WorkflowEngine<'r> {
    /// Engine resolving step kinds through `registry`.
    pub fn new(registry: &'r StepRegistry) -> Self {
        Self { registry }
    }

    /// Run every step of `dag` against `store`.
    ///
    /// Graph problems and unregistered kinds fail the whole call before any
    /// step starts. Step failures are recorded and reported; steps depending on
    /// a failed step are blocked while independent branches continue.
    pub fn run(&self, dag: &WorkflowDag, store: &mut ExperimentStore) -> StoreResult<RunReport> {
        let available = store.available_products()?;
        let issues = dag.validate_against(&available);
        if !issues.is_empty() {
            return Err(StoreError::DagValidation(issues));
        }
        for definition in dag.steps() {
            self.registry.get(&definition.kind)?;
        }
        let order = dag.execution_order()?;

        let mut run = RunContext {
            run_id: Uuid::new_v4(),
            workflow: dag.name(),
            statuses: HashMap::new(),
            executed: HashSet::new(),
            available,
        };
        info!(
            workflow = dag.name(),
            run_id = %run.run_id,
            steps = order.len(),
            "Starting workflow run"
        );

        let mut reports = Vec::with_capacity(order.len());
        for name in &order {
            let Some(definition) = dag.step(name) else {
                return Err(StoreError::UnknownStep(name.clone()));
            };
            let step = self.registry.get(&definition.kind)?;
            let span = info_span!(
                "workflow_step",
                step = %definition.name,
                kind = %definition.kind,
                run_id = %run.run_id
            );
            let _enter = span.enter();
            reports.push(self.run_step(dag, definition, step, store, &mut run)?);
        }

        let report = RunReport {
            run_id: run.run_id,
            workflow: dag.name().to_string(),
            steps: reports,
        };
        info!(
            workflow = %report.workflow,
            run_id = %report.run_id,
            completed = report.steps_completed(),
            failed = report.steps_failed(),
            skipped = report.steps_skipped(),
            blocked = report.steps_blocked(),
            "Workflow run finished"
        );
        Ok(report)
    }

    fn run_step(
        &self,
        dag: &WorkflowDag,
        definition: &StepDefinition,
        step: &dyn Step,
        store: &mut ExperimentStore,
        run: &mut RunContext<'_>,
    ) -> StoreResult<StepReport> {
        let name = definition.name.as_str();
        let hash = params_hash(&definition.kind, &definition.parameters);
        let report = |outcome, execution_id| StepReport {
            name: definition.name.clone(),
            kind: definition.kind.clone(),
            outcome,
            execution_id,
        };

        if let Some(dependency) = run.failed_dependency(dag, name) {
            warn!(dependency = %dependency, "Step blocked by failed dependency");
            run.advance(name, StepStatus::Blocked);
            return Ok(report(StepOutcome::Blocked { dependency }, None));
        }

        let upstream_ran = dag
            .ancestors(name)
            .iter()
            .any(|ancestor| run.executed.contains(ancestor));
        let state = WorkflowState::new(store);
        if !upstream_ran && state.is_completed(name, &hash)? {
            let now = Utc::now();
            let id = state.record(&NewExecution {
                run_id: run.run_id,
                workflow: run.workflow,
                step_name: name,
                parameters: &definition.parameters,
                params_hash: &hash,
                status: ExecutionStatus::Skipped,
                failure_kind: None,
                message: Some("already completed with identical parameters"),
                detail: None,
                started_at: now,
                finished_at: now,
            })?;
            info!("Step already completed, skipping");
            run.advance(name, StepStatus::Skipped);
            run.available.extend(definition.outputs.iter().cloned());
            return Ok(report(StepOutcome::Skipped, Some(id)));
        }

        let missing: Vec<&str> = definition
            .inputs
            .iter()
            .filter(|input| !run.available.contains(*input))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() || !step.can_run(store, &definition.parameters) {
            let message = if missing.is_empty() {
                "step preconditions not met".to_string()
            } else {
                format!("missing inputs: {}", missing.join(", "))
            };
            let now = Utc::now();
            let id = state.record(&NewExecution {
                run_id: run.run_id,
                workflow: run.workflow,
                step_name: name,
                parameters: &definition.parameters,
                params_hash: &hash,
                status: ExecutionStatus::Failed,
                failure_kind: Some(FailureKind::Step),
                message: Some(&message),
                detail: None,
                started_at: now,
                finished_at: now,
            })?;
            warn!(reason = %message, "Step cannot run");
            run.advance(name, StepStatus::Failed);
            return Ok(report(
                StepOutcome::Failed {
                    kind: FailureKind::Step,
                    message,
                },
                Some(id),
            ));
        }

        run.advance(name, StepStatus::Running);
        info!("Executing step");
        let ctx = StepContext {
            step_name: name,
            parameters: &definition.parameters,
            run_id: run.run_id,
        };
        let started_at = Utc::now();
        let result = step.execute(store, &ctx);
        let finished_at = Utc::now();
        run.executed.insert(name.to_string());

        let state = WorkflowState::new(store);
        match result {
            Ok(message) => {
                let id = state.record(&NewExecution {
                    run_id: run.run_id,
                    workflow: run.workflow,
                    step_name: name,
                    parameters: &definition.parameters,
                    params_hash: &hash,
                    status: ExecutionStatus::Completed,
                    failure_kind: None,
                    message: message.as_deref(),
                    detail: None,
                    started_at,
                    finished_at,
                })?;
                info!(
                    elapsed_ms = (finished_at - started_at).num_milliseconds(),
                    "Step completed"
                );
                run.advance(name, StepStatus::Completed);
                run.available.extend(definition.outputs.iter().cloned());
                Ok(report(StepOutcome::Completed { message }, Some(id)))
            }
            Err(err) => {
                let kind = classify_failure(&err);
                let message = err.to_string();
                let detail = format!("{err:?}");
                let id = state.record(&NewExecution {
                    run_id: run.run_id,
                    workflow: run.workflow,
                    step_name: name,
                    parameters: &definition.parameters,
                    params_hash: &hash,
                    status: ExecutionStatus::Failed,
                    failure_kind: Some(kind),
                    message: Some(&message),
                    detail: Some(&detail),
                    started_at,
                    finished_at,
                })?;
                warn!(failure_kind = kind.as_str(), error = %message, "Step failed");
                run.advance(name, StepStatus::Failed);
                Ok(report(StepOutcome::Failed { kind, message }, Some(id)))
            }
        }
    }
}

/// Storage-layer failures anywhere in the error chain are `internal`.
fn classify_failure(err: &anyhow::Error) -> FailureKind {
    let internal = err.chain().any(|cause| {
        cause
            .downcast_ref::<StoreError>()
            .is_some_and(|store_err| store_err.category() == ErrorCategory::Internal)
    });
    if internal {
        FailureKind::Internal
    } else {
        FailureKind::Step
    }
}
