//! Persisted step execution history.
//!
//! One append-only row per execution attempt lives in `workflow_executions`.
//! Rows are never updated; completion is derived from the latest row that
//! actually ran the step.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::store::ExperimentStore;

/// Recorded outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The step ran and succeeded
    Completed,
    /// The step ran and failed, or could not start
    Failed,
    /// The step was already done and did not run
    Skipped,
}

impl ExecutionStatus {
    /// Stored name.
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a failed step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step reported an error of its own
    Step,
    /// A storage or internal-consistency failure surfaced through the step
    Internal,
}

impl FailureKind {
    /// Stored name.
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureKind::Step => "step",
            FailureKind::Internal => "internal",
        }
    }
}

macro_rules! text_column {
    ($ty:ty, { $($variant:path => $name:literal),+ $(,)? }) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                match value.as_str()? {
                    $($name => Ok($variant),)+
                    other => Err(FromSqlError::Other(
                        format!("unknown {} '{other}'", stringify!($ty)).into(),
                    )),
                }
            }
        }
    };
}

text_column!(ExecutionStatus, {
    ExecutionStatus::Completed => "completed",
    ExecutionStatus::Failed => "failed",
    ExecutionStatus::Skipped => "skipped",
});

text_column!(FailureKind, {
    FailureKind::Step => "step",
    FailureKind::Internal => "internal",
});

/// One row of execution history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepExecution {
    /// Row id
    pub id: i64,
    /// Engine run that produced this row
    pub run_id: String,
    /// Workflow name
    pub workflow: String,
    /// Step name
    pub step_name: String,
    /// Parameters the step ran with
    pub parameters: Value,
    /// SHA-256 of the step kind and canonical parameters
    pub params_hash: String,
    /// Outcome
    pub status: ExecutionStatus,
    /// Failure classification, for failed rows
    pub failure_kind: Option<FailureKind>,
    /// Short message
    pub message: Option<String>,
    /// Full diagnostic rendering of the error, for failed rows
    pub detail: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

/// A row to append.
#[derive(Debug, Clone)]
pub struct NewExecution<'a> {
    /// Engine run id
    pub run_id: Uuid,
    /// Workflow name
    pub workflow: &'a str,
    /// Step name
    pub step_name: &'a str,
    /// Parameters
    pub parameters: &'a Value,
    /// Parameter hash from [`params_hash`]
    pub params_hash: &'a str,
    /// Outcome
    pub status: ExecutionStatus,
    /// Failure classification
    pub failure_kind: Option<FailureKind>,
    /// Short message
    pub message: Option<&'a str>,
    /// Diagnostic detail
    pub detail: Option<&'a str>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

/// Hash identifying a step configuration.
///
/// Object keys are sorted at every depth before hashing, so equal parameters
/// hash equally regardless of the order they were written in.
pub fn params_hash(kind: &str, parameters: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical(parameters).to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Copy of `value` with every object's keys in sorted order.
///
/// `serde_json::Map` keeps insertion order when `preserve_order` is enabled
/// anywhere in the dependency graph.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Execution history backed by the store's database.
pub struct WorkflowState<'a> {
    store: &'a ExperimentStore,
}

const EXECUTION_COLUMNS: &str = "id, run_id, workflow, step_name, parameters, params_hash, status,
     failure_kind, message, detail, started_at, finished_at, elapsed_ms";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<StepExecution> {
    Ok(StepExecution {
        id: row.get(0)?,
        run_id: row.get(1)?,
        workflow: row.get(2)?,
        step_name: row.get(3)?,
        parameters: row.get(4)?,
        params_hash: row.get(5)?,
        status: row.get(6)?,
        failure_kind: row.get(7)?,
        message: row.get(8)?,
        detail: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
        elapsed_ms: row.get(12)?,
    })
}

impl<'a> WorkflowState<'a> {
    /// History view over a store.
    pub fn new(store: &'a ExperimentStore) -> Self {
        Self { store }
    }

    /// Append one execution row.
    pub fn record(&self, execution: &NewExecution<'_>) -> StoreResult<i64> {
        let elapsed_ms = (execution.finished_at - execution.started_at)
            .num_milliseconds()
            .max(0);
        let connection = self.store.connection();
        connection.execute(
            "INSERT INTO workflow_executions
                 (run_id, workflow, step_name, parameters, params_hash, status,
                  failure_kind, message, detail, started_at, finished_at, elapsed_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                execution.run_id.to_string(),
                execution.workflow,
                execution.step_name,
                execution.parameters,
                execution.params_hash,
                execution.status,
                execution.failure_kind,
                execution.message,
                execution.detail,
                execution.started_at,
                execution.finished_at,
                elapsed_ms,
            ],
        )?;
        Ok(connection.last_insert_rowid())
    }

    /// True if the last time the step actually ran, it completed with these parameters.
    pub fn is_completed(&self, step_name: &str, params_hash: &str) -> StoreResult<bool> {
        Ok(self
            .last_run(step_name)?
            .is_some_and(|run| run.status == ExecutionStatus::Completed && run.params_hash == params_hash))
    }

    /// Latest row in which the step ran (completed or failed), ignoring skips.
    pub fn last_run(&self, step_name: &str) -> StoreResult<Option<StepExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
             WHERE step_name = ?1 AND status != 'skipped'
             ORDER BY id DESC LIMIT 1"
        );
        Ok(self
            .store
            .connection()
            .query_row(&sql, params![step_name], execution_from_row)
            .optional()?)
    }

    /// Every row for the step, oldest first.
    pub fn get_step_history(&self, step_name: &str) -> StoreResult<Vec<StepExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
             WHERE step_name = ?1 ORDER BY id"
        );
        let connection = self.store.connection();
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![step_name], execution_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every row written by one engine run, in order.
    pub fn run_history(&self, run_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
             WHERE run_id = ?1 ORDER BY id"
        );
        let connection = self.store.connection();
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(params![run_id.to_string()], execution_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use serde_json::json;
    use tempfile::TempDir;

    fn execution<'a>(
        step_name: &'a str,
        parameters: &'a Value,
        hash: &'a str,
        status: ExecutionStatus,
    ) -> NewExecution<'a> {
        let now = Utc::now();
        NewExecution {
            run_id: Uuid::new_v4(),
            workflow: "pipeline",
            step_name,
            parameters,
            params_hash: hash,
            status,
            failure_kind: None,
            message: None,
            detail: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn hash_ignores_key_order_but_not_kind() {
        let a = json!({"diameter": 30, "model": "cyto"});
        let b: Value = serde_json::from_str(r#"{"model": "cyto", "diameter": 30}"#).unwrap();
        assert_eq!(params_hash("segment", &a), params_hash("segment", &b));
        assert_ne!(params_hash("segment", &a), params_hash("threshold", &a));
        assert_eq!(params_hash("segment", &a).len(), 64);
    }

    #[test]
    fn hash_sorts_nested_objects() {
        let a = json!({"model": {"name": "cyto3", "gpu": false}, "channels": [{"b": 1, "a": 2}]});
        let b: Value = serde_json::from_str(
            r#"{"channels": [{"a": 2, "b": 1}], "model": {"gpu": false, "name": "cyto3"}}"#,
        )
        .unwrap();
        assert_eq!(params_hash("segment", &a), params_hash("segment", &b));

        let different_value = json!({"model": {"name": "cyto3", "gpu": false}, "channels": [{"b": 2, "a": 1}]});
        assert_ne!(params_hash("segment", &a), params_hash("segment", &different_value));
    }

    #[test]
    fn completion_tracks_latest_real_run() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::create(dir.path(), &Settings::default()).unwrap();
        let state = WorkflowState::new(&store);
        let parameters = json!({});
        let hash = params_hash("import", &parameters);

        assert!(!state.is_completed("import", &hash).unwrap());

        state
            .record(&execution("import", &parameters, &hash, ExecutionStatus::Completed))
            .unwrap();
        state
            .record(&execution("import", &parameters, &hash, ExecutionStatus::Skipped))
            .unwrap();
        assert!(state.is_completed("import", &hash).unwrap());
        assert!(!state.is_completed("import", "other-hash").unwrap());

        state
            .record(&execution("import", &parameters, &hash, ExecutionStatus::Failed))
            .unwrap();
        assert!(!state.is_completed("import", &hash).unwrap());

        let history = state.get_step_history("import").unwrap();
        let statuses: Vec<ExecutionStatus> = history.iter().map(|row| row.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Completed,
                ExecutionStatus::Skipped,
                ExecutionStatus::Failed
            ]
        );
        assert_eq!(
            state.last_run("import").unwrap().map(|row| row.status),
            Some(ExecutionStatus::Failed)
        );
    }
}
