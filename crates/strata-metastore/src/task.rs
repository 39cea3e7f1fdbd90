//! Task entities: deferred cleanup work leased by executors.
//!
//! A task is a TASK-typed entity whose properties carry the work payload
//! and the lease bookkeeping. Executors lease tasks through the manager's
//! `load_tasks`, which bumps `attempt_count` and stamps the executor and
//! start time under compare-and-swap; a task is leasable again once the
//! configured timeout has elapsed since its last attempt started.

use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Property key holding the numeric task type.
pub const TASK_TYPE_PROPERTY: &str = "task_type";

/// Property key holding the serialized payload of the task (for cleanup
/// tasks, the entire dropped entity).
pub const TASK_DATA_PROPERTY: &str = "data";

/// Property key holding the id of the executor that last leased the task.
pub const LAST_ATTEMPT_EXECUTOR_ID_PROPERTY: &str = "last_attempt_executor_id";

/// Property key holding the epoch-millis start of the last lease.
pub const LAST_ATTEMPT_START_TIME_PROPERTY: &str = "last_attempt_start_time";

/// Property key holding the number of lease attempts so far.
pub const ATTEMPT_COUNT_PROPERTY: &str = "attempt_count";

/// Configuration key for the task lease timeout in milliseconds.
pub const TASK_TIMEOUT_MILLIS_CONFIG: &str = "TASK_TIMEOUT_MILLIS";

/// Default task lease timeout: five minutes.
pub const DEFAULT_TASK_TIMEOUT_MILLIS: i64 = 300_000;

/// The kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncTaskType {
    /// Fan out cleanup of a dropped entity's files and children.
    EntityCleanupScheduler,
    /// Delete a single batch of files.
    FileCleanup,
}

impl AsyncTaskType {
    /// Stable numeric code stored under [`TASK_TYPE_PROPERTY`].
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::EntityCleanupScheduler => 1,
            Self::FileCleanup => 2,
        }
    }
}

/// Lease bookkeeping parsed from a task entity's properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskExecutionState {
    /// Executor that last leased the task, if any.
    pub executor_id: Option<String>,
    /// Epoch-millis start of the last lease attempt.
    pub last_attempt_start_time: i64,
    /// Number of lease attempts so far.
    pub attempt_count: u32,
}

/// Parses the lease bookkeeping out of a task entity.
///
/// Missing or malformed properties fall back to the zero state, which
/// makes the task immediately leasable.
#[must_use]
pub fn parse_task_state(task: &Entity) -> TaskExecutionState {
    TaskExecutionState {
        executor_id: task.properties.get(LAST_ATTEMPT_EXECUTOR_ID_PROPERTY).cloned(),
        last_attempt_start_time: task
            .properties
            .get(LAST_ATTEMPT_START_TIME_PROPERTY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        attempt_count: task
            .properties
            .get(ATTEMPT_COUNT_PROPERTY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    }
}

/// True when the task has never been leased or its last lease went stale.
#[must_use]
pub fn is_leasable(state: &TaskExecutionState, now_millis: i64, timeout_millis: i64) -> bool {
    state.executor_id.is_none() || now_millis - state.last_attempt_start_time > timeout_millis
}

/// Stamps a lease attempt onto a task entity's properties.
pub fn mark_attempt(task: &mut Entity, executor_id: &str, now_millis: i64) {
    let attempts = parse_task_state(task).attempt_count + 1;
    task.properties.insert(
        LAST_ATTEMPT_EXECUTOR_ID_PROPERTY.to_string(),
        executor_id.to_string(),
    );
    task.properties.insert(
        LAST_ATTEMPT_START_TIME_PROPERTY.to_string(),
        now_millis.to_string(),
    );
    task.properties
        .insert(ATTEMPT_COUNT_PROPERTY.to_string(), attempts.to_string());
}
