//! Core types for the task graph engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type TaskId = i64;
pub type AttemptId = i64;
pub type QueueId = i64;
pub type ResourceTypeId = i64;
/// Queued item id. Lock rows share the id of the item they guard.
pub type ItemId = i64;

/// Dispatch priority (higher = acquired first). Default is 0.
pub type Priority = i32;

pub const PRIORITY_DEFAULT: Priority = 0;

/// Name of the queue tasks go to when their policy doesn't name one.
pub const DEFAULT_QUEUE: &str = "default";

// Task state flags.
pub const TASK_FLAG_CANCEL_REQUESTED: i64 = 1;
/// Execution failed for good; ERROR is applied when the task leaves PLANNED.
pub const TASK_FLAG_DELAYED_ERROR: i64 = 2;
/// Copied as SUCCESS from a previous attempt.
pub const TASK_FLAG_RESUMED: i64 = 4;

// Attempt state flags. 0 means running or blocked.
pub const ATTEMPT_FLAG_CANCEL_REQUESTED: i64 = 1;
pub const ATTEMPT_FLAG_DONE: i64 = 2;
pub const ATTEMPT_FLAG_SUCCESS: i64 = 4;

/// State of a task within an attempt.
///
/// Legal transitions:
/// - Blocked -> Ready | Planned (group) | Error (short-circuit) | Canceled
/// - Ready -> Running | Canceled
/// - RetryWaiting -> Ready | Canceled
/// - Running -> Planned | RetryWaiting | Error
/// - Planned -> Success | Error | GroupError | Canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Blocked,
    Ready,
    RetryWaiting,
    Running,
    Planned,
    GroupError,
    Success,
    Error,
    Canceled,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Blocked,
        TaskState::Ready,
        TaskState::RetryWaiting,
        TaskState::Running,
        TaskState::Planned,
        TaskState::GroupError,
        TaskState::Success,
        TaskState::Error,
        TaskState::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Blocked => "blocked",
            TaskState::Ready => "ready",
            TaskState::RetryWaiting => "retry_waiting",
            TaskState::Running => "running",
            TaskState::Planned => "planned",
            TaskState::GroupError => "group_error",
            TaskState::Success => "success",
            TaskState::Error => "error",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        TaskState::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Error | TaskState::GroupError | TaskState::Canceled
        )
    }

    pub fn is_error(self) -> bool {
        matches!(self, TaskState::Error | TaskState::GroupError)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            Blocked => matches!(next, Ready | Planned | Error | Canceled),
            Ready => matches!(next, Running | Canceled),
            RetryWaiting => matches!(next, Ready | Canceled),
            Running => matches!(next, Planned | RetryWaiting | Error),
            Planned => matches!(next, Success | Error | GroupError | Canceled),
            GroupError | Success | Error | Canceled => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of task node. Groups only aggregate their children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Action,
    Group,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Action => "action",
            TaskType::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "action" => Some(TaskType::Action),
            "group" => Some(TaskType::Group),
            _ => None,
        }
    }
}

/// How retry intervals grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    #[default]
    Constant,
    Exponential,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Constant => "constant",
            IntervalType::Exponential => "exponential",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "constant" => Some(IntervalType::Constant),
            "exponential" => Some(IntervalType::Exponential),
            _ => None,
        }
    }
}

/// Per-task retry settings supplied by the workflow compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first failure.
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default)]
    pub interval_type: IntervalType,
}

/// Engine-interpreted part of a task's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPolicy {
    pub queue: String,
    pub resource_type: Option<String>,
    pub priority: Priority,
    pub retry: RetryConfig,
    pub ignore_child_errors: bool,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            resource_type: None,
            priority: PRIORITY_DEFAULT,
            retry: RetryConfig::default(),
            ignore_child_errors: false,
        }
    }
}

/// What a downstream task does when an upstream ends in ERROR or GROUP_ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Short-circuit the downstream task to ERROR.
    #[default]
    Fail,
    /// Treat the failed upstream as satisfied.
    Ignore,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Fail => "fail",
            ErrorPolicy::Ignore => "ignore",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fail" => Some(ErrorPolicy::Fail),
            "ignore" => Some(ErrorPolicy::Ignore),
            _ => None,
        }
    }
}

/// What a downstream task does when an upstream ends in CANCELED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Downstream becomes CANCELED.
    #[default]
    Cancel,
    /// Downstream becomes ERROR.
    Fail,
    /// Treat the canceled upstream as satisfied.
    Ignore,
}

impl CancelPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelPolicy::Cancel => "cancel",
            CancelPolicy::Fail => "fail",
            CancelPolicy::Ignore => "ignore",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cancel" => Some(CancelPolicy::Cancel),
            "fail" => Some(CancelPolicy::Fail),
            "ignore" => Some(CancelPolicy::Ignore),
            _ => None,
        }
    }
}

/// One task node of an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub attempt_id: AttemptId,
    pub parent_id: Option<TaskId>,
    pub name: String,
    pub task_type: TaskType,
    pub state: TaskState,
    pub state_flags: i64,
    pub config: Value,
    pub carry_params: Value,
    pub state_params: Value,
    pub result: Option<Value>,
    pub error: Option<ErrorReport>,
    pub policy: TaskPolicy,
    pub created_at: i64,
    pub updated_at: i64,
    pub retry_at: Option<i64>,
}

impl Task {
    pub fn has_flag(&self, flag: i64) -> bool {
        self.state_flags & flag != 0
    }

    pub fn is_group(&self) -> bool {
        self.task_type == TaskType::Group
    }
}

/// A dependency edge: downstream waits for upstream to be terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub upstream_id: TaskId,
    pub downstream_id: TaskId,
    pub on_error: ErrorPolicy,
    pub on_canceled: CancelPolicy,
}

/// Derived status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Canceling,
    Success,
    Error,
    Canceled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Canceling => "canceling",
            AttemptStatus::Success => "success",
            AttemptStatus::Error => "error",
            AttemptStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root container of one execution of a task tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub name: String,
    pub state_flags: i64,
    pub root_task_id: Option<TaskId>,
    pub params: Value,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl Attempt {
    pub fn has_flag(&self, flag: i64) -> bool {
        self.state_flags & flag != 0
    }

    pub fn is_done(&self) -> bool {
        self.has_flag(ATTEMPT_FLAG_DONE)
    }

    pub fn status(&self) -> AttemptStatus {
        let canceling = self.has_flag(ATTEMPT_FLAG_CANCEL_REQUESTED);
        if !self.is_done() {
            return if canceling {
                AttemptStatus::Canceling
            } else {
                AttemptStatus::Running
            };
        }
        if self.has_flag(ATTEMPT_FLAG_SUCCESS) {
            AttemptStatus::Success
        } else if canceling {
            AttemptStatus::Canceled
        } else {
            AttemptStatus::Error
        }
    }
}

/// A dispatch queue with a global concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    pub max_concurrency: i32,
}

/// Lock table selection for a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Up to `max_concurrency` holders at once.
    #[default]
    Shared,
    /// A single holder regardless of the configured cap.
    Exclusive,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "shared" => Some(LockMode::Shared),
            "exclusive" => Some(LockMode::Exclusive),
            _ => None,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            LockMode::Shared => "queued_shared_task_locks",
            LockMode::Exclusive => "queued_task_locks",
        }
    }
}

/// A named sub-pool within a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub queue_id: QueueId,
    pub name: String,
    pub max_concurrency: i32,
    pub mode: LockMode,
}

impl ResourceType {
    /// Cap actually enforced at acquisition.
    pub fn effective_concurrency(&self) -> i32 {
        match self.mode {
            LockMode::Shared => self.max_concurrency,
            LockMode::Exclusive => 1,
        }
    }
}

/// One dispatchable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: ItemId,
    pub queue_id: QueueId,
    pub priority: Priority,
    pub resource_type_id: Option<ResourceTypeId>,
    pub task_id: TaskId,
    pub data: Value,
    pub created_at: i64,
}

/// Lock row guarding a queued item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub item_id: ItemId,
    pub queue_id: QueueId,
    pub priority: Priority,
    pub resource_type_id: Option<ResourceTypeId>,
    pub retry_count: i32,
    pub hold_expire_time: Option<i64>,
    pub hold_agent_id: Option<String>,
    pub mode: LockMode,
}

impl Lock {
    /// Held by an agent whose lease has not expired.
    pub fn is_held_at(&self, now: i64) -> bool {
        self.hold_agent_id.is_some() && self.hold_expire_time.is_some_and(|t| t > now)
    }

    pub fn is_acquirable_at(&self, now: i64) -> bool {
        self.hold_expire_time.is_none_or(|t| t <= now)
    }
}

/// A granted lock, handed to the worker that won it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub item_id: ItemId,
    pub task_id: TaskId,
    pub queue_id: QueueId,
    pub resource_type_id: Option<ResourceTypeId>,
    pub agent_id: String,
    pub expire_time: i64,
    pub retry_count: i32,
    pub mode: LockMode,
    pub data: Value,
}

/// How a holder gives a lock back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Execution acknowledged; item and lock are deleted.
    Success,
    /// Terminal failure; item and lock are deleted.
    Failure,
    /// Clear the holder and bump `retry_count`. The row stays parked until
    /// `not_before` when given.
    Retry { not_before: Option<i64> },
}

/// One failed task in an error report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub task_id: TaskId,
    pub task_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Error report of a task. Groups concatenate their children's reports in
/// creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub entries: Vec<ErrorEntry>,
}

impl ErrorReport {
    pub fn single(task_id: TaskId, task_name: &str, message: impl Into<String>, details: Value) -> Self {
        Self {
            entries: vec![ErrorEntry {
                task_id,
                task_name: task_name.to_string(),
                message: message.into(),
                details,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: ErrorReport) {
        self.entries.extend(other.entries);
    }
}

/// Successful output of the execution layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Params handed to downstream tasks.
    #[serde(default)]
    pub carry_params: Value,
    #[serde(default)]
    pub output: Value,
    /// Tasks generated at run time, inserted as children of the action.
    /// Siblings may reference each other's keys as upstreams.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<TaskTreeInput>,
}

/// Failure reported by the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    #[serde(default)]
    pub details: Value,
    /// Overrides the task's own retry interval for this failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_secs: Option<u64>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Value::Null,
            retry_interval_secs: None,
        }
    }
}

/// Upstream reference in a compiled task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamInput {
    pub key: String,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default)]
    pub on_canceled: CancelPolicy,
}

/// Compiled task tree handed over by the workflow compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTreeInput {
    /// Reference key for upstream edges. Defaults to `name`.
    pub key: Option<String>,
    pub name: String,
    /// Defaults to `group` when children are present, else `action`.
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub config: Value,
    pub queue: Option<String>,
    pub resource_type: Option<String>,
    pub priority: Option<Priority>,
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub ignore_child_errors: bool,
    #[serde(default)]
    pub upstreams: Vec<UpstreamInput>,
    #[serde(default)]
    pub children: Vec<TaskTreeInput>,
}

impl TaskTreeInput {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }

    pub fn resolved_type(&self) -> TaskType {
        self.task_type.unwrap_or(if self.children.is_empty() {
            TaskType::Action
        } else {
            TaskType::Group
        })
    }

    pub fn policy(&self) -> TaskPolicy {
        TaskPolicy {
            queue: self.queue.clone().unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            resource_type: self.resource_type.clone(),
            priority: self.priority.unwrap_or(PRIORITY_DEFAULT),
            retry: self.retry.clone().unwrap_or_default(),
            ignore_child_errors: self.ignore_child_errors,
        }
    }
}
