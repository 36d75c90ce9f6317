//! Task - パイプラインを流れる作業単位
//!
//! Payload は生成後に変更しない。status / result は dequeue したワーカー
//! だけが書き込み、submit 側は snapshot か完了通知で読むだけ。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::ids::TaskId;

/// Opaque request body (string keys to JSON values).
pub type Payload = serde_json::Map<String, Value>;

/// Keys owned by the snapshot itself; payload fields with these names are not echoed.
const RESERVED_KEYS: [&str; 6] = [
    "task_id",
    "task_status",
    "task_results",
    "task_error",
    "created_at",
    "finished_at",
];

/// Task status.
///
/// State transitions:
/// - waiting -> running -> finished | failed
/// - waiting -> finished | failed (a strategy may skip `running`)
///
/// Nothing ever returns to `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Finished,
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Waiting, TaskStatus::Running) => true,
            (TaskStatus::Waiting | TaskStatus::Running, TaskStatus::Finished | TaskStatus::Failed) => {
                true
            }
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is already {status}; result is frozen")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },
}

/// Mutable half of a task.
#[derive(Debug, Clone)]
struct Progress {
    status: TaskStatus,
    result: Option<Value>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// One unit of submitted work.
///
/// `progress` は watch チャネルで持つ。書き込み側（ワーカー）が更新すると
/// `wait_terminal()` で待っている submit 側が起こされる。
pub struct Task {
    id: TaskId,
    payload: Payload,
    created_at: DateTime<Utc>,
    progress: watch::Sender<Progress>,
}

impl Task {
    pub fn new(id: TaskId, payload: Payload, created_at: DateTime<Utc>) -> Self {
        let (progress, _) = watch::channel(Progress {
            status: TaskStatus::Waiting,
            result: None,
            error: None,
            finished_at: None,
        });
        Self {
            id,
            payload,
            created_at,
            progress,
        }
    }

    /// New task with a fresh id, stamped now.
    pub fn create(payload: Payload) -> Self {
        Self::new(TaskId::generate(), payload, Utc::now())
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        self.progress.borrow().status
    }

    /// `task_type` field of the payload, or "" when absent.
    pub fn task_type(&self) -> &str {
        self.payload_str("task_type")
    }

    /// `model_name` field of the payload, or "" when absent.
    pub fn model_name(&self) -> &str {
        self.payload_str("model_name")
    }

    fn payload_str(&self, key: &str) -> &str {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn set_running(&self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Running, None)
    }

    pub fn set_finished(&self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Finished, None)
    }

    pub fn set_failed(&self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed, Some(reason.into()))
    }

    /// Store the outcome. Only allowed before the task is terminal.
    pub fn set_result(&self, value: Value) -> Result<(), TaskError> {
        let mut outcome = Ok(());
        // result だけの更新では待機側を起こさない（status が変わった時だけ通知）
        self.progress.send_if_modified(|p| {
            if p.status.is_terminal() {
                outcome = Err(TaskError::AlreadyTerminal {
                    task_id: self.id,
                    status: p.status,
                });
            } else {
                p.result = Some(value);
            }
            false
        });
        outcome
    }

    /// `set_result` followed by `set_finished`.
    pub fn finish(&self, value: Value) -> Result<(), TaskError> {
        self.set_result(value)?;
        self.set_finished()
    }

    fn transition(&self, to: TaskStatus, error: Option<String>) -> Result<(), TaskError> {
        let mut outcome = Ok(());
        self.progress.send_if_modified(|p| {
            if !p.status.can_transition_to(to) {
                outcome = Err(TaskError::InvalidTransition {
                    task_id: self.id,
                    from: p.status,
                    to,
                });
                return false;
            }
            p.status = to;
            if to.is_terminal() {
                p.finished_at = Some(Utc::now());
            }
            if error.is_some() {
                p.error = error;
            }
            true
        });
        outcome
    }

    /// Immutable view for reporting back to the submitter.
    pub fn snapshot(&self) -> TaskSnapshot {
        let progress = self.progress.borrow().clone();
        let payload = self
            .payload
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        TaskSnapshot {
            task_id: self.id,
            task_status: progress.status,
            task_results: progress.result,
            task_error: progress.error,
            created_at: self.created_at,
            finished_at: progress.finished_at,
            payload,
        }
    }

    /// Resolve once the task reaches `finished` or `failed`.
    pub async fn wait_terminal(&self) -> TaskSnapshot {
        let mut rx = self.progress.subscribe();
        // Sender は self が持っているので、ここで閉じられることはない
        let _ = rx.wait_for(|p| p.status.is_terminal()).await;
        self.snapshot()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("payload", &self.payload)
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.id, self.task_type(), self.model_name())
    }
}

/// Point-in-time view of a task, shaped like the ingress response.
///
/// Payload fields are echoed at the top level next to the task fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub task_status: TaskStatus,
    pub task_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.task_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn payload(v: Value) -> Payload {
        match v {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn new_task_is_waiting_without_result() {
        let task = Task::create(payload(json!({"text": "hi"})));
        let snap = task.snapshot();
        assert_eq!(snap.task_status, TaskStatus::Waiting);
        assert_eq!(snap.task_results, None);
        assert_eq!(snap.finished_at, None);
    }

    #[test]
    fn finish_stores_result_and_timestamp() {
        let task = Task::create(Payload::new());
        task.set_running().unwrap();
        task.finish(json!({"ok": true})).unwrap();

        let snap = task.snapshot();
        assert_eq!(snap.task_status, TaskStatus::Finished);
        assert_eq!(snap.task_results, Some(json!({"ok": true})));
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn failed_task_keeps_reason_but_no_result() {
        let task = Task::create(Payload::new());
        task.set_failed("boom").unwrap();

        let snap = task.snapshot();
        assert_eq!(snap.task_status, TaskStatus::Failed);
        assert_eq!(snap.task_results, None);
        assert_eq!(snap.task_error.as_deref(), Some("boom"));
    }

    #[rstest]
    #[case::finished_to_failed(TaskStatus::Finished, TaskStatus::Failed)]
    #[case::failed_to_finished(TaskStatus::Failed, TaskStatus::Finished)]
    #[case::finished_to_running(TaskStatus::Finished, TaskStatus::Running)]
    #[case::running_to_running(TaskStatus::Running, TaskStatus::Running)]
    fn out_of_order_transitions_are_rejected(#[case] first: TaskStatus, #[case] second: TaskStatus) {
        let task = Task::create(Payload::new());
        let apply = |s: TaskStatus| match s {
            TaskStatus::Running => task.set_running(),
            TaskStatus::Finished => task.set_finished(),
            TaskStatus::Failed => task.set_failed("x"),
            TaskStatus::Waiting => unreachable!(),
        };

        apply(first).unwrap();
        let err = apply(second).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { from, to, .. } if from == first && to == second));
        assert_eq!(task.status(), first);
    }

    #[test]
    fn result_is_frozen_after_terminal() {
        let task = Task::create(Payload::new());
        task.finish(json!(1)).unwrap();

        let err = task.set_result(json!(2)).unwrap_err();
        assert!(matches!(err, TaskError::AlreadyTerminal { status: TaskStatus::Finished, .. }));
        assert_eq!(task.snapshot().task_results, Some(json!(1)));
    }

    #[test]
    fn snapshot_of_terminal_task_is_stable() {
        let task = Task::create(payload(json!({"keyword": "k"})));
        task.finish(json!("done")).unwrap();

        assert_eq!(task.snapshot(), task.snapshot());
    }

    #[test]
    fn snapshot_echoes_payload_fields_at_top_level() {
        let task = Task::create(payload(json!({
            "task_type": "rebuild",
            "message": "hello",
            "task_status": "spoofed",
        })));
        task.finish(json!([1, 2])).unwrap();

        let v = serde_json::to_value(task.snapshot()).unwrap();
        assert_eq!(v["task_type"], "rebuild");
        assert_eq!(v["message"], "hello");
        assert_eq!(v["task_status"], "finished");
        assert_eq!(v["task_results"], json!([1, 2]));
        assert_eq!(v["task_id"], task.id().as_ulid().to_string());
        assert!(v.get("task_error").is_none());
    }

    #[test]
    fn display_uses_type_and_model() {
        let task = Task::create(payload(json!({"task_type": "t", "model_name": "m"})));
        assert_eq!(task.to_string(), format!("{}:t:m", task.id()));

        let bare = Task::create(Payload::new());
        assert_eq!(bare.to_string(), format!("{}::", bare.id()));
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_completion() {
        let task = Arc::new(Task::create(Payload::new()));

        let waiter = tokio::spawn({
            let task = Arc::clone(&task);
            async move { task.wait_terminal().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        task.set_running().unwrap();
        task.finish(json!("ok")).unwrap();

        let snap = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.task_status, TaskStatus::Finished);
        assert_eq!(snap.task_results, Some(json!("ok")));
    }

    #[tokio::test]
    async fn wait_terminal_returns_immediately_when_already_done() {
        let task = Task::create(Payload::new());
        task.set_failed("nope").unwrap();

        let snap = tokio::time::timeout(Duration::from_millis(100), task.wait_terminal())
            .await
            .unwrap();
        assert_eq!(snap.task_status, TaskStatus::Failed);
    }
}
