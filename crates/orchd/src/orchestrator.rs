//! Operation Orchestrator (Section 4.7): enqueueOp, the per-project
//! single-flight lock, step bookkeeping, and finalization.

use chrono::Utc;
use orch_core::{
    Delivery, EventKind, Id, OpKind, OpStatus, Operation, Project, ProjectPhase, Step,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::bus::{BusError, MessageBus};
use crate::event_hub::OpEventHub;
use crate::storage::{Storage, StorageError};

/// Entry subject per op kind (Section 4.3 "Start-subject selection").
pub fn start_subject(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Create | OpKind::Update | OpKind::Delete => "op.start",
        OpKind::Ci => "bootstrap.done",
        OpKind::Deploy => "deployment.start",
        OpKind::Promote | OpKind::Release | OpKind::Rollback => "promotion.start",
    }
}

/// Active-operation conflict (Section 4.7 step 2, Section 7).
#[derive(Debug, Clone, Serialize)]
pub struct ConflictError {
    pub reason: String,
    pub active_op: Operation,
    pub requested_kind: OpKind,
}

/// Enqueue failure (Section 4.7 step 5, Section 7).
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueError {
    pub op_id: Id,
    pub project_id: Id,
    pub reason: String,
    pub next_step: String,
    pub project_rolled_back: Option<bool>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("project operation conflict")]
    Conflict(Box<ConflictError>),
    #[error("enqueue failed: {0}")]
    Enqueue(Box<EnqueueError>),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Options accompanying `enqueue_op`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delivery: Option<Delivery>,
    pub payload: serde_json::Value,
}

/// Per-project named mutex map plus the collaborators the orchestrator drives.
pub struct Orchestrator {
    storage: Arc<Storage>,
    bus: Arc<MessageBus>,
    event_hub: Arc<OpEventHub>,
    history_cap: usize,
    project_locks: Mutex<HashMap<Id, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        bus: Arc<MessageBus>,
        event_hub: Arc<OpEventHub>,
        history_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            bus,
            event_hub,
            history_cap,
            project_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn event_hub(&self) -> &Arc<OpEventHub> {
        &self.event_hub
    }

    /// Per-project named mutex, created on demand under the outer map mutex
    /// (Section 4.7 step 1, Section 9 "Global state").
    async fn project_lock(&self, project_id: &Id) -> Arc<Mutex<()>> {
        let mut locks = self.project_locks.lock().await;
        locks
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `enqueueOp` (Section 4.7).
    pub async fn enqueue_op(
        &self,
        kind: OpKind,
        project_id: &Id,
        options: EnqueueOptions,
    ) -> Result<Operation> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.storage.get_project(project_id).await?;

        if let Some(active_id) = &project.status.last_op_id {
            if let Ok(active_op) = self.storage.get_op(active_id).await {
                if !active_op.status.is_terminal() {
                    return Err(OrchestratorError::Conflict(Box::new(ConflictError {
                        reason: format!(
                            "active operation {} ({}) is still {:?}",
                            active_op.id, active_op.kind.as_str(), active_op.status
                        ),
                        active_op,
                        requested_kind: kind,
                    })));
                }
            }
        }

        let op = Operation {
            id: Id::new(),
            kind,
            project_id: project_id.clone(),
            delivery: options.delivery.clone(),
            requested: Utc::now(),
            finished: None,
            status: OpStatus::Queued,
            error: None,
            steps: Vec::new(),
        };
        self.storage.put_op(&op, self.history_cap).await?;

        project.status.last_op_id = Some(op.id.clone());
        project.status.last_op_kind = Some(kind);
        self.storage.put_project(&project).await?;

        let subject = start_subject(kind);
        let message_id = format!("worker-result:{subject}:{}:entry", op.id);
        let mut payload = options.payload;
        merge_envelope(&mut payload, &op);

        if let Err(publish_err) = self.bus.publish(subject, &message_id, &payload).await {
            let mut rolled_back = None;
            if let Err(finalize_err) = self.finalize_op(&op.id, OpStatus::Error).await {
                tracing::error!(
                    op_id = %op.id,
                    publish_error = %publish_err,
                    finalize_error = %finalize_err,
                    "failed to finalize op after publish failure"
                );
            }
            if kind == OpKind::Create {
                rolled_back = Some(self.storage.delete_project(project_id).await.is_ok());
            }
            return Err(OrchestratorError::Enqueue(Box::new(EnqueueError {
                op_id: op.id,
                project_id: project_id.clone(),
                reason: format!("failed to publish start message: {publish_err}"),
                next_step: "retry the request; if this persists, check the messaging fabric"
                    .to_string(),
                project_rolled_back: rolled_back,
            })));
        }

        project.status.phase = if kind == OpKind::Delete {
            ProjectPhase::Deleting
        } else {
            ProjectPhase::Reconciling
        };
        project.status.updated_at = Utc::now();
        project.status.message = format!("{} in progress", kind.as_str());
        self.storage.put_project(&project).await?;

        self.event_hub
            .publish(&op.id, EventKind::OpBootstrap, serde_json::json!({"op": &op}))
            .await;
        self.event_hub
            .publish(
                &op.id,
                EventKind::OpStatus,
                serde_json::json!({"status": "queued"}),
            )
            .await;

        Ok(op)
    }

    /// Idempotent: no-op if an open step for `worker` already exists
    /// (Section 4.7 "Step bookkeeping").
    pub async fn mark_op_step_start(&self, op_id: &Id, worker: &str) -> Result<()> {
        let mut op = self.storage.get_op(op_id).await?;
        if op.open_step_mut(worker).is_some() {
            return Ok(());
        }
        if op.status == OpStatus::Queued {
            op.status = OpStatus::Running;
        }
        op.steps.push(Step {
            worker: worker.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            message: String::new(),
            error: None,
            artifacts: Vec::new(),
        });
        self.storage.put_op(&op, self.history_cap).await?;
        self.event_hub
            .publish(
                op_id,
                EventKind::StepStarted,
                serde_json::json!({"worker": worker}),
            )
            .await;
        Ok(())
    }

    /// Closes the most recent open step for `worker`. A nonempty error
    /// immediately transitions the op to `error` (Section 4.7).
    pub async fn mark_op_step_end(
        &self,
        op_id: &Id,
        worker: &str,
        message: String,
        error: Option<String>,
        artifacts: Vec<String>,
    ) -> Result<()> {
        let mut op = self.storage.get_op(op_id).await?;
        let already_terminal = op.status.is_terminal();

        if let Some(step) = op.open_step_mut(worker) {
            step.ended_at = Some(Utc::now());
            step.message = message;
            step.error = error.clone();
            step.artifacts = artifacts.clone();
        }

        let has_artifacts = !artifacts.is_empty();
        let promotes_to_error = error.is_some() && !already_terminal;
        if promotes_to_error {
            op.status = OpStatus::Error;
            op.error = error.clone();
            op.finished = Some(Utc::now());
        }
        self.storage.put_op(&op, self.history_cap).await?;

        self.event_hub
            .publish(
                op_id,
                EventKind::StepEnded,
                serde_json::json!({"worker": worker, "error": error}),
            )
            .await;
        if has_artifacts {
            self.event_hub
                .publish(
                    op_id,
                    EventKind::StepArtifacts,
                    serde_json::json!({"worker": worker, "artifacts": artifacts}),
                )
                .await;
        }

        if promotes_to_error {
            self.apply_terminal_project_phase(&op).await?;
            self.event_hub
                .publish(
                    op_id,
                    EventKind::OpFailed,
                    serde_json::json!({"error": op.error}),
                )
                .await;
        }

        Ok(())
    }

    /// `finalizeOp` (Section 4.7): sets terminal status, updates project
    /// phase, emits the terminal event exactly once.
    pub async fn finalize_op(&self, op_id: &Id, status: OpStatus) -> Result<()> {
        let mut op = self.storage.get_op(op_id).await?;
        if op.status.is_terminal() {
            // Terminal stickiness (Section 8): no mutation, no re-emission.
            return Ok(());
        }

        op.status = status;
        op.finished = Some(Utc::now());
        self.storage.put_op(&op, self.history_cap).await?;

        self.apply_terminal_project_phase(&op).await?;

        let kind = if status == OpStatus::Done {
            EventKind::OpCompleted
        } else {
            EventKind::OpFailed
        };
        self.event_hub
            .publish(op_id, kind, serde_json::json!({"status": status, "error": op.error}))
            .await;

        Ok(())
    }

    /// Tombstone boundary: the project row is retained with `phase=Deleting`
    /// for the entire life of a delete op (Section 4.7 step bookkeeping, this
    /// file's `enqueue_op`) and is only actually removed here, once the
    /// terminal manifestRenderer step reports `done`.
    async fn apply_terminal_project_phase(&self, op: &Operation) -> Result<()> {
        if op.status == OpStatus::Done && op.kind == OpKind::Delete {
            if let Err(e) = self.storage.delete_project(&op.project_id).await {
                tracing::warn!(project_id = %op.project_id, error = %e, "failed to remove tombstoned project");
            }
            return Ok(());
        }

        let Ok(mut project) = self.storage.get_project(&op.project_id).await else {
            // Project may already be gone (a retried terminal-phase call for
            // an already-tombstoned delete); nothing to mirror.
            return Ok(());
        };

        project.status.phase = match op.status {
            OpStatus::Error => ProjectPhase::Error,
            OpStatus::Done => ProjectPhase::Ready,
            _ => project.status.phase,
        };
        project.status.updated_at = Utc::now();
        project.status.message = match op.status {
            OpStatus::Done => format!("{} completed", op.kind.as_str()),
            OpStatus::Error => op
                .error
                .clone()
                .unwrap_or_else(|| format!("{} failed", op.kind.as_str())),
            _ => project.status.message.clone(),
        };
        if let Err(e) = self.storage.put_project(&project).await {
            tracing::warn!(project_id = %op.project_id, error = %e, "failed to mirror project status");
        }
        Ok(())
    }
}

/// Stamp the operation id/project id/kind/delivery into a worker message so
/// every step worker sees the same envelope regardless of payload shape.
fn merge_envelope(payload: &mut serde_json::Value, op: &Operation) {
    if !payload.is_object() {
        *payload = serde_json::json!({});
    }
    let obj = payload.as_object_mut().expect("payload forced to object above");
    obj.insert("op_id".to_string(), serde_json::json!(op.id));
    obj.insert("project_id".to_string(), serde_json::json!(op.project_id));
    obj.insert("kind".to_string(), serde_json::json!(op.kind));
    if let Some(delivery) = &op.delivery {
        obj.insert("delivery".to_string(), serde_json::json!(delivery));
    }
    obj.entry("error").or_insert(serde_json::Value::Null);
}
