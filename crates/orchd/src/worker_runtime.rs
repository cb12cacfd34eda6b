//! Worker Runtime (Section 4.4): the generic per-step consumer loop shared by
//! every step worker. Workers differ only in their body (Section 9
//! "Dynamic-dispatch patterns" — a fixed function signature registered per
//! worker name, not per-worker loop duplication).

use orch_core::{Delivery, Id, OpKind, OpStatus};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Message, MessageBus, PoisonRecord};
use crate::orchestrator::Orchestrator;

const FETCH_WAIT: Duration = Duration::from_millis(500);
const POISON_SUBJECT: &str = "worker.poison";
const POISON_HINT: &str = "Inspect artifacts and step details for the failing worker, then retry the operation.";

/// Fields every worker message carries regardless of step-specific payload
/// (stamped by the orchestrator at `enqueueOp`, carried forward by each
/// worker's publish).
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub op_id: Id,
    pub project_id: Id,
    pub kind: OpKind,
    #[serde(default)]
    pub delivery: Option<Delivery>,
    #[serde(default)]
    pub error: Option<String>,
    /// The full decoded payload, for workers that need step-specific fields.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

/// What a step handler reports back (Section 4.5: `{message, artifacts[]}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutcome {
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ResultPayload {
    op_id: Id,
    project_id: Id,
    kind: OpKind,
    delivery: Option<Delivery>,
    message: String,
    artifacts: Vec<String>,
    error: Option<String>,
}

/// Runs `handler` against every message on `input_subject` until `shutdown`
/// is set, publishing outcomes on `output_subject` (Section 4.4 per-message
/// handling, steps 1-7).
pub async fn run_worker<F, Fut>(
    worker: &'static str,
    input_subject: &'static str,
    output_subject: &'static str,
    bus: Arc<MessageBus>,
    orchestrator: Arc<Orchestrator>,
    max_deliver: u32,
    step_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    handler: F,
) where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, String>> + Send,
{
    while !shutdown.load(Ordering::Relaxed) {
        let message = match bus.fetch(input_subject, FETCH_WAIT).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(worker, error = %e, "fetch failed, retrying");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };

        if let Err(e) = handle_message(
            worker,
            output_subject,
            &bus,
            &orchestrator,
            max_deliver,
            step_timeout,
            &handler,
            &message,
        )
        .await
        {
            tracing::error!(worker, error = %e, "unrecoverable error handling message");
        }
    }
}

async fn handle_message<F, Fut>(
    worker: &'static str,
    output_subject: &'static str,
    bus: &Arc<MessageBus>,
    orchestrator: &Arc<Orchestrator>,
    max_deliver: u32,
    step_timeout: Duration,
    handler: &F,
    message: &Message,
) -> crate::bus::Result<()>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, String>> + Send,
{
    // Step 2: decode.
    let envelope = match decode_envelope(message) {
        Ok(envelope) => envelope,
        Err(reason) => {
            bus.poison(PoisonRecord {
                subject: message.subject.clone(),
                op_id: None,
                reason,
                payload: message.payload.to_string(),
                delivery_count: message.delivery_count,
            })
            .await?;
            bus.term(message).await?;
            return Ok(());
        }
    };

    // Step 3: idempotency check.
    let storage = orchestrator.storage();
    if let Ok(op) = storage.get_op(&envelope.op_id).await {
        if let Some(ended) = op.has_ended_step(worker) {
            let payload = ResultPayload {
                op_id: envelope.op_id.clone(),
                project_id: envelope.project_id.clone(),
                kind: envelope.kind,
                delivery: envelope.delivery.clone(),
                message: ended.message.clone(),
                artifacts: ended.artifacts.clone(),
                error: ended.error.clone(),
            };
            return settle(
                bus, orchestrator, message, output_subject, worker, max_deliver, &payload,
            )
            .await;
        }
    }

    // Step 4: upstream error skip.
    if envelope.error.as_deref().is_some_and(|e| !e.is_empty()) {
        let payload = ResultPayload {
            op_id: envelope.op_id.clone(),
            project_id: envelope.project_id.clone(),
            kind: envelope.kind,
            delivery: envelope.delivery.clone(),
            message: "skipped due to upstream error".to_string(),
            artifacts: Vec::new(),
            error: envelope.error.clone(),
        };
        return settle(
            bus, orchestrator, message, output_subject, worker, max_deliver, &payload,
        )
        .await;
    }

    // Step 5: execute under a per-op timeout.
    orchestrator
        .mark_op_step_start(&envelope.op_id, worker)
        .await
        .ok();

    let op_id = envelope.op_id.clone();
    let project_id = envelope.project_id.clone();
    let kind = envelope.kind;
    let delivery = envelope.delivery.clone();

    let outcome = match tokio::time::timeout(step_timeout, handler(envelope)).await {
        Ok(Ok(outcome)) => {
            orchestrator
                .mark_op_step_end(&op_id, worker, outcome.message.clone(), None, outcome.artifacts.clone())
                .await
                .ok();
            ResultPayload {
                op_id: op_id.clone(),
                project_id,
                kind,
                delivery,
                message: outcome.message,
                artifacts: outcome.artifacts,
                error: None,
            }
        }
        Ok(Err(error)) => {
            orchestrator
                .mark_op_step_end(&op_id, worker, String::new(), Some(error.clone()), vec![])
                .await
                .ok();
            ResultPayload {
                op_id: op_id.clone(),
                project_id,
                kind,
                delivery,
                message: String::new(),
                artifacts: Vec::new(),
                error: Some(error),
            }
        }
        Err(_) => {
            let error = format!("{worker} timed out after {}s", step_timeout.as_secs());
            orchestrator
                .mark_op_step_end(&op_id, worker, String::new(), Some(error.clone()), vec![])
                .await
                .ok();
            ResultPayload {
                op_id: op_id.clone(),
                project_id,
                kind,
                delivery,
                message: String::new(),
                artifacts: Vec::new(),
                error: Some(error),
            }
        }
    };

    settle(bus, orchestrator, message, output_subject, worker, max_deliver, &outcome).await
}

/// Steps 6-7: publish the result and ack/nak/term based on publish success
/// and the delivery attempt count.
async fn settle(
    bus: &Arc<MessageBus>,
    orchestrator: &Arc<Orchestrator>,
    message: &Message,
    output_subject: &str,
    worker: &str,
    max_deliver: u32,
    payload: &ResultPayload,
) -> crate::bus::Result<()> {
    let result_message_id = format!("worker-result:{output_subject}:{}:{worker}", payload.op_id);

    match bus.publish(output_subject, &result_message_id, payload).await {
        Ok(()) => {
            bus.ack(message).await?;
            Ok(())
        }
        Err(publish_err) => {
            if message.delivery_count < max_deliver {
                bus.nak(message).await?;
                Ok(())
            } else {
                bus.poison(PoisonRecord {
                    subject: message.subject.clone(),
                    op_id: Some(payload.op_id.to_string()),
                    reason: format!(
                        "retries exhausted publishing result on {output_subject} after {} attempts: {publish_err}",
                        message.delivery_count
                    ),
                    payload: message.payload.to_string(),
                    delivery_count: message.delivery_count,
                })
                .await?;
                orchestrator
                    .finalize_op(&payload.op_id, OpStatus::Error)
                    .await
                    .ok();
                let terminal_message_id = format!("worker-result:{POISON_SUBJECT}:{}:{worker}", payload.op_id);
                bus.publish(
                    POISON_SUBJECT,
                    &terminal_message_id,
                    &ResultPayload {
                        error: Some(POISON_HINT.to_string()),
                        ..payload.clone()
                    },
                )
                .await
                .ok();
                bus.term(message).await?;
                Ok(())
            }
        }
    }
}

fn decode_envelope(message: &Message) -> Result<Envelope, String> {
    let mut envelope: Envelope = serde_json::from_value(message.payload.clone())
        .map_err(|e| format!("decode failure: {e}"))?;
    envelope.raw = message.payload.clone();
    Ok(envelope)
}
