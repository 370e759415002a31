//! Dispatch of one tool call batch

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentEvent, AgentInner, EventSender};
use crate::conversation::Turn;
use crate::error::{Result, ToolError};
use crate::llm::ProposedCall;
use crate::registry::{Capability, CapabilityOutput, ValidatedCall};

/// How a batch ended
#[derive(Debug)]
pub(super) enum BatchEnd {
    Completed,
    /// A call failed in a way that ends the user turn
    Fatal(ToolError),
    Cancelled,
}

struct Finished {
    call_id: String,
    capability: Capability,
    result: std::result::Result<CapabilityOutput, ToolError>,
}

type Lane = Vec<(String, ValidatedCall)>;

/// Group calls into lanes that run concurrently. Calls to the same
/// non-idempotent capability share a lane and run in proposal order.
fn plan_lanes(calls: Vec<(String, ValidatedCall)>) -> Vec<Lane> {
    let mut lanes: Vec<Lane> = Vec::new();
    let mut serial: HashMap<Capability, usize> = HashMap::new();

    for (call_id, call) in calls {
        if call.is_idempotent() {
            lanes.push(vec![(call_id, call)]);
            continue;
        }
        match serial.get(&call.capability()) {
            Some(&lane) => lanes[lane].push((call_id, call)),
            None => {
                serial.insert(call.capability(), lanes.len());
                lanes.push(vec![(call_id, call)]);
            }
        }
    }

    lanes
}

impl AgentInner {
    /// Record, validate and run a batch of proposed calls. Every recorded
    /// call has a result when this returns `Ok`.
    pub(super) async fn dispatch(
        &self,
        calls: Vec<ProposedCall>,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> Result<BatchEnd> {
        let limit = self.config.max_batch_size;
        let mut runnable = Vec::new();
        let mut rejected = Vec::new();

        for (index, call) in calls.into_iter().enumerate() {
            let call_id = self.next_call_id();
            self.store
                .append(Turn::ToolCall {
                    call_id: call_id.clone(),
                    capability: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .await?;

            let validated = if index >= limit {
                Err(ToolError::Validation(format!(
                    "batch limit of {} calls exceeded; {} was not dispatched",
                    limit, call.name
                )))
            } else {
                self.registry.validate(&call.name, &call.arguments)
            };

            match validated {
                Ok(validated) => runnable.push((call_id, validated)),
                Err(e) => rejected.push((call_id, call.name, e)),
            }
        }

        for (call_id, name, error) in rejected {
            warn!("Rejected {} [{}]: {}", name, call_id, error);
            let _ = events.send(AgentEvent::ToolCallStarted {
                call_id: call_id.clone(),
                capability: name.clone(),
            });
            self.record(events, &call_id, &name, Err(error)).await?;
        }

        if runnable.is_empty() {
            return Ok(BatchEnd::Completed);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_calls.max(1)));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Finished>();
        let mut tasks = JoinSet::new();

        for lane in plan_lanes(runnable) {
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let done_tx = done_tx.clone();
            let events = events.clone();

            tasks.spawn(async move {
                for (call_id, call) in lane {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let _ = events.send(AgentEvent::ToolCallStarted {
                        call_id: call_id.clone(),
                        capability: call.capability().name().to_string(),
                    });
                    let result = client.invoke_validated(&call_id, &call).await;
                    let finished = Finished {
                        call_id,
                        capability: call.capability(),
                        result,
                    };
                    if done_tx.send(finished).is_err() {
                        return;
                    }
                }
            });
        }
        drop(done_tx);

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break BatchEnd::Cancelled,
                finished = done_rx.recv() => match finished {
                    Some(finished) => {
                        let fatal = finished
                            .result
                            .as_ref()
                            .err()
                            .filter(|e| e.is_fatal())
                            .cloned();
                        self.record(
                            events,
                            &finished.call_id,
                            finished.capability.name(),
                            finished.result,
                        )
                        .await?;
                        if let Some(error) = fatal {
                            break BatchEnd::Fatal(error);
                        }
                    }
                    None => break BatchEnd::Completed,
                },
            }
        };

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        // Results that completed while the batch was being stopped
        while let Ok(finished) = done_rx.try_recv() {
            self.record(
                events,
                &finished.call_id,
                finished.capability.name(),
                finished.result,
            )
            .await?;
        }

        if !matches!(end, BatchEnd::Completed) {
            debug!("Batch ended early: {:?}", end);
            self.close_open_calls(events, false).await?;
        }

        Ok(end)
    }

    /// Give every open call a result. Non-idempotent calls that may have
    /// reached the provider get `AmbiguousOutcome`, the rest `Cancelled`.
    pub(super) async fn close_open_calls(
        &self,
        events: &EventSender,
        assume_dispatched: bool,
    ) -> Result<()> {
        for call_id in self.store.open_calls() {
            let name = self.store.open_call_capability(&call_id).unwrap_or_default();
            let side_effects = self.registry.resolve(&name).is_some_and(|d| !d.idempotent);

            let error = if side_effects && (assume_dispatched || self.client.was_dispatched(&call_id)) {
                ToolError::AmbiguousOutcome(format!(
                    "{} was in flight when the turn ended; check the mailbox before retrying",
                    name
                ))
            } else {
                ToolError::Cancelled
            };
            self.record(events, &call_id, &name, Err(error)).await?;
        }
        Ok(())
    }

    /// Append a tool result and report it to the front-end
    async fn record(
        &self,
        events: &EventSender,
        call_id: &str,
        capability: &str,
        result: std::result::Result<CapabilityOutput, ToolError>,
    ) -> Result<()> {
        let outcome = result
            .as_ref()
            .map(|output| serde_json::to_value(output).unwrap_or(Value::Null))
            .map_err(Clone::clone);

        self.store
            .append(Turn::ToolResult {
                call_id: call_id.to_string(),
                outcome,
            })
            .await?;

        let _ = events.send(AgentEvent::ToolCallFinished {
            call_id: call_id.to_string(),
            capability: capability.to_string(),
            result: result.map(|output| output.summary()),
        });
        Ok(())
    }
}
