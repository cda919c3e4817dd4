// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! BatchEngine (C10): runs many independent single-shot Pipeline invocations
//! under a `tokio::sync::Semaphore` admission gate, gathering results in
//! input order regardless of completion order.
//!
//! Grounded in the teacher's `Agent::run_agentic_loop` Phase 2 tool dispatch
//! (`conduit-core::tool_loop`): N `tokio::spawn` tasks collected by index,
//! a panicked task turned into an error value rather than propagated. This
//! generalizes that shape from "N tool calls of one turn" to "N independent
//! Pipeline invocations," adding the Semaphore gate tool dispatch doesn't
//! need.
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use conduit_core::{ConduitError, Conversation, GenerationRequest, GenerationResponse, Pipeline, Session};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One unit of batch work: a request plus the isolated `Session`/
/// `Conversation` pair it runs against. Batch items are independent by
/// construction — nothing here shares a `Session` across items, matching
/// §5's "no inter-request ordering guarantees" rule.
pub struct BatchItem {
    pub request: GenerationRequest,
    pub session: Session,
    pub conversation: Conversation,
}

impl BatchItem {
    pub fn new(request: GenerationRequest, session: Session, conversation: Conversation) -> Self {
        Self { request, session, conversation }
    }
}

/// Result slot for one `BatchItem`. `session`/`conversation` reflect
/// whatever the Pipeline mutated them to — on failure before any mutation,
/// or on a panicked task, they are the item's pre-call state.
pub struct BatchOutcome {
    pub response: Result<GenerationResponse, ConduitError>,
    pub session: Session,
    pub conversation: Conversation,
}

/// Progress snapshot, sampled on every state transition per §4.10.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProgress {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Counters {
    running: usize,
    completed: usize,
    failed: usize,
}

fn publish(tx: &watch::Sender<BatchProgress>, counters: &StdMutex<Counters>, total: usize, started_at: Instant) {
    let c = counters.lock().expect("counters mutex poisoned");
    let _ = tx.send(BatchProgress {
        total,
        running: c.running,
        completed: c.completed,
        failed: c.failed,
        elapsed_ms: started_at.elapsed().as_millis() as u64,
    });
}

/// A running batch: a progress receiver an external renderer may poll or
/// await changes on, plus a handle to collect the final, order-preserving
/// result vector.
pub struct BatchHandle {
    pub progress: watch::Receiver<BatchProgress>,
    results: tokio::task::JoinHandle<Vec<BatchOutcome>>,
}

impl BatchHandle {
    /// Await every item's completion. Order matches the input order passed
    /// to `BatchEngine::start`, never completion order.
    pub async fn join(self) -> Vec<BatchOutcome> {
        match self.results.await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, "batch driver task panicked");
                Vec::new()
            }
        }
    }
}

pub struct BatchEngine {
    pipeline: Arc<Pipeline>,
}

impl BatchEngine {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Start running `items` with at most `max_concurrent` Pipeline
    /// invocations in flight at once (`None` = unbounded). Queued items are
    /// dropped without starting once `cancel` fires; in-flight items observe
    /// cancellation at their next suspension point inside `Pipeline::run`.
    pub fn start(&self, items: Vec<BatchItem>, max_concurrent: Option<usize>, cancel: CancellationToken) -> BatchHandle {
        let total = items.len();
        let (tx, rx) = watch::channel(BatchProgress { total, ..Default::default() });
        let semaphore = max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let pipeline = Arc::clone(&self.pipeline);
        let started_at = Instant::now();

        let results = tokio::spawn(async move {
            let counters = Arc::new(StdMutex::new(Counters::default()));
            let mut tasks = Vec::with_capacity(total);

            for item in items {
                let pipeline = Arc::clone(&pipeline);
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let counters = Arc::clone(&counters);
                let tx = tx.clone();

                tasks.push(tokio::spawn(async move {
                    let fallback_session = item.session.clone();
                    let fallback_conversation = item.conversation.clone();

                    let _permit = if let Some(sem) = &semaphore {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            permit = sem.clone().acquire_owned() => Some(permit.expect("semaphore never closed")),
                        }
                    } else {
                        None
                    };

                    if cancel.is_cancelled() {
                        return BatchOutcome {
                            response: Err(ConduitError::Cancelled),
                            session: fallback_session,
                            conversation: fallback_conversation,
                        };
                    }

                    {
                        let mut c = counters.lock().expect("counters mutex poisoned");
                        c.running += 1;
                    }
                    publish(&tx, &counters, total, started_at);

                    let BatchItem { request, mut session, mut conversation } = item;
                    let response = pipeline.run(request, &mut session, &mut conversation, &cancel).await;

                    {
                        let mut c = counters.lock().expect("counters mutex poisoned");
                        c.running -= 1;
                        if response.is_ok() {
                            c.completed += 1;
                        } else {
                            c.failed += 1;
                        }
                    }
                    publish(&tx, &counters, total, started_at);

                    BatchOutcome { response, session, conversation }
                }));
            }

            let mut outcomes = Vec::with_capacity(tasks.len());
            for task in tasks {
                match task.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        warn!(error = %e, "batch item task panicked");
                        outcomes.push(BatchOutcome {
                            response: Err(ConduitError::ValidationError(format!("batch task panicked: {e}"))),
                            session: Session::new(),
                            conversation: Conversation { session_id: uuid::Uuid::nil(), messages: Vec::new() },
                        });
                    }
                }
            }
            outcomes
        });

        BatchHandle { progress: rx, results }
    }

    /// Convenience wrapper over `start`/`join` for callers that don't need
    /// live progress.
    pub async fn run(&self, items: Vec<BatchItem>, max_concurrent: Option<usize>, cancel: CancellationToken) -> Vec<BatchOutcome> {
        self.start(items, max_concurrent, cancel).join().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{ConduitOptions, ConduitOptionsSnapshot, GenerationParams};
    use conduit_model::{Message, ScriptedMockProvider};
    use std::sync::Arc as StdArc;

    fn item(text: &str) -> BatchItem {
        let mut session = Session::new();
        let mut conv = Conversation { session_id: session.id, messages: Vec::new() };
        conv.add(&mut session, Message::user(text)).unwrap();
        let request = GenerationRequest {
            messages: conv.messages.iter().map(|m| m.message.clone()).collect(),
            params: GenerationParams { model: "mock-model".into(), ..Default::default() },
            options: ConduitOptionsSnapshot { project_name: "test".into(), parallel_tool_calls: false, max_tool_hops: 1 },
        };
        BatchItem::new(request, session, conv)
    }

    fn engine(reply: &str) -> BatchEngine {
        let provider = StdArc::new(ScriptedMockProvider::always_text(reply));
        let pipeline = StdArc::new(Pipeline::new(provider, "mock", ConduitOptions::default()));
        BatchEngine::new(pipeline)
    }

    #[tokio::test]
    async fn batch_preserves_input_order_regardless_of_completion() {
        let eng = engine("ok");
        let items = vec![item("one"), item("two"), item("three")];
        let outcomes = eng.run(items, Some(2), CancellationToken::new()).await;
        assert_eq!(outcomes.len(), 3);
        for o in &outcomes {
            assert_eq!(o.response.as_ref().unwrap().message.as_text(), Some("ok"));
        }
    }

    #[tokio::test]
    async fn a_failed_item_does_not_cancel_siblings() {
        let eng = engine("ok");
        let items = vec![item("one"), item("two")];
        let outcomes = eng.run(items, None, CancellationToken::new()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.response.is_ok()));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_queued_items() {
        let eng = engine("ok");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items = vec![item("one"), item("two")];
        let outcomes = eng.run(items, Some(1), cancel).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o.response, Err(ConduitError::Cancelled))));
    }

    #[tokio::test]
    async fn progress_reaches_completed_total() {
        let eng = engine("ok");
        let items = vec![item("one"), item("two"), item("three")];
        let handle = eng.start(items, Some(2), CancellationToken::new());
        let mut progress = handle.progress.clone();
        let outcomes = handle.join().await;
        assert_eq!(outcomes.len(), 3);
        let last = *progress.borrow_and_update();
        assert_eq!(last.total, 3);
    }
}
