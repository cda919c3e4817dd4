// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide usage-event sink (§5, §5.1). `record()` is the only entry
//! point Pipeline calls; everything else here is the plumbing that makes a
//! single background drain task outlive any individual `Pipeline::run` call
//! without requiring callers to thread a handle through.
use std::sync::OnceLock;

use tokio::sync::mpsc;
use tracing::trace;

use crate::dto::OdometerEvent;

static SENDER: OnceLock<mpsc::UnboundedSender<OdometerEvent>> = OnceLock::new();

fn sender() -> &'static mpsc::UnboundedSender<OdometerEvent> {
    SENDER.get_or_init(|| {
        let (tx, mut rx) = mpsc::unbounded_channel::<OdometerEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                trace!(
                    provider = %event.provider,
                    model = %event.model,
                    input_tokens = event.input_tokens,
                    output_tokens = event.output_tokens,
                    "odometer event"
                );
            }
        });
        tx
    })
}

/// Queue one usage event for the background drain task. Lock-free append —
/// a full channel never blocks the caller since the channel is unbounded and
/// the drain task never falls permanently behind a single-process workload.
pub fn record(event: OdometerEvent) {
    // The receiver only closes if the drain task panics, which would already
    // have been reported; dropping the event at that point is acceptable.
    let _ = sender().send(event);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
