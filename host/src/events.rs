//! Status-change notifications. Delivery is best effort and never blocks the engine.

use matchproof_core::StatusChange;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub trait EventSink: Send + Sync {
    fn publish(&self, change: &StatusChange);
}

/// Fan-out over a tokio broadcast channel. Lagging subscribers drop events.
pub struct BroadcastSink {
    tx: broadcast::Sender<StatusChange>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, change: &StatusChange) {
        if self.tx.send(change.clone()).is_err() {
            debug!(claim_id = %change.claim_id, "No status subscribers");
        }
    }
}

/// Writes each transition to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, change: &StatusChange) {
        info!(
            claim_id = %change.claim_id,
            external_ref = %change.external_ref,
            from = %change.from,
            to = %change.to,
            "Claim status changed"
        );
    }
}
