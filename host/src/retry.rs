//! Out-of-band re-drive of chain mirror records.

use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::Engine;

/// Periodically re-drive stale outbox records that never confirmed.
///
/// Runs until the process exits; a failing pass is logged and the next
/// one starts after the configured interval.
pub async fn retry_loop(engine: Arc<Engine>) {
    let interval = engine.config().mirror.retry_interval;
    loop {
        tokio::time::sleep(interval).await;

        match engine.retry_mirrors().await {
            Ok(report) if report.scanned > 0 => {
                info!(
                    scanned = report.scanned,
                    confirmed = report.confirmed,
                    failed = report.failed,
                    timed_out = report.timed_out,
                    skipped = report.skipped,
                    "Mirror retry pass"
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Mirror retry pass failed: {}", e),
        }
    }
}
