use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::observability::SWEEPER_ACTIONS_TOTAL;

/// One pass: mark overdue bookings as no-shows and expire stale waitlist
/// entries. Returns how many of each were touched.
pub async fn sweep_once(engine: &Engine) -> Result<(usize, usize), EngineError> {
    let now = engine.now();
    let mut no_shows = 0;
    for id in engine.collect_overdue(now) {
        match engine.mark_no_show(id).await {
            Ok(_) => {
                info!("booking {id} marked no-show");
                no_shows += 1;
            }
            // Checked in or cancelled since we looked.
            Err(e) => tracing::debug!("sweeper skip {id}: {e}"),
        }
    }
    let expired = engine.expire_waitlist(now).await?;
    for id in &expired {
        info!("waitlist entry {id} expired");
    }
    metrics::counter!(SWEEPER_ACTIONS_TOTAL, "action" => "no_show").increment(no_shows as u64);
    metrics::counter!(SWEEPER_ACTIONS_TOTAL, "action" => "waitlist_expired").increment(expired.len() as u64);
    Ok((no_shows, expired.len()))
}

/// Background task that periodically runs [`sweep_once`].
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    // First pass one period after start-up, not immediately.
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        interval.tick().await;
        if let Err(e) = sweep_once(&engine).await {
            tracing::warn!("sweep failed for organization {}: {e}", engine.organization_id);
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(
                "organization {}: compacted WAL after {appends} appends",
                engine.organization_id
            ),
            Err(e) => tracing::warn!("compaction failed for organization {}: {e}", engine.organization_id),
        }
    }
}
