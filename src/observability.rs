use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings committed (each occurrence of a series counts once).
pub const BOOKINGS_COMMITTED_TOTAL: &str = "sortie_bookings_committed_total";

/// Counter: rejected booking requests. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "sortie_booking_rejections_total";

/// Counter: cancellations. Labels: late.
pub const CANCELLATIONS_TOTAL: &str = "sortie_cancellations_total";

/// Counter: waitlist proposals produced by freed slots.
pub const WAITLIST_PROPOSALS_TOTAL: &str = "sortie_waitlist_proposals_total";

/// Counter: operations retried after a conflict or lock timeout. Labels: op.
pub const RETRIES_TOTAL: &str = "sortie_retries_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "sortie_operation_duration_seconds";

/// Counter: background sweeper actions. Labels: action (no_show, waitlist_expired).
pub const SWEEPER_ACTIONS_TOTAL: &str = "sortie_sweeper_actions_total";

/// Counter: requests handled by the command driver. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "sortie_commands_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of loaded organization engines.
pub const TENANTS_ACTIVE: &str = "sortie_tenants_active";

/// Histogram: time spent acquiring a commit's resource locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "sortie_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "sortie_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "sortie_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
