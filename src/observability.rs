use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::engine::EngineError;

// ── Bookings & capacity ─────────────────────────────────────────

/// Counter: booking operations. Labels: op, outcome.
pub const BOOKINGS_TOTAL: &str = "darshan_bookings_total";

/// Counter: rejected slot reservations. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "darshan_reservations_rejected_total";

/// Counter: seat or unit releases left to the reconcile sweep after the
/// first attempt failed. Labels: kind.
pub const RELEASES_DEFERRED_TOTAL: &str = "darshan_releases_deferred_total";

/// Counter: deferred releases settled by the sweep. Labels: kind.
pub const RELEASES_RECONCILED_TOTAL: &str = "darshan_releases_reconciled_total";

// ── Zones ───────────────────────────────────────────────────────

/// Gauge: current occupancy. Labels: zone.
pub const ZONE_OCCUPANCY: &str = "darshan_zone_occupancy";

/// Counter: simulator ticks applied.
pub const ZONE_TICKS_TOTAL: &str = "darshan_zone_ticks_total";

// ── Dispatch ────────────────────────────────────────────────────

/// Counter: SOS lifecycle operations. Labels: op, outcome.
pub const SOS_TOTAL: &str = "darshan_sos_total";

/// Counter: unit claims lost to another case.
pub const DISPATCH_CONFLICTS_TOTAL: &str = "darshan_dispatch_conflicts_total";

/// Counter: severity bumps. Labels: source (manual, sweep, incident).
pub const ESCALATIONS_TOTAL: &str = "darshan_escalations_total";

/// Counter: incident operations. Labels: op, outcome.
pub const INCIDENTS_TOTAL: &str = "darshan_incidents_total";

/// Counter: notification sink failures (suppressed).
pub const NOTIFY_FAILURES_TOTAL: &str = "darshan_notify_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "darshan_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "darshan_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Outcome label for an operation result.
pub fn outcome<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    }
}
