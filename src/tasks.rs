//! Background loops spawned by the host binary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{now_ms, BookingLedger, EmergencyDispatchCoordinator, ZoneOccupancyEngine};
use crate::store::MemStore;

/// Drives the crowd simulator.
pub async fn run_zone_ticker(zones: Arc<ZoneOccupancyEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = zones.tick().await {
            warn!("zone tick failed: {e}");
        }
    }
}

/// Bumps the severity of SOS cases left Pending too long and frees units
/// still held by resolved cases.
pub async fn run_sos_escalator(dispatch: Arc<EmergencyDispatchCoordinator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match dispatch.escalate_stale(now_ms()).await {
            Ok(bumped) => {
                for case in bumped {
                    info!(
                        "SOS {} pending too long, now {}",
                        case.id,
                        case.severity.as_str()
                    );
                }
            }
            Err(e) => warn!("SOS escalation sweep failed: {e}"),
        }
        match dispatch.reconcile_units().await {
            Ok(0) => {}
            Ok(freed) => info!("freed {freed} units held by resolved SOS cases"),
            Err(e) => warn!("unit reconcile sweep failed: {e}"),
        }
    }
}

/// Marks no-show bookings from earlier days as expired and returns seats of
/// cancellations whose release did not go through.
pub async fn run_booking_expirer(ledger: Arc<BookingLedger>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let today = chrono::Local::now().date_naive();
        match ledger.expire_before(today).await {
            Ok(expired) if !expired.is_empty() => {
                info!("expired {} bookings dated before {today}", expired.len());
            }
            Ok(_) => {}
            Err(e) => warn!("booking expiry sweep failed: {e}"),
        }
        match ledger.reconcile_releases().await {
            Ok(0) => {}
            Ok(settled) => info!("returned seats for {settled} cancelled bookings"),
            Err(e) => warn!("seat reconcile sweep failed: {e}"),
        }
    }
}

/// Rewrites the WAL once enough appends have piled up since the last rewrite.
pub async fn run_compactor(store: Arc<MemStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("WAL compacted after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
