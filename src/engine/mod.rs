mod dispatch;
mod error;
mod incidents;
mod ledger;
mod registry;
mod slots;
mod zones;

pub use dispatch::{EmergencyDispatchCoordinator, SosReport, SosView};
pub use error::EngineError;
pub use incidents::IncidentReport;
pub use ledger::{BookingLedger, NewBooking};
pub use registry::{AmbulanceFleet, ResourcePool, Responder, SecurityUnitRegistry};
pub use slots::SlotCapacityManager;
pub use zones::{ZoneOccupancyEngine, ZonePatch};

use std::sync::Arc;

use crate::config::PlatformConfig;
use crate::model::{Entity, Ms, Record};
use crate::notify::NotificationSink;
use crate::store::{EntityStore, Updated};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Read-check-write on one record.
///
/// `next` sees the current value and returns its successor or rejects it.
/// The store holds the record exclusively for the whole step, so concurrent
/// writers queue instead of failing, a rejection is based on the latest
/// committed state, and a rejected step writes nothing.
pub(crate) async fn update_entity<E, F>(
    store: &dyn EntityStore,
    key: &str,
    mut next: F,
) -> Result<E, EngineError>
where
    E: Entity,
    F: FnMut(&E) -> Result<E, EngineError> + Send,
{
    let mut verdict: Option<Result<E, EngineError>> = None;
    let updated = store
        .update(E::KIND, key, &mut |record: &Record| -> Option<Record> {
            let current = E::from_record(record.clone())?;
            let result = next(&current);
            let write = result.as_ref().ok().map(|e| e.clone().into_record());
            verdict = Some(result);
            write
        })
        .await?;
    match (updated, verdict) {
        (Updated::Missing, _) | (_, None) => Err(EngineError::not_found(E::KIND, key)),
        (_, Some(result)) => result,
    }
}

/// All components wired over one store.
#[derive(Clone)]
pub struct Platform {
    pub slots: Arc<SlotCapacityManager>,
    pub ledger: Arc<BookingLedger>,
    pub zones: Arc<ZoneOccupancyEngine>,
    pub security: Arc<SecurityUnitRegistry>,
    pub ambulances: Arc<AmbulanceFleet>,
    pub dispatch: Arc<EmergencyDispatchCoordinator>,
}

impl Platform {
    pub fn new(
        store: Arc<dyn EntityStore>,
        sink: Arc<dyn NotificationSink>,
        config: &PlatformConfig,
    ) -> Self {
        let slots = Arc::new(SlotCapacityManager::new(store.clone()));
        let zones = Arc::new(ZoneOccupancyEngine::new(
            store.clone(),
            config.zones.clone(),
            config.crowd,
        ));
        let ledger = Arc::new(BookingLedger::new(store.clone(), slots.clone(), zones.clone()));
        let security = Arc::new(SecurityUnitRegistry::new(store.clone()));
        let ambulances = Arc::new(AmbulanceFleet::new(store.clone()));
        let dispatch = Arc::new(EmergencyDispatchCoordinator::new(
            store,
            security.clone(),
            ambulances.clone(),
            sink,
            config.dispatch.clone(),
        ));
        Self {
            slots,
            ledger,
            zones,
            security,
            ambulances,
            dispatch,
        }
    }
}
