use std::marker::PhantomData;
use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use super::{update_entity, EngineError};
use crate::model::{Ambulance, Entity, Filter, SecurityUnit, UnitStatus};
use crate::observability::DISPATCH_CONFLICTS_TOTAL;
use crate::store::{fetch, fetch_all, swap, EntityStore};

/// A unit that can be claimed for a case.
///
/// A unit is `Busy` while it holds a case (or was tasked by hand through
/// [`ResourcePool::deploy`]) and `Available` otherwise.
pub trait Responder: Entity {
    fn id(&self) -> &str;
    fn status(&self) -> UnitStatus;
    fn assigned_case(&self) -> Option<Ulid>;
    /// Zone or location the unit is posted at.
    fn station(&self) -> &str;
    fn with_state(&self, status: UnitStatus, case: Option<Ulid>) -> Self;
    fn relocated(&self, station: &str) -> Self;
}

impl Responder for SecurityUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> UnitStatus {
        self.status
    }

    fn assigned_case(&self) -> Option<Ulid> {
        self.assigned_case
    }

    fn station(&self) -> &str {
        &self.zone
    }

    fn with_state(&self, status: UnitStatus, case: Option<Ulid>) -> Self {
        SecurityUnit {
            status,
            assigned_case: case,
            ..self.clone()
        }
    }

    fn relocated(&self, station: &str) -> Self {
        SecurityUnit {
            zone: station.to_string(),
            ..self.clone()
        }
    }
}

impl Responder for Ambulance {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> UnitStatus {
        self.status
    }

    fn assigned_case(&self) -> Option<Ulid> {
        self.assigned_case
    }

    fn station(&self) -> &str {
        &self.location
    }

    fn with_state(&self, status: UnitStatus, case: Option<Ulid>) -> Self {
        Ambulance {
            status,
            assigned_case: case,
            ..self.clone()
        }
    }

    fn relocated(&self, station: &str) -> Self {
        Ambulance {
            location: station.to_string(),
            ..self.clone()
        }
    }
}

/// Availability registry for one kind of responder. A unit is held by at most
/// one case: `claim` only succeeds against a unit observed `Available`.
pub struct ResourcePool<R> {
    store: Arc<dyn EntityStore>,
    _unit: PhantomData<fn() -> R>,
}

pub type SecurityUnitRegistry = ResourcePool<SecurityUnit>;
pub type AmbulanceFleet = ResourcePool<Ambulance>;

impl<R: Responder> ResourcePool<R> {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            _unit: PhantomData,
        }
    }

    pub async fn register(&self, unit: R) -> Result<R, EngineError> {
        if unit.id().trim().is_empty() {
            return Err(EngineError::validation("unit id is required"));
        }
        if !swap(self.store.as_ref(), None, &unit).await? {
            return Err(EngineError::validation(format!(
                "{} {} already registered",
                R::KIND.as_str(),
                unit.id()
            )));
        }
        info!("{} {} registered at {}", R::KIND.as_str(), unit.id(), unit.station());
        Ok(unit)
    }

    pub async fn find(&self, id: &str) -> Result<Option<R>, EngineError> {
        Ok(fetch::<R>(self.store.as_ref(), id).await?)
    }

    pub async fn get(&self, id: &str) -> Result<R, EngineError> {
        self.find(id)
            .await?
            .ok_or_else(|| EngineError::not_found(R::KIND, id))
    }

    pub async fn list(&self) -> Result<Vec<R>, EngineError> {
        Ok(fetch_all::<R>(self.store.as_ref(), &Filter::All).await?)
    }

    pub async fn available(&self) -> Result<Vec<R>, EngineError> {
        Ok(fetch_all::<R>(self.store.as_ref(), &Filter::UnitStatus(UnitStatus::Available)).await?)
    }

    /// Mark the unit busy with `case`. Fails with `UnitUnavailable` if another
    /// case (or an operator) got there first.
    pub async fn claim(&self, id: &str, case: Ulid) -> Result<R, EngineError> {
        let result = update_entity::<R, _>(self.store.as_ref(), id, |unit| {
            if unit.status() != UnitStatus::Available {
                return Err(EngineError::UnitUnavailable(unit.id().to_string()));
            }
            Ok(unit.with_state(UnitStatus::Busy, Some(case)))
        })
        .await;
        if let Err(EngineError::UnitUnavailable(_)) = &result {
            metrics::counter!(DISPATCH_CONFLICTS_TOTAL, "kind" => R::KIND.as_str()).increment(1);
        }
        result
    }

    /// Free the unit if it is still holding `case`. Otherwise leaves it alone.
    pub async fn release(&self, id: &str, case: Ulid) -> Result<R, EngineError> {
        let unit = self.get(id).await?;
        if unit.assigned_case() != Some(case) {
            return Ok(unit);
        }
        update_entity::<R, _>(self.store.as_ref(), id, |unit| {
            if unit.assigned_case() != Some(case) {
                return Ok(unit.clone());
            }
            Ok(unit.with_state(UnitStatus::Available, None))
        })
        .await
    }

    /// Task an idle unit to `station` outside the SOS flow. The unit is busy
    /// until recalled.
    pub async fn deploy(&self, id: &str, station: &str) -> Result<R, EngineError> {
        let station = station.trim();
        if station.is_empty() {
            return Err(EngineError::validation("deployment station is required"));
        }
        let unit = update_entity::<R, _>(self.store.as_ref(), id, |unit| {
            if unit.status() != UnitStatus::Available {
                return Err(EngineError::UnitUnavailable(unit.id().to_string()));
            }
            Ok(unit.relocated(station).with_state(UnitStatus::Busy, None))
        })
        .await?;
        info!("{} {id} deployed to {station}", R::KIND.as_str());
        Ok(unit)
    }

    /// Return a deployed unit to service. Units still holding a case must be
    /// freed by resolving it.
    pub async fn recall(&self, id: &str) -> Result<R, EngineError> {
        update_entity::<R, _>(self.store.as_ref(), id, |unit| {
            if unit.assigned_case().is_some() {
                return Err(EngineError::InvalidTransition {
                    kind: R::KIND,
                    from: "assigned",
                    to: UnitStatus::Available.as_str(),
                });
            }
            Ok(unit.with_state(UnitStatus::Available, None))
        })
        .await
    }
}
