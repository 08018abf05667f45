use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn};
use ulid::Ulid;

use super::{update_entity, EngineError};
use crate::limits::MAX_SLOT_CAPACITY;
use crate::model::{Filter, Kind, Slot};
use crate::observability::RESERVATIONS_REJECTED_TOTAL;
use crate::store::{fetch, fetch_all, save, EntityStore};

/// Owns `booked_count` on every slot. Nothing else writes it.
pub struct SlotCapacityManager {
    store: Arc<dyn EntityStore>,
}

impl SlotCapacityManager {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn create_slot(
        &self,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        max_capacity: u32,
    ) -> Result<Slot, EngineError> {
        if start_time >= end_time {
            return Err(EngineError::validation("slot must end after it starts"));
        }
        validate_capacity(max_capacity)?;
        let slot = Slot {
            id: Ulid::new(),
            date,
            start_time,
            end_time,
            max_capacity,
            booked_count: 0,
            locked: false,
        };
        let slot = save(self.store.as_ref(), slot).await?;
        info!(
            "slot {} created: {date} {start_time}-{end_time}, capacity {max_capacity}",
            slot.id
        );
        Ok(slot)
    }

    pub async fn get(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        fetch::<Slot>(self.store.as_ref(), &slot_id.to_string())
            .await?
            .ok_or_else(|| EngineError::not_found(Kind::Slot, slot_id))
    }

    /// Slots on `date`, earliest first.
    pub async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let mut slots = fetch_all::<Slot>(self.store.as_ref(), &Filter::Date(date)).await?;
        slots.sort_by_key(|s| (s.start_time, s.id));
        Ok(slots)
    }

    /// Take `count` seats. Either all of them or none.
    pub async fn reserve(&self, slot_id: Ulid, count: u32) -> Result<Slot, EngineError> {
        if count == 0 {
            return Err(EngineError::validation("reservation must be for at least one seat"));
        }
        let result = update_entity::<Slot, _>(self.store.as_ref(), &slot_id.to_string(), |slot| {
            if slot.locked {
                return Err(EngineError::SlotLocked(slot.id));
            }
            let available = slot.remaining();
            if count > available {
                return Err(EngineError::CapacityExceeded {
                    slot_id: slot.id,
                    requested: count,
                    available,
                });
            }
            Ok(Slot {
                booked_count: slot.booked_count + count,
                ..slot.clone()
            })
        })
        .await;

        if let Err(e) = &result
            && matches!(
                e,
                EngineError::SlotLocked(_) | EngineError::CapacityExceeded { .. }
            )
        {
            metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => e.label()).increment(1);
        }
        result
    }

    /// Give `count` seats back. The count never goes below zero.
    pub async fn release(&self, slot_id: Ulid, count: u32) -> Result<Slot, EngineError> {
        update_entity::<Slot, _>(self.store.as_ref(), &slot_id.to_string(), |slot| {
            if count > slot.booked_count {
                warn!(
                    "slot {} release of {count} exceeds booked count {}",
                    slot.id, slot.booked_count
                );
            }
            Ok(Slot {
                booked_count: slot.booked_count.saturating_sub(count),
                ..slot.clone()
            })
        })
        .await
    }

    pub async fn toggle_lock(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        let slot = update_entity::<Slot, _>(self.store.as_ref(), &slot_id.to_string(), |slot| {
            Ok(Slot {
                locked: !slot.locked,
                ..slot.clone()
            })
        })
        .await?;
        info!(
            "slot {slot_id} {}",
            if slot.locked { "locked" } else { "unlocked" }
        );
        Ok(slot)
    }

    /// Resize a slot. Refuses to go below what is already booked.
    pub async fn set_capacity(&self, slot_id: Ulid, max_capacity: u32) -> Result<Slot, EngineError> {
        validate_capacity(max_capacity)?;
        update_entity::<Slot, _>(self.store.as_ref(), &slot_id.to_string(), |slot| {
            if max_capacity < slot.booked_count {
                return Err(EngineError::validation(format!(
                    "capacity {max_capacity} is below {} already booked",
                    slot.booked_count
                )));
            }
            Ok(Slot {
                max_capacity,
                ..slot.clone()
            })
        })
        .await
    }
}

fn validate_capacity(max_capacity: u32) -> Result<(), EngineError> {
    if max_capacity == 0 || max_capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::validation(format!(
            "capacity must be between 1 and {MAX_SLOT_CAPACITY}"
        )));
    }
    Ok(())
}
