use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::slots::SlotCapacityManager;
use super::zones::ZoneOccupancyEngine;
use super::{now_ms, update_entity, EngineError};
use crate::limits::{MAX_CODE_ATTEMPTS, MAX_MEMBERS_PER_BOOKING, MAX_NAME_LEN};
use crate::model::{Booking, BookingStatus, Filter, Gate, Kind, PriorityType};
use crate::observability::{
    outcome, BOOKINGS_TOTAL, RELEASES_DEFERRED_TOTAL, RELEASES_RECONCILED_TOTAL,
};
use crate::store::{fetch, fetch_all, swap, EntityStore};

/// A booking request as it arrives from a pilgrim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub date: Option<NaiveDate>,
    pub slot_id: Option<Ulid>,
    pub members_count: u32,
    pub priority_type: PriorityType,
}

/// Bookings and their lifecycle. Seats are taken from the slot before a
/// booking becomes visible and handed back when it is cancelled.
pub struct BookingLedger {
    store: Arc<dyn EntityStore>,
    slots: Arc<SlotCapacityManager>,
    zones: Arc<ZoneOccupancyEngine>,
}

impl BookingLedger {
    pub fn new(
        store: Arc<dyn EntityStore>,
        slots: Arc<SlotCapacityManager>,
        zones: Arc<ZoneOccupancyEngine>,
    ) -> Self {
        Self {
            store,
            slots,
            zones,
        }
    }

    pub async fn create(&self, request: NewBooking) -> Result<Booking, EngineError> {
        let result = self.try_create(request).await;
        metrics::counter!(BOOKINGS_TOTAL, "op" => "create", "outcome" => outcome(&result))
            .increment(1);
        result
    }

    async fn try_create(&self, request: NewBooking) -> Result<Booking, EngineError> {
        let (date, slot_id) = validate(&request)?;
        let slot = self.slots.get(slot_id).await?;
        if slot.date != date {
            return Err(EngineError::validation(format!(
                "slot {slot_id} is on {}, not {date}",
                slot.date
            )));
        }
        let gate = self.least_loaded_gate(slot_id).await?;
        self.slots.reserve(slot_id, request.members_count).await?;

        let draft = Booking {
            id: Ulid::nil(),
            booking_id: String::new(),
            user_id: request.user_id.trim().to_string(),
            name: request.name.trim().to_string(),
            phone: request.phone.filter(|p| !p.trim().is_empty()),
            date,
            slot_id,
            members_count: request.members_count,
            priority_type: request.priority_type,
            gate,
            status: BookingStatus::Booked,
            created_at: now_ms(),
            checked_in_at: None,
            release_pending: false,
        };

        let booking = match self.insert_with_fresh_code(draft, Ulid::new).await {
            Ok(booking) => booking,
            Err(e) => {
                // The booking never became visible; its seats go back.
                if let Err(undo) = self.slots.release(slot_id, request.members_count).await {
                    warn!("slot {slot_id}: could not return {} seats: {undo}", request.members_count);
                }
                return Err(e);
            }
        };

        info!(
            "booking {} created: slot {slot_id}, {} members, {}",
            booking.booking_id,
            booking.members_count,
            gate.as_str()
        );
        Ok(booking)
    }

    /// Store `booking` under a code nobody holds yet, drawing a new id on collision.
    async fn insert_with_fresh_code(
        &self,
        mut booking: Booking,
        mut draw: impl FnMut() -> Ulid + Send,
    ) -> Result<Booking, EngineError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let id = draw();
            booking.id = id;
            booking.booking_id = booking_code(id);
            if swap(self.store.as_ref(), None, &booking).await? {
                return Ok(booking);
            }
            debug!("booking code {} taken, drawing another", booking.booking_id);
        }
        Err(EngineError::StoreUnavailable(format!(
            "no free booking code after {MAX_CODE_ATTEMPTS} draws"
        )))
    }

    /// `Booked` → `Checked-In`. The crowd counters follow on a best-effort basis.
    pub async fn check_in(&self, booking_id: &str) -> Result<Booking, EngineError> {
        let now = now_ms();
        let result = update_entity::<Booking, _>(self.store.as_ref(), booking_id, |b| {
            let mut next = transition(b, BookingStatus::CheckedIn)?;
            next.checked_in_at = Some(now);
            Ok(next)
        })
        .await;
        metrics::counter!(BOOKINGS_TOTAL, "op" => "check_in", "outcome" => outcome(&result))
            .increment(1);
        let booking = result?;

        if let Err(e) = self.zones.apply_check_in_transfer(booking.members_count).await {
            warn!("booking {booking_id} checked in but zone counters not updated: {e}");
        }
        info!("booking {booking_id} checked in at {}", booking.gate.as_str());
        Ok(booking)
    }

    /// `Booked` → `Cancelled`, then the seats go back to the slot.
    ///
    /// The cancellation is the commit point. If the slot can't be written
    /// right away the booking stays marked `release_pending` and
    /// [`reconcile_releases`](Self::reconcile_releases) hands the seats back later.
    pub async fn cancel(&self, booking_id: &str) -> Result<Booking, EngineError> {
        let result = update_entity::<Booking, _>(self.store.as_ref(), booking_id, |b| {
            let mut next = transition(b, BookingStatus::Cancelled)?;
            next.release_pending = true;
            Ok(next)
        })
        .await;
        metrics::counter!(BOOKINGS_TOTAL, "op" => "cancel", "outcome" => outcome(&result))
            .increment(1);
        let booking = result?;

        let booking = match self.settle_release(booking_id).await {
            Ok(Some(settled)) => settled,
            // settled by a concurrent sweep
            Ok(None) => Booking {
                release_pending: false,
                ..booking
            },
            Err(e) => {
                warn!("booking {booking_id} cancelled, seats deferred to the sweep: {e}");
                metrics::counter!(RELEASES_DEFERRED_TOTAL, "kind" => "booking").increment(1);
                booking
            }
        };
        info!("booking {booking_id} cancelled");
        Ok(booking)
    }

    /// Hand back the seats of every cancelled booking still marked
    /// `release_pending`. Returns how many were settled.
    pub async fn reconcile_releases(&self) -> Result<usize, EngineError> {
        let pending: Vec<Booking> = fetch_all::<Booking>(
            self.store.as_ref(),
            &Filter::BookingStatus(BookingStatus::Cancelled),
        )
        .await?
        .into_iter()
        .filter(|b| b.release_pending)
        .collect();

        let mut settled = 0;
        for booking in pending {
            match self.settle_release(&booking.booking_id).await {
                Ok(Some(_)) => settled += 1,
                Ok(None) => {}
                Err(e) => warn!("booking {}: seats still pending: {e}", booking.booking_id),
            }
        }
        if settled > 0 {
            metrics::counter!(RELEASES_RECONCILED_TOTAL, "kind" => "booking")
                .increment(settled as u64);
        }
        Ok(settled)
    }

    /// Take the pending release off the booking, then return its seats.
    ///
    /// Clearing the flag first means two settlers can't both return the same
    /// seats. If the slot write fails the flag is put back. `Ok(None)` means
    /// there was nothing pending.
    async fn settle_release(&self, booking_id: &str) -> Result<Option<Booking>, EngineError> {
        let taken = update_entity::<Booking, _>(self.store.as_ref(), booking_id, |b| {
            if !b.release_pending {
                return Err(EngineError::InvalidTransition {
                    kind: Kind::Booking,
                    from: b.status.as_str(),
                    to: "released",
                });
            }
            Ok(Booking {
                release_pending: false,
                ..b.clone()
            })
        })
        .await;
        let booking = match taken {
            Ok(b) => b,
            Err(EngineError::InvalidTransition { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.slots.release(booking.slot_id, booking.members_count).await {
            let requeued = update_entity::<Booking, _>(self.store.as_ref(), booking_id, |b| {
                Ok(Booking {
                    release_pending: true,
                    ..b.clone()
                })
            })
            .await;
            if let Err(again) = requeued {
                error!(
                    "booking {booking_id}: {} seats on slot {} lost: release failed ({e}), requeue failed ({again})",
                    booking.members_count, booking.slot_id
                );
            }
            return Err(e);
        }
        Ok(Some(booking))
    }

    pub async fn get(&self, booking_id: &str) -> Result<Option<Booking>, EngineError> {
        Ok(fetch::<Booking>(self.store.as_ref(), booking_id).await?)
    }

    pub async fn list_by_date(&self, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        self.list(Filter::Date(date)).await
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Booking>, EngineError> {
        self.list(Filter::User(user_id.to_string())).await
    }

    pub async fn list_by_slot(&self, slot_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.list(Filter::Slot(slot_id)).await
    }

    /// `Booked` → `Expired` for a booking whose date is before `today`.
    /// Seats are not returned: the slot is in the past.
    pub async fn expire(&self, booking_id: &str, today: NaiveDate) -> Result<Booking, EngineError> {
        update_entity::<Booking, _>(self.store.as_ref(), booking_id, |b| {
            if b.date >= today {
                return Err(EngineError::validation(format!(
                    "booking {} is for {}, not in the past",
                    b.booking_id, b.date
                )));
            }
            transition(b, BookingStatus::Expired)
        })
        .await
    }

    /// Expire every no-show dated before `today`.
    pub async fn expire_before(&self, today: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let stale: Vec<Booking> =
            fetch_all::<Booking>(self.store.as_ref(), &Filter::BookingStatus(BookingStatus::Booked))
                .await?
                .into_iter()
                .filter(|b| b.date < today)
                .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for booking in stale {
            match self.expire(&booking.booking_id, today).await {
                Ok(b) => expired.push(b),
                // checked in or cancelled since the scan
                Err(EngineError::InvalidTransition { .. }) => {
                    debug!("expiry skip {}", booking.booking_id);
                }
                Err(e) => return Err(e),
            }
        }
        if !expired.is_empty() {
            metrics::counter!(BOOKINGS_TOTAL, "op" => "expire", "outcome" => "ok")
                .increment(expired.len() as u64);
        }
        Ok(expired)
    }

    async fn list(&self, filter: Filter) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = fetch_all::<Booking>(self.store.as_ref(), &filter).await?;
        bookings.sort_by_key(|b| (b.created_at, b.id));
        Ok(bookings)
    }

    /// Gate with the fewest live members on this slot; ties go to the earlier gate.
    async fn least_loaded_gate(&self, slot_id: Ulid) -> Result<Gate, EngineError> {
        let bookings = fetch_all::<Booking>(self.store.as_ref(), &Filter::Slot(slot_id)).await?;
        let load = |gate: Gate| -> u32 {
            bookings
                .iter()
                .filter(|b| {
                    b.gate == gate
                        && matches!(b.status, BookingStatus::Booked | BookingStatus::CheckedIn)
                })
                .map(|b| b.members_count)
                .sum()
        };
        Ok(Gate::ALL.into_iter().min_by_key(|g| load(*g)).unwrap_or(Gate::A))
    }
}

fn validate(request: &NewBooking) -> Result<(NaiveDate, Ulid), EngineError> {
    if request.user_id.trim().is_empty() {
        return Err(EngineError::validation("user id is required"));
    }
    let name = request.name.trim();
    if name.is_empty() {
        return Err(EngineError::validation("name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!(
            "name is longer than {MAX_NAME_LEN} characters"
        )));
    }
    let date = request
        .date
        .ok_or_else(|| EngineError::validation("date is required"))?;
    let slot_id = request
        .slot_id
        .ok_or_else(|| EngineError::validation("slot is required"))?;
    if request.members_count == 0 {
        return Err(EngineError::validation("membersCount must be at least 1"));
    }
    if request.members_count > MAX_MEMBERS_PER_BOOKING {
        return Err(EngineError::validation(format!(
            "at most {MAX_MEMBERS_PER_BOOKING} members per booking"
        )));
    }
    Ok((date, slot_id))
}

fn transition(booking: &Booking, to: BookingStatus) -> Result<Booking, EngineError> {
    if !booking.status.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            kind: Kind::Booking,
            from: booking.status.as_str(),
            to: to.as_str(),
        });
    }
    Ok(Booking {
        status: to,
        ..booking.clone()
    })
}

/// Short code handed to the pilgrim: `DRS-` and the random tail of the ULID.
fn booking_code(id: Ulid) -> String {
    let full = id.to_string();
    format!("DRS-{}", &full[full.len() - 8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrowdThresholds, ZoneConfig};
    use crate::engine::ZonePatch;
    use crate::model::Slot;
    use crate::store::MemStore;
    use chrono::NaiveTime;

    struct Fixture {
        ledger: BookingLedger,
        slots: Arc<SlotCapacityManager>,
        zones: Arc<ZoneOccupancyEngine>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn EntityStore> = Arc::new(MemStore::new());
        let slots = Arc::new(SlotCapacityManager::new(store.clone()));
        let zones = Arc::new(ZoneOccupancyEngine::new(
            store.clone(),
            ZoneConfig::default(),
            CrowdThresholds::default(),
        ));
        Fixture {
            ledger: BookingLedger::new(store, slots.clone(), zones.clone()),
            slots,
            zones,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, 2).unwrap()
    }

    async fn slot(f: &Fixture, capacity: u32) -> Slot {
        f.slots
            .create_slot(
                day(),
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                capacity,
            )
            .await
            .unwrap()
    }

    fn request(slot: &Slot, members: u32) -> NewBooking {
        NewBooking {
            user_id: "user-1".into(),
            name: "Meera Iyer".into(),
            phone: Some("+91 90000 00000".into()),
            date: Some(slot.date),
            slot_id: Some(slot.id),
            members_count: members,
            priority_type: PriorityType::Normal,
        }
    }

    #[tokio::test]
    async fn create_takes_seats() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let booking = f.ledger.create(request(&s, 4)).await.unwrap();

        assert!(booking.booking_id.starts_with("DRS-"));
        assert_eq!(booking.booking_id.len(), 12);
        assert_eq!(booking.status, BookingStatus::Booked);
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 4);
        assert_eq!(f.ledger.get(&booking.booking_id).await.unwrap(), Some(booking));
    }

    #[tokio::test]
    async fn taken_code_draws_another() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let first = f.ledger.create(request(&s, 1)).await.unwrap();

        let fresh = Ulid::new();
        let mut draws = vec![first.id, fresh].into_iter();
        let second = f
            .ledger
            .insert_with_fresh_code(first.clone(), move || draws.next().unwrap())
            .await
            .unwrap();
        assert_eq!(second.id, fresh);
        assert_ne!(second.booking_id, first.booking_id);
        assert_eq!(f.ledger.get(&first.booking_id).await.unwrap(), Some(first));
        assert_eq!(f.ledger.list_by_slot(s.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn code_draws_are_bounded() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let first = f.ledger.create(request(&s, 1)).await.unwrap();

        let id = first.id;
        let result = f.ledger.insert_with_fresh_code(first.clone(), move || id).await;
        assert!(matches!(result, Err(EngineError::StoreUnavailable(_))));
        assert_eq!(f.ledger.list_by_slot(s.id).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn create_validates_before_touching_capacity() {
        let f = fixture();
        let s = slot(&f, 10).await;

        let mut missing_date = request(&s, 1);
        missing_date.date = None;
        let mut blank_name = request(&s, 1);
        blank_name.name = "   ".into();
        let mut too_many = request(&s, 1);
        too_many.members_count = MAX_MEMBERS_PER_BOOKING + 1;
        let mut wrong_day = request(&s, 1);
        wrong_day.date = day().succ_opt();

        for bad in [missing_date, blank_name, too_many, wrong_day, request(&s, 0)] {
            assert!(matches!(
                f.ledger.create(bad).await,
                Err(EngineError::Validation(_))
            ));
        }
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 0);
    }

    #[tokio::test]
    async fn full_slot_rejects() {
        let f = fixture();
        let s = slot(&f, 5).await;
        f.ledger.create(request(&s, 4)).await.unwrap();
        assert!(matches!(
            f.ledger.create(request(&s, 2)).await,
            Err(EngineError::CapacityExceeded { available: 1, .. })
        ));
        assert_eq!(f.ledger.list_by_slot(s.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn locked_slot_rejects() {
        let f = fixture();
        let s = slot(&f, 5).await;
        f.slots.toggle_lock(s.id).await.unwrap();
        assert_eq!(
            f.ledger.create(request(&s, 1)).await.unwrap_err(),
            EngineError::SlotLocked(s.id)
        );
    }

    #[tokio::test]
    async fn gates_balance_by_load() {
        let f = fixture();
        let s = slot(&f, 50).await;

        let a = f.ledger.create(request(&s, 5)).await.unwrap();
        let b = f.ledger.create(request(&s, 2)).await.unwrap();
        let c = f.ledger.create(request(&s, 1)).await.unwrap();
        let next = f.ledger.create(request(&s, 1)).await.unwrap();
        assert_eq!(
            [a.gate, b.gate, c.gate, next.gate],
            [Gate::A, Gate::B, Gate::C, Gate::C]
        );

        // cancelled parties no longer count
        f.ledger.cancel(&a.booking_id).await.unwrap();
        assert_eq!(f.ledger.create(request(&s, 1)).await.unwrap().gate, Gate::A);
    }

    #[tokio::test]
    async fn cancel_returns_seats_once() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let booking = f.ledger.create(request(&s, 3)).await.unwrap();

        let cancelled = f.ledger.cancel(&booking.booking_id).await.unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert!(!cancelled.release_pending);
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 0);

        // nothing left for the sweep
        assert_eq!(f.ledger.reconcile_releases().await.unwrap(), 0);
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 0);

        assert!(matches!(
            f.ledger.cancel(&booking.booking_id).await,
            Err(EngineError::InvalidTransition { kind: Kind::Booking, .. })
        ));
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 0);
    }

    #[tokio::test]
    async fn check_in_once_and_moves_crowd() {
        let f = fixture();
        let s = slot(&f, 10).await;
        f.zones
            .set(ZonePatch {
                gate: Some(100),
                queue: Some(40),
                ..ZonePatch::default()
            })
            .await
            .unwrap();
        let booking = f.ledger.create(request(&s, 5)).await.unwrap();

        let checked = f.ledger.check_in(&booking.booking_id).await.unwrap();
        assert_eq!(checked.status, BookingStatus::CheckedIn);
        assert!(checked.checked_in_at.is_some());

        let stats = f.zones.get().await.unwrap();
        assert_eq!((stats.gate, stats.queue), (105, 39));

        assert_eq!(
            f.ledger.check_in(&booking.booking_id).await.unwrap_err(),
            EngineError::InvalidTransition {
                kind: Kind::Booking,
                from: "Checked-In",
                to: "Checked-In"
            }
        );
        assert!(matches!(
            f.ledger.cancel(&booking.booking_id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        // check-in keeps the seats
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 5);
    }

    #[tokio::test]
    async fn unknown_booking() {
        let f = fixture();
        assert!(matches!(
            f.ledger.check_in("DRS-NOPE").await,
            Err(EngineError::NotFound(Kind::Booking, _))
        ));
        assert_eq!(f.ledger.get("DRS-NOPE").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_past_no_shows_only() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let no_show = f.ledger.create(request(&s, 2)).await.unwrap();
        let came = f.ledger.create(request(&s, 1)).await.unwrap();
        f.ledger.check_in(&came.booking_id).await.unwrap();

        // not yet past
        assert!(f.ledger.expire_before(day()).await.unwrap().is_empty());

        let expired = f.ledger.expire_before(day().succ_opt().unwrap()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].booking_id, no_show.booking_id);
        assert_eq!(expired[0].status, BookingStatus::Expired);
        assert_eq!(f.slots.get(s.id).await.unwrap().booked_count, 3);

        assert!(matches!(
            f.ledger.expire(&came.booking_id, day().succ_opt().unwrap()).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn listings() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let first = f.ledger.create(request(&s, 1)).await.unwrap();
        let mut other = request(&s, 1);
        other.user_id = "user-2".into();
        f.ledger.create(other).await.unwrap();

        let mine = f.ledger.list_by_user("user-1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].booking_id, first.booking_id);
        assert_eq!(f.ledger.list_by_date(day()).await.unwrap().len(), 2);
        assert!(f
            .ledger
            .list_by_date(day().succ_opt().unwrap())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_check_ins_single_winner() {
        let f = fixture();
        let s = slot(&f, 10).await;
        let booking = f.ledger.create(request(&s, 2)).await.unwrap();
        let ledger = Arc::new(f.ledger);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let id = booking.booking_id.clone();
            handles.push(tokio::spawn(async move { ledger.check_in(&id).await }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(f.zones.get().await.unwrap().gate, 2);
    }
}
