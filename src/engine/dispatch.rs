use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::registry::{AmbulanceFleet, SecurityUnitRegistry};
use super::{now_ms, update_entity, EngineError};
use crate::config::DispatchConfig;
use crate::limits::{MAX_ETA_MINUTES, MAX_LOCATION_LEN, MAX_NOTE_LEN};
use crate::model::{
    Filter, GeoPoint, Kind, Ms, ResponderKind, Severity, SosRequest, SosStatus, SosType,
};
use crate::notify::{NotificationSink, NotifyError};
use crate::observability::{
    outcome, ESCALATIONS_TOTAL, NOTIFY_FAILURES_TOTAL, RELEASES_DEFERRED_TOTAL,
    RELEASES_RECONCILED_TOTAL, SOS_TOTAL,
};
use crate::store::{fetch, fetch_all, save, EntityStore};

/// An SOS as raised from the field. Coordinates may be missing; a free-text
/// location is kept in the note either way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SosReport {
    pub user_id: String,
    pub kind: Option<SosType>,
    pub severity: Option<Severity>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub location_text: Option<String>,
    pub note: Option<String>,
}

/// Named selections over the SOS queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SosView {
    All,
    ByType(SosType),
    ByStatus(SosStatus),
    /// Everything not yet resolved.
    Active,
    Medical,
    /// Every case answered by security units.
    Security,
}

impl SosView {
    fn filter(self) -> Filter {
        match self {
            SosView::ByType(kind) => Filter::SosType(kind),
            SosView::Medical => Filter::SosType(SosType::Medical),
            SosView::ByStatus(status) => Filter::SosStatus(status),
            SosView::All | SosView::Active | SosView::Security => Filter::All,
        }
    }

    fn includes(self, case: &SosRequest) -> bool {
        match self {
            SosView::All => true,
            SosView::ByType(kind) => case.kind == kind,
            SosView::ByStatus(status) => case.status == status,
            SosView::Active => case.status != SosStatus::Resolved,
            SosView::Medical => case.kind == SosType::Medical,
            SosView::Security => case.kind.responder() == ResponderKind::Security,
        }
    }
}

/// SOS intake and the Pending → Assigned → Enroute → Resolved lifecycle.
///
/// Assigning claims the unit first and then moves the case; if the case move
/// fails the claim is undone, so a unit is never left holding a case that
/// doesn't name it.
pub struct EmergencyDispatchCoordinator {
    pub(super) store: Arc<dyn EntityStore>,
    security: Arc<SecurityUnitRegistry>,
    ambulances: Arc<AmbulanceFleet>,
    sink: Arc<dyn NotificationSink>,
    pub(super) config: DispatchConfig,
}

impl EmergencyDispatchCoordinator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        security: Arc<SecurityUnitRegistry>,
        ambulances: Arc<AmbulanceFleet>,
        sink: Arc<dyn NotificationSink>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            security,
            ambulances,
            sink,
            config,
        }
    }

    pub async fn report(&self, input: SosReport) -> Result<SosRequest, EngineError> {
        let result = self.try_report(input).await;
        metrics::counter!(SOS_TOTAL, "op" => "report", "outcome" => outcome(&result)).increment(1);
        result
    }

    async fn try_report(&self, input: SosReport) -> Result<SosRequest, EngineError> {
        let kind = input
            .kind
            .ok_or_else(|| EngineError::validation("SOS type is required"))?;
        let (location, note) = normalise_location(&input)?;
        let case = SosRequest {
            id: Ulid::new(),
            user_id: input.user_id.trim().to_string(),
            kind,
            severity: input.severity.unwrap_or(Severity::Medium),
            location,
            note,
            status: SosStatus::Pending,
            assigned_to: None,
            responder: None,
            eta: None,
            created_at: now_ms(),
            resolved_at: None,
            resolved_by: None,
            escalations: 0,
        };
        let case = save(self.store.as_ref(), case).await?;
        info!(
            "SOS {} reported: {} ({})",
            case.id,
            case.kind.as_str(),
            case.severity.as_str()
        );
        self.notified(&case, self.sink.on_sos_created(&case));
        Ok(case)
    }

    pub async fn get(&self, id: Ulid) -> Result<SosRequest, EngineError> {
        fetch::<SosRequest>(self.store.as_ref(), &id.to_string())
            .await?
            .ok_or_else(|| EngineError::not_found(Kind::Sos, id))
    }

    /// `Pending` → `Assigned` to a specific unit from either pool.
    pub async fn assign(
        &self,
        id: Ulid,
        unit_id: &str,
        eta: Option<u32>,
    ) -> Result<SosRequest, EngineError> {
        let result = self.try_assign(id, unit_id, eta).await;
        metrics::counter!(SOS_TOTAL, "op" => "assign", "outcome" => outcome(&result)).increment(1);
        result
    }

    async fn try_assign(
        &self,
        id: Ulid,
        unit_id: &str,
        eta: Option<u32>,
    ) -> Result<SosRequest, EngineError> {
        validate_eta(eta)?;
        let case = self.get(id).await?;
        if case.status != SosStatus::Pending {
            return Err(EngineError::AlreadyAssigned(id));
        }
        let responder = self.locate_unit(unit_id, case.kind.responder()).await?;
        self.claim_unit(responder, unit_id, id).await?;

        let assigned = update_entity::<SosRequest, _>(self.store.as_ref(), &id.to_string(), |c| {
            if c.status != SosStatus::Pending {
                return Err(EngineError::AlreadyAssigned(c.id));
            }
            Ok(SosRequest {
                status: SosStatus::Assigned,
                assigned_to: Some(unit_id.to_string()),
                responder: Some(responder),
                eta,
                ..c.clone()
            })
        })
        .await;

        match assigned {
            Ok(case) => {
                info!("SOS {id} assigned to {unit_id}");
                Ok(case)
            }
            Err(e) => {
                if let Err(undo) = self.release_unit(responder, unit_id, id).await {
                    warn!("unit {unit_id} still held for SOS {id}: {undo}");
                }
                Err(e)
            }
        }
    }

    /// Assign the first free unit of the pool that answers this kind of case,
    /// with a severity-based ETA. A unit taken in the meantime is skipped.
    pub async fn dispatch(&self, id: Ulid) -> Result<SosRequest, EngineError> {
        let case = self.get(id).await?;
        if case.status != SosStatus::Pending {
            return Err(EngineError::AlreadyAssigned(id));
        }
        let responder = case.kind.responder();
        let eta = Some(self.config.default_eta(case.severity));
        let candidates: Vec<String> = match responder {
            ResponderKind::Ambulance => self
                .ambulances
                .available()
                .await?
                .into_iter()
                .map(|a| a.id)
                .collect(),
            ResponderKind::Security => self
                .security
                .available()
                .await?
                .into_iter()
                .map(|u| u.id)
                .collect(),
        };

        for unit_id in candidates {
            match self.assign(id, &unit_id, eta).await {
                Err(EngineError::UnitUnavailable(_)) => {
                    debug!("SOS {id}: {unit_id} taken, trying next");
                }
                other => return other,
            }
        }
        Err(EngineError::UnitUnavailable(format!(
            "no free {} unit",
            match responder {
                ResponderKind::Ambulance => "ambulance",
                ResponderKind::Security => "security",
            }
        )))
    }

    /// `Assigned` → `Enroute`, optionally revising the ETA.
    pub async fn mark_enroute(&self, id: Ulid, eta: Option<u32>) -> Result<SosRequest, EngineError> {
        validate_eta(eta)?;
        let result = update_entity::<SosRequest, _>(self.store.as_ref(), &id.to_string(), |c| {
            let mut next = advance(c, SosStatus::Enroute)?;
            if eta.is_some() {
                next.eta = eta;
            }
            Ok(next)
        })
        .await;
        metrics::counter!(SOS_TOTAL, "op" => "enroute", "outcome" => outcome(&result)).increment(1);
        result
    }

    /// → `Resolved`. The unit goes back to its pool.
    ///
    /// Closing the case is the commit point. A unit that can't be freed right
    /// away keeps naming the resolved case until
    /// [`reconcile_units`](Self::reconcile_units) frees it.
    pub async fn resolve(&self, id: Ulid) -> Result<SosRequest, EngineError> {
        let now = now_ms();
        let result = update_entity::<SosRequest, _>(self.store.as_ref(), &id.to_string(), |c| {
            let mut next = advance(c, SosStatus::Resolved)?;
            next.resolved_at = Some(now);
            next.resolved_by = c.assigned_to.clone();
            next.assigned_to = None;
            Ok(next)
        })
        .await;
        metrics::counter!(SOS_TOTAL, "op" => "resolve", "outcome" => outcome(&result)).increment(1);
        let case = result?;

        if let (Some(unit_id), Some(responder)) = (&case.resolved_by, case.responder)
            && let Err(e) = self.release_unit(responder, unit_id, id).await
        {
            warn!("SOS {id} resolved, {unit_id} deferred to the sweep: {e}");
            metrics::counter!(RELEASES_DEFERRED_TOTAL, "kind" => "unit").increment(1);
        }
        info!("SOS {id} resolved");
        self.notified(&case, self.sink.on_sos_resolved(&case));
        Ok(case)
    }

    /// Bump severity one level. Allowed on any open case.
    pub async fn escalate(&self, id: Ulid) -> Result<SosRequest, EngineError> {
        let case = update_entity::<SosRequest, _>(self.store.as_ref(), &id.to_string(), bump)
            .await?;
        metrics::counter!(ESCALATIONS_TOTAL, "source" => "manual").increment(1);
        info!("SOS {id} escalated to {}", case.severity.as_str());
        Ok(case)
    }

    /// Escalate every `Pending` case that has waited one more escalation
    /// window than it has been escalated for.
    pub async fn escalate_stale(&self, now: Ms) -> Result<Vec<SosRequest>, EngineError> {
        let window = Ms::try_from(self.config.escalate_after.as_millis()).unwrap_or(Ms::MAX);
        let pending =
            fetch_all::<SosRequest>(self.store.as_ref(), &Filter::SosStatus(SosStatus::Pending))
                .await?;
        let due: Vec<String> = pending
            .iter()
            .filter(|c| overdue(c, now, window))
            .map(|c| c.id.to_string())
            .collect();

        let results = join_all(due.iter().map(|key| {
            update_entity::<SosRequest, _>(self.store.as_ref(), key, move |c| {
                if c.status != SosStatus::Pending || !overdue(c, now, window) {
                    return Err(EngineError::InvalidTransition {
                        kind: Kind::Sos,
                        from: c.status.as_str(),
                        to: "escalated",
                    });
                }
                bump(c)
            })
        }))
        .await;

        let mut escalated = Vec::new();
        for result in results {
            match result {
                Ok(case) => escalated.push(case),
                // assigned or escalated by someone else since the scan
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => warn!("stale SOS escalation failed: {e}"),
            }
        }
        if !escalated.is_empty() {
            metrics::counter!(ESCALATIONS_TOTAL, "source" => "sweep")
                .increment(escalated.len() as u64);
        }
        Ok(escalated)
    }

    /// Free every unit still holding a case that has been resolved.
    /// Returns how many were freed.
    pub async fn reconcile_units(&self) -> Result<usize, EngineError> {
        let mut held: Vec<(ResponderKind, String, Ulid)> = Vec::new();
        for unit in self.ambulances.list().await? {
            if let Some(case) = unit.assigned_case {
                held.push((ResponderKind::Ambulance, unit.id, case));
            }
        }
        for unit in self.security.list().await? {
            if let Some(case) = unit.assigned_case {
                held.push((ResponderKind::Security, unit.id, case));
            }
        }

        let mut freed = 0;
        for (responder, unit_id, case) in held {
            let closed = fetch::<SosRequest>(self.store.as_ref(), &case.to_string())
                .await?
                .is_some_and(|c| c.status == SosStatus::Resolved);
            if !closed {
                continue;
            }
            match self.release_unit(responder, &unit_id, case).await {
                Ok(()) => {
                    info!("{unit_id} freed from resolved SOS {case}");
                    freed += 1;
                }
                Err(e) => warn!("{unit_id} still held by resolved SOS {case}: {e}"),
            }
        }
        if freed > 0 {
            metrics::counter!(RELEASES_RECONCILED_TOTAL, "kind" => "unit").increment(freed as u64);
        }
        Ok(freed)
    }

    pub async fn list_sos(&self, view: SosView) -> Result<Vec<SosRequest>, EngineError> {
        let mut cases = fetch_all::<SosRequest>(self.store.as_ref(), &view.filter()).await?;
        cases.retain(|c| view.includes(c));
        cases.sort_by_key(|c| (c.created_at, c.id));
        Ok(cases)
    }

    async fn locate_unit(
        &self,
        unit_id: &str,
        preferred: ResponderKind,
    ) -> Result<ResponderKind, EngineError> {
        let in_ambulances = self.ambulances.find(unit_id).await?.is_some();
        let in_security = self.security.find(unit_id).await?.is_some();
        match (preferred, in_ambulances, in_security) {
            (ResponderKind::Ambulance, true, _) | (ResponderKind::Security, true, false) => {
                Ok(ResponderKind::Ambulance)
            }
            (_, _, true) => Ok(ResponderKind::Security),
            (ResponderKind::Ambulance, false, false) => {
                Err(EngineError::not_found(Kind::Ambulance, unit_id))
            }
            (ResponderKind::Security, false, false) => {
                Err(EngineError::not_found(Kind::SecurityUnit, unit_id))
            }
        }
    }

    async fn claim_unit(
        &self,
        responder: ResponderKind,
        unit_id: &str,
        case: Ulid,
    ) -> Result<(), EngineError> {
        match responder {
            ResponderKind::Ambulance => self.ambulances.claim(unit_id, case).await.map(drop),
            ResponderKind::Security => self.security.claim(unit_id, case).await.map(drop),
        }
    }

    async fn release_unit(
        &self,
        responder: ResponderKind,
        unit_id: &str,
        case: Ulid,
    ) -> Result<(), EngineError> {
        match responder {
            ResponderKind::Ambulance => self.ambulances.release(unit_id, case).await.map(drop),
            ResponderKind::Security => self.security.release(unit_id, case).await.map(drop),
        }
    }

    fn notified(&self, case: &SosRequest, result: Result<(), NotifyError>) {
        if let Err(e) = result {
            warn!("SOS {}: {e}", case.id);
            metrics::counter!(NOTIFY_FAILURES_TOTAL).increment(1);
        }
    }
}

fn advance(case: &SosRequest, to: SosStatus) -> Result<SosRequest, EngineError> {
    if !case.status.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            kind: Kind::Sos,
            from: case.status.as_str(),
            to: to.as_str(),
        });
    }
    Ok(SosRequest {
        status: to,
        ..case.clone()
    })
}

fn bump(case: &SosRequest) -> Result<SosRequest, EngineError> {
    if case.status == SosStatus::Resolved {
        return Err(EngineError::InvalidTransition {
            kind: Kind::Sos,
            from: case.status.as_str(),
            to: "escalated",
        });
    }
    Ok(SosRequest {
        severity: case.severity.escalated(),
        escalations: case.escalations + 1,
        ..case.clone()
    })
}

fn overdue(case: &SosRequest, now: Ms, window: Ms) -> bool {
    case.severity < Severity::Critical
        && now.saturating_sub(case.created_at)
            >= window.saturating_mul(Ms::from(case.escalations) + 1)
}

fn validate_eta(eta: Option<u32>) -> Result<(), EngineError> {
    match eta {
        Some(minutes) if minutes > MAX_ETA_MINUTES => Err(EngineError::validation(format!(
            "ETA must be at most {MAX_ETA_MINUTES} minutes"
        ))),
        _ => Ok(()),
    }
}

/// Coordinates are optional but come as a pair; without them the case sits at
/// the origin and the free-text location goes into the note.
fn normalise_location(input: &SosReport) -> Result<(GeoPoint, Option<String>), EngineError> {
    let text = input
        .location_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let note = input
        .note
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    if text.is_some_and(|t| t.chars().count() > MAX_LOCATION_LEN) {
        return Err(EngineError::validation(format!(
            "location is longer than {MAX_LOCATION_LEN} characters"
        )));
    }
    if note.is_some_and(|n| n.chars().count() > MAX_NOTE_LEN) {
        return Err(EngineError::validation(format!(
            "note is longer than {MAX_NOTE_LEN} characters"
        )));
    }

    let point = match (input.lat, input.lng) {
        (Some(lat), Some(lng)) => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
                return Err(EngineError::validation("coordinates out of range"));
            }
            GeoPoint { lat, lng }
        }
        (None, None) => GeoPoint::ORIGIN,
        _ => {
            return Err(EngineError::validation(
                "latitude and longitude must be given together",
            ));
        }
    };
    let note = match (text, note) {
        (Some(t), Some(n)) => Some(format!("Location: {t}. {n}")),
        (Some(t), None) => Some(format!("Location: {t}")),
        (None, n) => n.map(str::to_string),
    };
    Ok((point, note))
}
