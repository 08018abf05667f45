use tracing::info;
use ulid::Ulid;

use super::dispatch::EmergencyDispatchCoordinator;
use super::{now_ms, update_entity, EngineError};
use crate::limits::{MAX_LOCATION_LEN, MAX_NAME_LEN};
use crate::model::{Filter, Incident, IncidentStatus, Kind, Severity};
use crate::observability::{outcome, ESCALATIONS_TOTAL, INCIDENTS_TOTAL};
use crate::store::{fetch, fetch_all, save};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentReport {
    pub kind: String,
    pub location: String,
    pub severity: Option<Severity>,
}

// Incidents are routed by location through a static unit map; they never
// touch the live responder pools.
impl EmergencyDispatchCoordinator {
    pub fn assign_nearest_unit(&self, location: &str) -> String {
        self.config.unit_for(location).to_string()
    }

    pub async fn report_incident(&self, report: IncidentReport) -> Result<Incident, EngineError> {
        let result = self.try_report_incident(report).await;
        metrics::counter!(INCIDENTS_TOTAL, "op" => "report", "outcome" => outcome(&result))
            .increment(1);
        result
    }

    async fn try_report_incident(&self, report: IncidentReport) -> Result<Incident, EngineError> {
        let kind = required(&report.kind, "incident type", MAX_NAME_LEN)?;
        let location = required(&report.location, "location", MAX_LOCATION_LEN)?;
        let incident = Incident {
            id: Ulid::new(),
            assigned_unit: self.assign_nearest_unit(&location),
            kind,
            location,
            severity: report.severity.unwrap_or(Severity::Medium),
            status: IncidentStatus::Active,
            escalated_to: None,
            timestamp: now_ms(),
            resolved_at: None,
        };
        let incident = save(self.store.as_ref(), incident).await?;
        info!(
            "incident {} reported at {}: {} -> {}",
            incident.id, incident.location, incident.kind, incident.assigned_unit
        );
        Ok(incident)
    }

    pub async fn get_incident(&self, id: Ulid) -> Result<Incident, EngineError> {
        fetch::<Incident>(self.store.as_ref(), &id.to_string())
            .await?
            .ok_or_else(|| EngineError::not_found(Kind::Incident, id))
    }

    pub async fn respond_incident(&self, id: Ulid) -> Result<Incident, EngineError> {
        let result = update_entity::<Incident, _>(self.store.as_ref(), &id.to_string(), |i| {
            advance(i, IncidentStatus::Responded)
        })
        .await;
        metrics::counter!(INCIDENTS_TOTAL, "op" => "respond", "outcome" => outcome(&result))
            .increment(1);
        result
    }

    pub async fn resolve_incident(&self, id: Ulid) -> Result<Incident, EngineError> {
        let now = now_ms();
        let result = update_entity::<Incident, _>(self.store.as_ref(), &id.to_string(), |i| {
            let mut next = advance(i, IncidentStatus::Resolved)?;
            next.resolved_at = Some(now);
            Ok(next)
        })
        .await;
        metrics::counter!(INCIDENTS_TOTAL, "op" => "resolve", "outcome" => outcome(&result))
            .increment(1);
        let incident = result?;
        info!("incident {id} resolved");
        Ok(incident)
    }

    /// Hand the incident to another party. Status is unchanged; severity is
    /// set if given and bumped one level otherwise.
    pub async fn escalate_incident(
        &self,
        id: Ulid,
        escalate_to: &str,
        severity: Option<Severity>,
    ) -> Result<Incident, EngineError> {
        let escalate_to = required(escalate_to, "escalation target", MAX_NAME_LEN)?;
        let incident = update_entity::<Incident, _>(self.store.as_ref(), &id.to_string(), |i| {
            if i.status == IncidentStatus::Resolved {
                return Err(EngineError::InvalidTransition {
                    kind: Kind::Incident,
                    from: i.status.as_str(),
                    to: "escalated",
                });
            }
            Ok(Incident {
                assigned_unit: escalate_to.clone(),
                escalated_to: Some(escalate_to.clone()),
                severity: severity.unwrap_or_else(|| i.severity.escalated()),
                ..i.clone()
            })
        })
        .await?;
        metrics::counter!(ESCALATIONS_TOTAL, "source" => "incident").increment(1);
        info!(
            "incident {id} escalated to {escalate_to} ({})",
            incident.severity.as_str()
        );
        Ok(incident)
    }

    /// Incidents, newest first, optionally limited to one status.
    pub async fn list_incidents(
        &self,
        status: Option<IncidentStatus>,
    ) -> Result<Vec<Incident>, EngineError> {
        let filter = status.map_or(Filter::All, Filter::IncidentStatus);
        let mut incidents = fetch_all::<Incident>(self.store.as_ref(), &filter).await?;
        incidents.sort_by_key(|i| std::cmp::Reverse((i.timestamp, i.id)));
        Ok(incidents)
    }
}

fn advance(incident: &Incident, to: IncidentStatus) -> Result<Incident, EngineError> {
    if !incident.status.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            kind: Kind::Incident,
            from: incident.status.as_str(),
            to: to.as_str(),
        });
    }
    Ok(Incident {
        status: to,
        ..incident.clone()
    })
}

fn required(value: &str, field: &str, max: usize) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    if value.chars().count() > max {
        return Err(EngineError::validation(format!(
            "{field} is longer than {max} characters"
        )));
    }
    Ok(value.to_string())
}
