use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{SosRequest, SosType};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    SosCreated(SosRequest),
    SosResolved(SosRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Fire-and-forget delivery of SOS lifecycle events. Errors are logged by the
/// caller and never undo dispatch state.
pub trait NotificationSink: Send + Sync {
    fn on_sos_created(&self, case: &SosRequest) -> Result<(), NotifyError>;
    fn on_sos_resolved(&self, case: &SosRequest) -> Result<(), NotifyError>;
}

/// Broadcast hub with one channel per SOS type, so a medical desk only hears medical cases.
pub struct NotifyHub {
    channels: DashMap<SosType, broadcast::Sender<DispatchEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one SOS type. Creates the channel if needed.
    pub fn subscribe(&self, kind: SosType) -> broadcast::Receiver<DispatchEvent> {
        self.channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, kind: SosType, event: DispatchEvent) {
        if let Some(sender) = self.channels.get(&kind) {
            let _ = sender.send(event);
        }
    }
}

impl NotificationSink for NotifyHub {
    fn on_sos_created(&self, case: &SosRequest) -> Result<(), NotifyError> {
        self.publish(case.kind, DispatchEvent::SosCreated(case.clone()));
        Ok(())
    }

    fn on_sos_resolved(&self, case: &SosRequest) -> Result<(), NotifyError> {
        self.publish(case.kind, DispatchEvent::SosResolved(case.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoPoint, Severity, SosStatus};
    use ulid::Ulid;

    fn case(kind: SosType) -> SosRequest {
        SosRequest {
            id: Ulid::new(),
            user_id: "pilgrim-7".into(),
            kind,
            severity: Severity::Medium,
            location: GeoPoint::ORIGIN,
            note: None,
            status: SosStatus::Pending,
            assigned_to: None,
            responder: None,
            eta: None,
            created_at: 0,
            resolved_at: None,
            resolved_by: None,
            escalations: 0,
        }
    }

    #[tokio::test]
    async fn subscriber_hears_own_type_only() {
        let hub = NotifyHub::new();
        let mut medical = hub.subscribe(SosType::Medical);
        let mut security = hub.subscribe(SosType::Security);

        let c = case(SosType::Medical);
        hub.on_sos_created(&c).unwrap();

        assert_eq!(medical.recv().await.unwrap(), DispatchEvent::SosCreated(c));
        assert!(matches!(
            security.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.on_sos_resolved(&case(SosType::CrowdRisk)).unwrap();
    }
}
