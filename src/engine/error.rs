use ulid::Ulid;

use crate::model::Kind;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing or malformed input; the caller can correct and retry.
    Validation(String),
    CapacityExceeded {
        slot_id: Ulid,
        requested: u32,
        available: u32,
    },
    SlotLocked(Ulid),
    NotFound(Kind, String),
    InvalidTransition {
        kind: Kind,
        from: &'static str,
        to: &'static str,
    },
    AlreadyAssigned(Ulid),
    UnitUnavailable(String),
    StoreUnavailable(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn not_found(kind: Kind, key: impl ToString) -> Self {
        EngineError::NotFound(kind, key.to_string())
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::SlotLocked(_) => "slot_locked",
            EngineError::NotFound(..) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyAssigned(_) => "already_assigned",
            EngineError::UnitUnavailable(_) => "unit_unavailable",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::CapacityExceeded {
                slot_id,
                requested,
                available,
            } => write!(
                f,
                "slot {slot_id} capacity exceeded: requested {requested}, available {available}"
            ),
            EngineError::SlotLocked(id) => write!(f, "slot {id} is locked"),
            EngineError::NotFound(kind, key) => write!(f, "{} not found: {key}", kind.as_str()),
            EngineError::InvalidTransition { kind, from, to } => {
                write!(f, "invalid {} transition: {from} -> {to}", kind.as_str())
            }
            EngineError::AlreadyAssigned(id) => write!(f, "case {id} is already assigned"),
            EngineError::UnitUnavailable(id) => write!(f, "unit unavailable: {id}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}
