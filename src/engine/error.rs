use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::access::Action;
use crate::model::{InvalidValue, Role, TimeSlot};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("user name already taken: {0}")]
    UsernameTaken(String),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    /// User-correctable: the slot is held by `existing`.
    #[error("room is already booked for this time slot ({date} {slot}, reservation {existing})")]
    Conflict {
        existing: Ulid,
        date: NaiveDate,
        slot: TimeSlot,
    },
    #[error("room {0} is not available for booking")]
    RoomUnavailable(Ulid),
    #[error("permission denied: {role} may not {action}")]
    PermissionDenied { role: Role, action: Action },
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidValue),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    StorageError(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }
}
