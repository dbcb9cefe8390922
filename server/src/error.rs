//! Error types for lock acquisition and request handling.

use shared::{LockMode, ObjectId, Resource, UserId};
use std::time::Duration;
use thiserror::Error;

/// Failures produced by the ordered locking core.
///
/// [`LockError::OrderViolation`] is a programming error in how a call chain
/// composes its acquisitions. It is never retried and always reaches the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("{}", describe_violation(.requested, .held_max))]
    OrderViolation {
        requested: Resource,
        held_max: Resource,
    },

    #[error("{resource} is not held in {needed} mode by this token")]
    NotHeld { resource: Resource, needed: LockMode },

    #[error("token for {resource} was used after its lock scope ended")]
    StaleToken { resource: Resource },

    #[error("timed out after {waited:?} waiting for {resource}")]
    Timeout { resource: Resource, waited: Duration },

    #[error("{resource} lock is shut down")]
    Closed { resource: Resource },
}

fn describe_violation(requested: &Resource, held_max: &Resource) -> String {
    if requested == held_max {
        format!("lock order violation: {} is already held", requested)
    } else {
        format!(
            "lock order violation: cannot acquire {} (order {}) while holding {} (order {})",
            requested,
            requested.order(),
            held_max,
            held_max.order()
        )
    }
}

impl LockError {
    pub fn is_order_violation(&self) -> bool {
        matches!(self, LockError::OrderViolation { .. })
    }

    /// Whether a caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }

    pub fn resource(&self) -> Resource {
        match self {
            LockError::OrderViolation { requested, .. } => *requested,
            LockError::NotHeld { resource, .. }
            | LockError::StaleToken { resource }
            | LockError::Timeout { resource, .. }
            | LockError::Closed { resource } => *resource,
        }
    }
}

/// Errors surfaced by caches, the store and the request server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("not joined")]
    NotJoined,

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ServerError {
    pub fn lock_error(&self) -> Option<&LockError> {
        match self {
            ServerError::Lock(err) => Some(err),
            _ => None,
        }
    }
}
