use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SubscriptionState;

/// Broad error category used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the homeserver.
    RateLimited,
    /// Room, event or transaction is unknown to the collaborator.
    NotFound,
    /// Caller supplied an unusable value.
    InvalidInput,
    /// Subscription lifecycle misuse or a closed conversation.
    Lifecycle,
    /// Bug or invariant break.
    Internal,
}

/// Stable error payload crossing the engine/presentation boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct RoomlineError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RoomlineError {
    /// Construct a new error.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SubscriptionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Lifecycle,
            "invalid_state_transition",
            format!("cannot run '{action}' while subscriptions are {current:?}"),
        )
    }

    /// Error returned once a conversation has been closed.
    pub fn room_closed(room_id: &str) -> Self {
        Self::new(
            ErrorCategory::Lifecycle,
            "room_closed",
            format!("room {room_id} is closed"),
        )
    }

    /// Whether the failure is worth retrying later without user action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::RateLimited
        )
    }
}
