use crate::{error::RoomlineError, types::SubscriptionState};

/// Lifecycle of one conversation's subscription set.
///
/// `Closed -> Opening -> Active -> Closed`, with `Opening -> Closed` when an
/// acquisition fails part-way.
#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine {
    state: SubscriptionState,
    generation: u64,
}

impl Default for SubscriptionStateMachine {
    fn default() -> Self {
        Self {
            state: SubscriptionState::Closed,
            generation: 0,
        }
    }
}

impl SubscriptionStateMachine {
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Number of times the set has been opened. Tags async work so results
    /// from an earlier opening can be told apart.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }

    pub fn begin_open(&mut self) -> Result<u64, RoomlineError> {
        self.transition_from_state(
            SubscriptionState::Closed,
            SubscriptionState::Opening,
            "begin_open",
        )?;
        self.generation += 1;
        Ok(self.generation)
    }

    pub fn mark_active(&mut self) -> Result<(), RoomlineError> {
        self.transition_from_state(
            SubscriptionState::Opening,
            SubscriptionState::Active,
            "mark_active",
        )
    }

    pub fn abort_open(&mut self) -> Result<(), RoomlineError> {
        self.transition_from_state(
            SubscriptionState::Opening,
            SubscriptionState::Closed,
            "abort_open",
        )
    }

    /// Move to `Closed`. Returns `false` when already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SubscriptionState::Closed {
            return false;
        }
        self.state = SubscriptionState::Closed;
        true
    }

    fn transition_from_state(
        &mut self,
        expected: SubscriptionState,
        next: SubscriptionState,
        action: &str,
    ) -> Result<(), RoomlineError> {
        if self.state != expected {
            return Err(RoomlineError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(())
    }
}
