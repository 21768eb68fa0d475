use std::collections::HashMap;

use tracing::debug;

use crate::types::{OutboxEntry, SendState, SendUpdate};

/// Local send progress keyed by transaction ID.
///
/// Entries keep the order in which their transaction was first seen. `Sent`
/// entries stay tracked but are hidden from [`OutboxTracker::visible_for`].
#[derive(Debug, Clone, Default)]
pub struct OutboxTracker {
    entries: Vec<OutboxEntry>,
    index: HashMap<String, usize>,
}

impl OutboxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upsert the entry for `update.txn_id`. Returns `true` if anything changed.
    pub fn apply(&mut self, update: SendUpdate) -> bool {
        let entry = OutboxEntry::from(update);
        match self.index.get(&entry.txn_id) {
            Some(&idx) => {
                if self.entries[idx] == entry {
                    return false;
                }
                debug!(
                    txn_id = %entry.txn_id,
                    from = ?self.entries[idx].state,
                    to = ?entry.state,
                    attempts = entry.attempts,
                    "outbox entry updated"
                );
                self.entries[idx] = entry;
            }
            None => {
                debug!(txn_id = %entry.txn_id, state = ?entry.state, "outbox entry added");
                self.index.insert(entry.txn_id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        true
    }

    pub fn get(&self, txn_id: &str) -> Option<&OutboxEntry> {
        self.index.get(txn_id).map(|&idx| &self.entries[idx])
    }

    /// Entries for `room_id` that are still pending or failed.
    pub fn visible_for(&self, room_id: &str) -> Vec<OutboxEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.room_id == room_id && entry.state != SendState::Sent)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "!room:example.org";

    fn update(txn_id: &str, state: SendState, attempts: u32) -> SendUpdate {
        SendUpdate {
            room_id: ROOM.into(),
            txn_id: txn_id.into(),
            attempts,
            state,
            event_id: (state == SendState::Sent).then(|| format!("${txn_id}")),
            error: (state == SendState::Failed).then(|| "timeout".to_owned()),
        }
    }

    #[test]
    fn tracks_a_send_through_to_sent() {
        let mut outbox = OutboxTracker::new();

        outbox.apply(update("t1", SendState::Enqueued, 0));
        outbox.apply(update("t1", SendState::Sending, 1));
        assert_eq!(outbox.visible_for(ROOM).len(), 1);
        assert_eq!(outbox.visible_for(ROOM)[0].state, SendState::Sending);

        outbox.apply(update("t1", SendState::Sent, 1));
        assert!(outbox.visible_for(ROOM).is_empty());
        assert_eq!(
            outbox.get("t1").and_then(|e| e.event_id.as_deref()),
            Some("$t1")
        );
    }

    #[test]
    fn keeps_one_entry_per_txn_in_first_seen_order() {
        let mut outbox = OutboxTracker::new();
        outbox.apply(update("a", SendState::Enqueued, 0));
        outbox.apply(update("b", SendState::Enqueued, 0));
        outbox.apply(update("a", SendState::Retrying, 2));

        let visible = outbox.visible_for(ROOM);
        let ids: Vec<_> = visible.iter().map(|e| e.txn_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(visible[0].attempts, 2);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn late_update_overwrites_a_sent_entry() {
        let mut outbox = OutboxTracker::new();
        outbox.apply(update("t1", SendState::Sent, 1));
        assert!(outbox.apply(update("t1", SendState::Failed, 2)));

        let visible = outbox.visible_for(ROOM);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].error.as_deref(), Some("timeout"));
    }

    #[test]
    fn repeated_identical_update_is_not_a_change() {
        let mut outbox = OutboxTracker::new();
        assert!(outbox.apply(update("t1", SendState::Sending, 1)));
        assert!(!outbox.apply(update("t1", SendState::Sending, 1)));
    }

    #[test]
    fn filters_by_room() {
        let mut outbox = OutboxTracker::new();
        let mut other = update("x", SendState::Failed, 3);
        other.room_id = "!other:example.org".into();
        outbox.apply(other);
        outbox.apply(update("y", SendState::Failed, 1));

        assert_eq!(outbox.visible_for(ROOM).len(), 1);
        assert_eq!(outbox.visible_for("!other:example.org").len(), 1);
    }
}
