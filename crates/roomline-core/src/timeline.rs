use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::types::{DiffOp, TimelineItem};

/// What applying one diff op did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Applied as encoded.
    Applied,
    /// Applied after clamping an out-of-range index or length.
    Clamped,
    /// Referenced a position that does not exist; the log is unchanged.
    Ignored,
}

/// Ordered, de-duplicated timeline of one conversation.
///
/// `all` mirrors the positional sequence encoded by the diff stream. `visible`
/// is always rederived from it and never edited directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    all: Vec<TimelineItem>,
    visible: Vec<TimelineItem>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log from an authoritative sequence.
    pub fn from_items(items: Vec<TimelineItem>) -> Self {
        let visible = visible_items(&items);
        Self {
            all: items,
            visible,
        }
    }

    /// Authoritative sequence, thread replies included.
    pub fn all(&self) -> &[TimelineItem] {
        &self.all
    }

    /// Main-timeline items in display order.
    pub fn visible(&self) -> &[TimelineItem] {
        &self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Look up an item (thread replies included) by server event ID.
    pub fn find_by_event_id(&self, event_id: &str) -> Option<&TimelineItem> {
        self.all
            .iter()
            .rev()
            .find(|item| item.event_id() == Some(event_id))
    }

    /// Look up a local send by transaction ID.
    pub fn find_by_txn_id(&self, txn_id: &str) -> Option<&TimelineItem> {
        self.all
            .iter()
            .rev()
            .find(|item| item.txn_id.as_deref() == Some(txn_id))
    }

    /// Apply one diff op in place.
    ///
    /// Never panics: out-of-range positions are clamped or ignored.
    pub fn apply(&mut self, op: &DiffOp) -> DiffOutcome {
        let len = self.all.len();
        let outcome = match op {
            DiffOp::Reset(items) => {
                self.all = items.clone();
                DiffOutcome::Applied
            }
            DiffOp::Append(items) => {
                self.all.extend(items.iter().cloned());
                DiffOutcome::Applied
            }
            DiffOp::PushBack(item) => {
                self.all.push(item.clone());
                DiffOutcome::Applied
            }
            DiffOp::PushFront(item) => {
                self.all.insert(0, item.clone());
                DiffOutcome::Applied
            }
            DiffOp::InsertAt { index, item } => {
                if *index > len {
                    debug!(index, len, "insert_at index past tail; clamping");
                    self.all.push(item.clone());
                    DiffOutcome::Clamped
                } else {
                    self.all.insert(*index, item.clone());
                    DiffOutcome::Applied
                }
            }
            DiffOp::UpdateAt { index, item } => match self.all.get_mut(*index) {
                Some(slot) => {
                    *slot = item.clone();
                    DiffOutcome::Applied
                }
                None => {
                    warn!(index, len, "update_at out of range; ignoring");
                    DiffOutcome::Ignored
                }
            },
            DiffOp::RemoveAt { index } => {
                if *index < len {
                    self.all.remove(*index);
                    DiffOutcome::Applied
                } else {
                    warn!(index, len, "remove_at out of range; ignoring");
                    DiffOutcome::Ignored
                }
            }
            DiffOp::Truncate { length } => {
                if *length > len {
                    debug!(length, len, "truncate length past tail; clamping");
                    DiffOutcome::Clamped
                } else {
                    self.all.truncate(*length);
                    DiffOutcome::Applied
                }
            }
            DiffOp::PopFront => {
                if self.all.is_empty() {
                    DiffOutcome::Ignored
                } else {
                    self.all.remove(0);
                    DiffOutcome::Applied
                }
            }
            DiffOp::PopBack => match self.all.pop() {
                Some(_) => DiffOutcome::Applied,
                None => DiffOutcome::Ignored,
            },
            DiffOp::Clear => {
                self.all.clear();
                DiffOutcome::Applied
            }
        };

        if outcome != DiffOutcome::Ignored {
            self.visible = visible_items(&self.all);
        }
        trace!(
            op = op.kind(),
            ?outcome,
            all = self.all.len(),
            visible = self.visible.len(),
            "diff applied"
        );
        outcome
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }
}

/// Apply one op to a snapshot, returning the next snapshot.
pub fn reduce(current: &EventLog, op: &DiffOp) -> EventLog {
    let mut next = current.clone();
    next.apply(op);
    next
}

/// Fold an ordered sequence of ops over a starting snapshot.
pub fn reduce_all<'a>(start: &EventLog, ops: impl IntoIterator<Item = &'a DiffOp>) -> EventLog {
    let mut log = start.clone();
    for op in ops {
        log.apply(op);
    }
    log
}

/// Derive the main-timeline view from an authoritative sequence.
///
/// Thread replies are dropped, duplicates by `item_id` keep their last
/// occurrence, and the result is stably sorted by timestamp.
pub fn visible_items(all: &[TimelineItem]) -> Vec<TimelineItem> {
    let mut visible = distinct_keep_last(all.iter().filter(|item| !item.is_thread_reply()));
    visible.sort_by_key(|item| item.timestamp_ms);
    visible
}

/// Merge two item lists chronologically; `incoming` wins on `item_id` clashes.
pub fn merge_chronological(existing: &[TimelineItem], incoming: &[TimelineItem]) -> Vec<TimelineItem> {
    let mut merged = distinct_keep_last(existing.iter().chain(incoming.iter()));
    merged.sort_by_key(|item| item.timestamp_ms);
    merged
}

fn distinct_keep_last<'a, I>(items: I) -> Vec<TimelineItem>
where
    I: DoubleEndedIterator<Item = &'a TimelineItem>,
{
    let mut seen: HashSet<&'a str> = HashSet::new();
    let mut out = Vec::new();
    for item in items.rev() {
        if seen.insert(item.item_id.as_str()) {
            out.push(item.clone());
        }
    }
    out.reverse();
    out
}
