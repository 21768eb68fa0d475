//! Derived views over an [`EventLog`](crate::timeline::EventLog).
//!
//! The engine never queries collaborators itself. It decides which
//! projections are stale after a diff and returns a [`ProjectionPlan`]; the
//! runtime resolves the plan asynchronously and feeds results back into the
//! tallies below.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::{
    timeline::EventLog,
    types::{Attachment, DiffOp, ReactionChip, ReadState, ThreadSummary, TimelineItem},
};

const DEFAULT_REACTION_WINDOW: usize = 10;
const DEFAULT_THUMBNAIL_WINDOW: usize = 8;
const DEFAULT_THREAD_WINDOW: usize = 5;

/// Bounds on how much secondary work one update may schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionConfig {
    /// Trailing arrivals whose reactions are refreshed.
    pub reaction_window: usize,
    /// Trailing arrivals considered for thumbnail prefetch.
    pub thumbnail_window: usize,
    /// Maximum thread roots refreshed per update.
    pub thread_window: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            reaction_window: DEFAULT_REACTION_WINDOW,
            thumbnail_window: DEFAULT_THUMBNAIL_WINDOW,
            thread_window: DEFAULT_THREAD_WINDOW,
        }
    }
}

/// Thumbnail fetch to issue for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub item_id: String,
    /// Key under which the resulting path is published.
    pub event_id: String,
    pub attachment: Attachment,
}

/// Secondary work made necessary by one diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionPlan {
    /// Visible items added or replaced by an incremental op.
    pub arrivals: Vec<TimelineItem>,
    /// `false` when the op replaced the log wholesale.
    pub incremental: bool,
    /// Event IDs whose reaction chips should be refetched.
    pub reaction_refresh: Vec<String>,
    pub thumbnail_requests: Vec<ThumbnailRequest>,
    /// Thread root event IDs whose summaries should be refetched.
    pub thread_refresh: Vec<String>,
    /// The last outgoing item changed; its peer read status is unknown.
    pub read_check_needed: bool,
}

impl ProjectionPlan {
    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
            && self.reaction_refresh.is_empty()
            && self.thumbnail_requests.is_empty()
            && self.thread_refresh.is_empty()
            && !self.read_check_needed
    }
}

/// Decides which projections to recompute after each diff.
#[derive(Debug, Clone)]
pub struct ProjectionEngine {
    config: ProjectionConfig,
    my_user_id: Option<String>,
    /// Thumbnail fetches issued but not yet settled.
    pending_thumbnails: HashSet<String>,
    settled_thumbnails: HashSet<String>,
    last_outgoing: Option<(String, Option<String>)>,
}

impl ProjectionEngine {
    pub fn new(config: ProjectionConfig, my_user_id: Option<String>) -> Self {
        Self {
            config,
            my_user_id,
            pending_thumbnails: HashSet::new(),
            settled_thumbnails: HashSet::new(),
            last_outgoing: None,
        }
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    pub fn my_user_id(&self) -> Option<&str> {
        self.my_user_id.as_deref()
    }

    /// Update the local user ID once the collaborator resolves it.
    pub fn set_my_user_id(&mut self, my_user_id: Option<String>) {
        self.my_user_id = my_user_id;
        self.last_outgoing = None;
    }

    /// Record that the fetch for `item_id` finished, successfully or not.
    /// It will not be requested again.
    pub fn settle_thumbnail(&mut self, item_id: &str) {
        if self.pending_thumbnails.remove(item_id) {
            self.settled_thumbnails.insert(item_id.to_owned());
        }
    }

    /// Drop fetches whose results can no longer arrive, so the next plan
    /// that sees those items requests them again.
    pub fn forget_pending_thumbnails(&mut self) -> usize {
        let forgotten = self.pending_thumbnails.len();
        self.pending_thumbnails.clear();
        forgotten
    }

    /// Forget settled fetches for items that left the log, so they are
    /// fetched again if they come back.
    pub fn retain_thumbnails(&mut self, keep_items: &HashSet<&str>) {
        self.settled_thumbnails
            .retain(|item_id| keep_items.contains(item_id.as_str()));
    }

    /// Build the plan for `op`, which has just been applied to `current`.
    pub fn plan(&mut self, current: &EventLog, op: &DiffOp) -> ProjectionPlan {
        let visible = current.visible();
        let mut plan = ProjectionPlan {
            incremental: !op.is_wholesale(),
            ..ProjectionPlan::default()
        };

        let mut thread_roots: Vec<String> = Vec::new();
        let candidates: Vec<&TimelineItem> = if plan.incremental {
            let touched = touched_items(op);
            let visible_by_id: HashMap<&str, &TimelineItem> = visible
                .iter()
                .map(|item| (item.item_id.as_str(), item))
                .collect();
            for item in &touched {
                if let Some(root) = item.thread_root_id.as_deref() {
                    thread_roots.push(root.to_owned());
                }
            }
            let arrivals: Vec<&TimelineItem> = touched
                .iter()
                .filter_map(|item| visible_by_id.get(item.item_id.as_str()).copied())
                .collect();
            plan.arrivals = arrivals.iter().map(|item| (*item).clone()).collect();
            arrivals
        } else {
            visible.iter().collect()
        };

        plan.reaction_refresh = trailing_event_ids(&candidates, self.config.reaction_window);

        let thumb_start = candidates.len().saturating_sub(self.config.thumbnail_window);
        for item in &candidates[thumb_start..] {
            let (Some(attachment), Some(event_id)) = (item.attachment.as_ref(), item.event_id())
            else {
                continue;
            };
            if !attachment.wants_thumbnail() {
                continue;
            }
            if !self.settled_thumbnails.contains(&item.item_id)
                && self.pending_thumbnails.insert(item.item_id.clone())
            {
                plan.thumbnail_requests.push(ThumbnailRequest {
                    item_id: item.item_id.clone(),
                    event_id: event_id.to_owned(),
                    attachment: attachment.clone(),
                });
            }
        }

        thread_roots.extend(trailing_event_ids(&candidates, self.config.thread_window));
        plan.thread_refresh = bounded_distinct_tail(thread_roots, self.config.thread_window);

        let outgoing = last_outgoing(visible, self.my_user_id.as_deref())
            .map(|item| (item.item_id.clone(), item.event_id().map(ToOwned::to_owned)));
        if outgoing != self.last_outgoing {
            plan.read_check_needed = outgoing.is_some();
            self.last_outgoing = outgoing;
        }

        trace!(
            op = op.kind(),
            arrivals = plan.arrivals.len(),
            reactions = plan.reaction_refresh.len(),
            thumbnails = plan.thumbnail_requests.len(),
            threads = plan.thread_refresh.len(),
            read_check = plan.read_check_needed,
            "projection plan built"
        );
        plan
    }
}

fn touched_items(op: &DiffOp) -> Vec<&TimelineItem> {
    match op {
        DiffOp::Reset(items) | DiffOp::Append(items) => items.iter().collect(),
        DiffOp::PushBack(item)
        | DiffOp::PushFront(item)
        | DiffOp::InsertAt { item, .. }
        | DiffOp::UpdateAt { item, .. } => vec![item],
        DiffOp::RemoveAt { .. }
        | DiffOp::Truncate { .. }
        | DiffOp::PopFront
        | DiffOp::PopBack
        | DiffOp::Clear => Vec::new(),
    }
}

fn trailing_event_ids(items: &[&TimelineItem], window: usize) -> Vec<String> {
    let mut ids: Vec<String> = items
        .iter()
        .rev()
        .filter_map(|item| item.event_id().map(ToOwned::to_owned))
        .take(window)
        .collect();
    ids.reverse();
    ids
}

fn bounded_distinct_tail(ids: Vec<String>, window: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = ids
        .into_iter()
        .rev()
        .filter(|id| seen.insert(id.clone()))
        .take(window)
        .collect();
    out.reverse();
    out
}

/// Newest timestamp among items not sent by `me`.
pub fn last_incoming_ts(visible: &[TimelineItem], me: Option<&str>) -> Option<u64> {
    let me = me?;
    visible
        .iter()
        .filter(|item| item.sender != me)
        .map(|item| item.timestamp_ms)
        .max()
}

/// Last visible item sent by `me`.
pub fn last_outgoing<'a>(visible: &'a [TimelineItem], me: Option<&str>) -> Option<&'a TimelineItem> {
    let me = me?;
    visible.iter().rev().find(|item| item.sender == me)
}

/// Reaction chips by event ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionTally {
    by_event: HashMap<String, Vec<ReactionChip>>,
}

impl ReactionTally {
    pub fn get(&self, event_id: &str) -> Option<&[ReactionChip]> {
        self.by_event.get(event_id).map(Vec::as_slice)
    }

    pub fn as_map(&self) -> &HashMap<String, Vec<ReactionChip>> {
        &self.by_event
    }

    /// Replace the chips of one event. An empty list removes the entry.
    ///
    /// Returns `true` when the tally changed.
    pub fn replace(&mut self, event_id: &str, chips: Vec<ReactionChip>) -> bool {
        if chips.is_empty() {
            return self.by_event.remove(event_id).is_some();
        }
        if self.by_event.get(event_id) == Some(&chips) {
            return false;
        }
        self.by_event.insert(event_id.to_owned(), chips);
        true
    }

    /// Flip the local user's reaction `key` on an event.
    ///
    /// Returns the chips as they were before, for rollback.
    pub fn apply_optimistic_toggle(&mut self, event_id: &str, key: &str) -> Vec<ReactionChip> {
        let previous = self.by_event.get(event_id).cloned().unwrap_or_default();
        let mut chips = previous.clone();
        match chips.iter().position(|chip| chip.key == key) {
            Some(idx) if chips[idx].mine => {
                chips[idx].count = chips[idx].count.saturating_sub(1);
                chips[idx].mine = false;
                if chips[idx].count == 0 {
                    chips.remove(idx);
                }
            }
            Some(idx) => {
                chips[idx].count += 1;
                chips[idx].mine = true;
            }
            None => chips.push(ReactionChip {
                key: key.to_owned(),
                count: 1,
                mine: true,
            }),
        }
        self.replace(event_id, chips);
        previous
    }

    /// Drop tallies for events no longer in view.
    pub fn retain_events(&mut self, keep: &HashSet<&str>) {
        self.by_event.retain(|event_id, _| keep.contains(event_id.as_str()));
    }
}

/// Thread reply counts by root event ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadCounts {
    by_root: HashMap<String, u64>,
}

impl ThreadCounts {
    pub fn get(&self, root_event_id: &str) -> Option<u64> {
        self.by_root.get(root_event_id).copied()
    }

    /// Drop counts for roots no longer in view.
    pub fn retain_roots(&mut self, keep: &HashSet<&str>) {
        self.by_root.retain(|root, _| keep.contains(root.as_str()));
    }

    pub fn as_map(&self) -> &HashMap<String, u64> {
        &self.by_root
    }

    /// Record a refreshed summary; a zero count removes the root.
    pub fn apply(&mut self, summary: &ThreadSummary) -> bool {
        if summary.count == 0 {
            return self.by_root.remove(&summary.root_event_id).is_some();
        }
        self.by_root.insert(summary.root_event_id.clone(), summary.count) != Some(summary.count)
    }
}

/// Read state that only moves forward within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadTracker {
    state: ReadState,
    outgoing_event: Option<String>,
    confirmed_event: Option<String>,
}

impl ReadTracker {
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Event ID whose peer read status is currently tracked.
    pub fn outgoing_event(&self) -> Option<&str> {
        self.outgoing_event.as_deref()
    }

    /// Move the local read marker forward. Older timestamps are ignored.
    pub fn advance_last_read(&mut self, ts: u64) -> bool {
        match self.state.last_read_ts {
            Some(current) if current >= ts => false,
            _ => {
                self.state.last_read_ts = Some(ts);
                true
            }
        }
    }

    /// Track a new last outgoing event.
    pub fn set_last_outgoing(&mut self, event_id: Option<String>) -> bool {
        if self.outgoing_event == event_id {
            return false;
        }
        let read = event_id.is_some() && self.confirmed_event == event_id;
        self.outgoing_event = event_id;
        let changed = self.state.last_outgoing_read_by_peer != read;
        self.state.last_outgoing_read_by_peer = read;
        changed
    }

    /// Apply a resolved peer read check for `event_id`.
    ///
    /// Results for an event that is no longer the last outgoing one are
    /// dropped, and a confirmed read is never retracted.
    pub fn observe_peer_read(&mut self, event_id: &str, read: bool) -> bool {
        if self.outgoing_event.as_deref() != Some(event_id) {
            return false;
        }
        if read {
            self.confirmed_event = Some(event_id.to_owned());
            let changed = !self.state.last_outgoing_read_by_peer;
            self.state.last_outgoing_read_by_peer = true;
            return changed;
        }
        false
    }
}
