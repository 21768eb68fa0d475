//! In-process [`MatrixPort`] backed by fixtures, used by tests and the replay tool.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use roomline_core::{
    Attachment, DiffOp, ErrorCategory, ReactionChip, ReactionTally, RoomlineError, SendState,
    SendUpdate, ThreadPage, ThreadSummary, TimelineItem,
};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::port::{MatrixPort, Subscription, SubscriptionHandle};

const STREAM_BUFFER: usize = 256;
const LOCAL_ECHO_SENDER: &str = "@me:localhost";

/// Server-side view of one room.
#[derive(Debug, Clone, Default)]
pub struct RoomFixture {
    /// Full history, oldest first.
    pub history: Vec<TimelineItem>,
    /// Number of trailing history items the live timeline starts with.
    pub live_window: usize,
    pub reactions: ReactionTally,
    /// Thread replies by root event ID, oldest first.
    pub thread_replies: HashMap<String, Vec<TimelineItem>>,
    pub dm_peer: Option<String>,
    /// Events the DM peer has read.
    pub read_by_peer: HashSet<String>,
    pub own_last_read: Option<u64>,
    /// When set, back-pagination succeeds without loading anything.
    pub stall_pagination: bool,
}

impl RoomFixture {
    /// Room whose whole history is already in the live timeline.
    pub fn new(history: Vec<TimelineItem>) -> Self {
        Self {
            live_window: history.len(),
            history,
            ..Self::default()
        }
    }

    pub fn with_live_window(mut self, live_window: usize) -> Self {
        self.live_window = live_window.min(self.history.len());
        self
    }

    pub fn with_dm_peer(mut self, peer: impl Into<String>) -> Self {
        self.dm_peer = Some(peer.into());
        self
    }

    fn window_start(&self) -> usize {
        self.history.len().saturating_sub(self.live_window)
    }

    fn live_items(&self) -> Vec<TimelineItem> {
        self.history[self.window_start()..].to_vec()
    }

    fn live_index_of(&self, event_id: &str) -> Option<(usize, Option<usize>)> {
        let idx = self
            .history
            .iter()
            .position(|item| item.event_id() == Some(event_id))?;
        let start = self.window_start();
        Some((idx, idx.checked_sub(start)))
    }
}

/// Calls observed by an [`InMemoryPort`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCall {
    LoadRecent { limit: u32 },
    PaginateBack { count: u16 },
    Reactions { event_id: String },
    ThreadSummary { root_event_id: String },
    ThreadReplies { root_event_id: String, from: Option<String> },
    IsEventReadBy { event_id: String, user_id: String },
    Thumbnail { source: String, width: u32, height: u32, crop: bool },
    SendText { body: String, reply_to: Option<String>, txn_id: String },
    Edit { event_id: String, body: String },
    Redact { event_id: String },
    React { event_id: String, key: String },
    RetryByTxn { txn_id: String },
    MarkReadAt { event_id: String },
    SetTyping { typing: bool },
}

struct Subscriber<T> {
    room_id: Option<String>,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
}

#[derive(Default)]
struct PortState {
    my_user_id: Option<String>,
    rooms: HashMap<String, RoomFixture>,
    timelines: Vec<Subscriber<DiffOp>>,
    typing: Vec<Subscriber<Vec<String>>>,
    receipts: Vec<Subscriber<()>>,
    own_receipts: Vec<Subscriber<()>>,
    sends: Vec<Subscriber<SendUpdate>>,
    failed_txns: HashSet<String>,
    failures: HashMap<&'static str, RoomlineError>,
    calls: Vec<PortCall>,
    thumbnail_gate: Option<Arc<Notify>>,
}

impl PortState {
    fn check(&self, op: &'static str) -> Result<(), RoomlineError> {
        match self.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn room(&self, room_id: &str) -> Result<&RoomFixture, RoomlineError> {
        self.rooms.get(room_id).ok_or_else(|| unknown_room(room_id))
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut RoomFixture, RoomlineError> {
        self.rooms.get_mut(room_id).ok_or_else(|| unknown_room(room_id))
    }
}

/// Fixture-backed port with failure injection and call recording.
#[derive(Clone, Default)]
pub struct InMemoryPort {
    state: Arc<Mutex<PortState>>,
}

impl InMemoryPort {
    pub fn new(my_user_id: Option<&str>) -> Self {
        let port = Self::default();
        port.state().my_user_id = my_user_id.map(ToOwned::to_owned);
        port
    }

    pub fn add_room(&self, room_id: &str, fixture: RoomFixture) {
        self.state().rooms.insert(room_id.to_owned(), fixture);
    }

    /// Make every later call of `op` (a [`MatrixPort`] method name) fail.
    pub fn fail(&self, op: &'static str, error: RoomlineError) {
        self.state().failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.state().failures.remove(op);
    }

    /// Hold thumbnail downloads until the gate is notified.
    pub fn set_thumbnail_gate(&self, gate: Option<Arc<Notify>>) {
        self.state().thumbnail_gate = gate;
    }

    pub fn set_stall_pagination(&self, room_id: &str, stall: bool) {
        if let Some(room) = self.state().rooms.get_mut(room_id) {
            room.stall_pagination = stall;
        }
    }

    pub fn set_reactions(&self, room_id: &str, event_id: &str, chips: Vec<ReactionChip>) {
        if let Some(room) = self.state().rooms.get_mut(room_id) {
            room.reactions.replace(event_id, chips);
        }
    }

    pub fn set_thread_replies(&self, room_id: &str, root_event_id: &str, replies: Vec<TimelineItem>) {
        if let Some(room) = self.state().rooms.get_mut(room_id) {
            room.thread_replies.insert(root_event_id.to_owned(), replies);
        }
    }

    pub fn calls(&self) -> Vec<PortCall> {
        self.state().calls.clone()
    }

    /// Live timeline subscriptions for one room.
    pub fn live_timeline_subscriptions(&self, room_id: &str) -> usize {
        count_live(&self.state().timelines, Some(room_id))
    }

    /// Live per-room subscriptions of every kind for one room.
    pub fn live_subscriptions(&self, room_id: &str) -> usize {
        let state = self.state();
        count_live(&state.timelines, Some(room_id))
            + count_live(&state.typing, Some(room_id))
            + count_live(&state.receipts, Some(room_id))
            + count_live(&state.own_receipts, Some(room_id))
    }

    pub fn live_send_subscriptions(&self) -> usize {
        count_live(&self.state().sends, None)
    }

    /// Forward a raw diff to the room's live timeline subscribers.
    ///
    /// Fixture history is left untouched.
    pub async fn push_diff(&self, room_id: &str, op: DiffOp) {
        let targets = live_senders(&mut self.state().timelines, Some(room_id));
        fan_out(targets, op).await;
    }

    pub async fn emit_send_update(&self, update: SendUpdate) {
        let targets = {
            let mut state = self.state();
            if update.state == SendState::Failed {
                state.failed_txns.insert(update.txn_id.clone());
            } else {
                state.failed_txns.remove(&update.txn_id);
            }
            live_senders(&mut state.sends, None)
        };
        fan_out(targets, update).await;
    }

    pub async fn set_typing_users(&self, room_id: &str, names: Vec<String>) {
        let targets = live_senders(&mut self.state().typing, Some(room_id));
        fan_out(targets, names).await;
    }

    /// Record that the DM peer read `event_id` and signal a receipt change.
    pub async fn mark_read_by_peer(&self, room_id: &str, event_id: &str) {
        let targets = {
            let mut state = self.state();
            if let Some(room) = state.rooms.get_mut(room_id) {
                room.read_by_peer.insert(event_id.to_owned());
            }
            live_senders(&mut state.receipts, Some(room_id))
        };
        fan_out(targets, ()).await;
    }

    fn state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MatrixPort for InMemoryPort {
    async fn whoami(&self) -> Result<Option<String>, RoomlineError> {
        let state = self.state();
        state.check("whoami")?;
        Ok(state.my_user_id.clone())
    }

    async fn subscribe_timeline(
        &self,
        room_id: &str,
    ) -> Result<Subscription<DiffOp>, RoomlineError> {
        let mut state = self.state();
        state.check("subscribe_timeline")?;
        let initial = state.room(room_id)?.live_items();
        let (subscription, tx) = subscribe(&mut state.timelines, Some(room_id));
        let _ = tx.try_send(DiffOp::Reset(initial));
        debug!(room_id = %room_id, "timeline subscription opened");
        Ok(subscription)
    }

    async fn observe_typing(
        &self,
        room_id: &str,
    ) -> Result<Subscription<Vec<String>>, RoomlineError> {
        let mut state = self.state();
        state.check("observe_typing")?;
        state.room(room_id)?;
        Ok(subscribe(&mut state.typing, Some(room_id)).0)
    }

    async fn observe_receipts(&self, room_id: &str) -> Result<Subscription<()>, RoomlineError> {
        let mut state = self.state();
        state.check("observe_receipts")?;
        state.room(room_id)?;
        Ok(subscribe(&mut state.receipts, Some(room_id)).0)
    }

    async fn observe_own_receipt(&self, room_id: &str) -> Result<Subscription<()>, RoomlineError> {
        let mut state = self.state();
        state.check("observe_own_receipt")?;
        state.room(room_id)?;
        Ok(subscribe(&mut state.own_receipts, Some(room_id)).0)
    }

    async fn observe_sends(&self) -> Result<Subscription<SendUpdate>, RoomlineError> {
        let mut state = self.state();
        state.check("observe_sends")?;
        Ok(subscribe(&mut state.sends, None).0)
    }

    async fn load_recent(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<TimelineItem>, RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::LoadRecent { limit });
        state.check("load_recent")?;
        let history = &state.room(room_id)?.history;
        let start = history.len().saturating_sub(limit as usize);
        Ok(history[start..].to_vec())
    }

    async fn paginate_back(&self, room_id: &str, count: u16) -> Result<bool, RoomlineError> {
        let (ops, hit_start, targets) = {
            let mut state = self.state();
            state.calls.push(PortCall::PaginateBack { count });
            state.check("paginate_back")?;
            let room = state.room_mut(room_id)?;
            if room.stall_pagination {
                return Ok(false);
            }
            let start = room.window_start();
            let n = start.min(count as usize);
            let ops: Vec<DiffOp> = room.history[start - n..start]
                .iter()
                .rev()
                .cloned()
                .map(DiffOp::PushFront)
                .collect();
            room.live_window += n;
            let hit_start = room.live_window >= room.history.len();
            (ops, hit_start, live_senders(&mut state.timelines, Some(room_id)))
        };
        for op in ops {
            fan_out(targets.clone(), op).await;
        }
        Ok(hit_start)
    }

    async fn reactions(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<ReactionChip>, RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::Reactions {
            event_id: event_id.to_owned(),
        });
        state.check("reactions")?;
        Ok(state
            .room(room_id)?
            .reactions
            .get(event_id)
            .map(<[ReactionChip]>::to_vec)
            .unwrap_or_default())
    }

    async fn thread_summary(
        &self,
        room_id: &str,
        root_event_id: &str,
        _per_page: u16,
        _max_pages: u16,
    ) -> Result<ThreadSummary, RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::ThreadSummary {
            root_event_id: root_event_id.to_owned(),
        });
        state.check("thread_summary")?;
        let replies = state.room(room_id)?.thread_replies.get(root_event_id);
        Ok(ThreadSummary {
            root_event_id: root_event_id.to_owned(),
            count: replies.map_or(0, |replies| replies.len() as u64),
            latest_ts_ms: replies.and_then(|replies| replies.iter().map(|r| r.timestamp_ms).max()),
        })
    }

    async fn thread_replies(
        &self,
        room_id: &str,
        root_event_id: &str,
        from: Option<&str>,
        limit: u16,
    ) -> Result<ThreadPage, RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::ThreadReplies {
            root_event_id: root_event_id.to_owned(),
            from: from.map(ToOwned::to_owned),
        });
        state.check("thread_replies")?;
        let Some(replies) = state.room(room_id)?.thread_replies.get(root_event_id) else {
            return Ok(ThreadPage::default());
        };
        let end = from
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(replies.len())
            .min(replies.len());
        let start = end.saturating_sub(limit.max(1) as usize);
        Ok(ThreadPage {
            messages: replies[start..end].to_vec(),
            next_batch: (start > 0).then(|| start.to_string()),
        })
    }

    async fn own_last_read(&self, room_id: &str) -> Result<Option<u64>, RoomlineError> {
        let state = self.state();
        state.check("own_last_read")?;
        Ok(state.room(room_id)?.own_last_read)
    }

    async fn dm_peer_user_id(&self, room_id: &str) -> Result<Option<String>, RoomlineError> {
        let state = self.state();
        state.check("dm_peer_user_id")?;
        Ok(state.room(room_id)?.dm_peer.clone())
    }

    async fn is_event_read_by(
        &self,
        room_id: &str,
        event_id: &str,
        user_id: &str,
    ) -> Result<bool, RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::IsEventReadBy {
            event_id: event_id.to_owned(),
            user_id: user_id.to_owned(),
        });
        state.check("is_event_read_by")?;
        let room = state.room(room_id)?;
        Ok(room.dm_peer.as_deref() == Some(user_id) && room.read_by_peer.contains(event_id))
    }

    async fn thumbnail_to_cache(
        &self,
        attachment: &Attachment,
        width: u32,
        height: u32,
        crop: bool,
    ) -> Result<PathBuf, RoomlineError> {
        let source = attachment.thumbnail_source().to_owned();
        let gate = {
            let mut state = self.state();
            state.calls.push(PortCall::Thumbnail {
                source: source.clone(),
                width,
                height,
                crop,
            });
            state.check("thumbnail_to_cache")?;
            state.thumbnail_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let file_name: String = source
            .trim_start_matches("mxc://")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Ok(std::env::temp_dir()
            .join("roomline-thumbnails")
            .join(format!("{file_name}_{width}x{height}.png")))
    }

    async fn send_text(
        &self,
        room_id: &str,
        body: &str,
        reply_to: Option<&str>,
        txn_id: &str,
    ) -> Result<(), RoomlineError> {
        let (echo, timeline_targets, send_targets) = {
            let mut state = self.state();
            state.calls.push(PortCall::SendText {
                body: body.to_owned(),
                reply_to: reply_to.map(ToOwned::to_owned),
                txn_id: txn_id.to_owned(),
            });
            state.check("send_text")?;
            let sender = state
                .my_user_id
                .clone()
                .unwrap_or_else(|| LOCAL_ECHO_SENDER.to_owned());
            let room = state.room_mut(room_id)?;
            let timestamp_ms = room
                .history
                .iter()
                .map(|item| item.timestamp_ms)
                .max()
                .map_or(1, |ts| ts + 1);
            let mut echo = TimelineItem::text(
                txn_id,
                Some(format!("${txn_id}")),
                sender,
                body,
                timestamp_ms,
            );
            echo.txn_id = Some(txn_id.to_owned());
            echo.send_state = Some(SendState::Sent);
            room.history.push(echo.clone());
            room.live_window += 1;
            (
                echo,
                live_senders(&mut state.timelines, Some(room_id)),
                live_senders(&mut state.sends, None),
            )
        };

        let update = |state: SendState, event_id: Option<String>| SendUpdate {
            room_id: room_id.to_owned(),
            txn_id: txn_id.to_owned(),
            attempts: 1,
            state,
            event_id,
            error: None,
        };
        fan_out(send_targets.clone(), update(SendState::Sending, None)).await;
        fan_out(timeline_targets, DiffOp::PushBack(echo.clone())).await;
        fan_out(send_targets, update(SendState::Sent, echo.event_id)).await;
        Ok(())
    }

    async fn edit(
        &self,
        room_id: &str,
        event_id: &str,
        new_body: &str,
    ) -> Result<(), RoomlineError> {
        let (op, targets) = {
            let mut state = self.state();
            state.calls.push(PortCall::Edit {
                event_id: event_id.to_owned(),
                body: new_body.to_owned(),
            });
            state.check("edit")?;
            let room = state.room_mut(room_id)?;
            let (idx, live_idx) = room
                .live_index_of(event_id)
                .ok_or_else(|| unknown_event(event_id))?;
            let item = &mut room.history[idx];
            item.body = new_body.to_owned();
            item.is_edited = true;
            let op = live_idx.map(|index| DiffOp::UpdateAt {
                index,
                item: item.clone(),
            });
            (op, live_senders(&mut state.timelines, Some(room_id)))
        };
        if let Some(op) = op {
            fan_out(targets, op).await;
        }
        Ok(())
    }

    async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        _reason: Option<&str>,
    ) -> Result<(), RoomlineError> {
        let (op, targets) = {
            let mut state = self.state();
            state.calls.push(PortCall::Redact {
                event_id: event_id.to_owned(),
            });
            state.check("redact")?;
            let room = state.room_mut(room_id)?;
            let (idx, live_idx) = room
                .live_index_of(event_id)
                .ok_or_else(|| unknown_event(event_id))?;
            room.history.remove(idx);
            if live_idx.is_some() {
                room.live_window = room.live_window.saturating_sub(1);
            }
            let op = live_idx.map(|index| DiffOp::RemoveAt { index });
            (op, live_senders(&mut state.timelines, Some(room_id)))
        };
        if let Some(op) = op {
            fan_out(targets, op).await;
        }
        Ok(())
    }

    async fn react(&self, room_id: &str, event_id: &str, key: &str) -> Result<(), RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::React {
            event_id: event_id.to_owned(),
            key: key.to_owned(),
        });
        state.check("react")?;
        state
            .room_mut(room_id)?
            .reactions
            .apply_optimistic_toggle(event_id, key);
        Ok(())
    }

    async fn retry_by_txn(&self, room_id: &str, txn_id: &str) -> Result<bool, RoomlineError> {
        let targets = {
            let mut state = self.state();
            state.calls.push(PortCall::RetryByTxn {
                txn_id: txn_id.to_owned(),
            });
            state.check("retry_by_txn")?;
            if !state.failed_txns.remove(txn_id) {
                return Ok(false);
            }
            live_senders(&mut state.sends, None)
        };
        fan_out(
            targets,
            SendUpdate {
                room_id: room_id.to_owned(),
                txn_id: txn_id.to_owned(),
                attempts: 2,
                state: SendState::Retrying,
                event_id: None,
                error: None,
            },
        )
        .await;
        Ok(true)
    }

    async fn mark_read_at(&self, room_id: &str, event_id: &str) -> Result<(), RoomlineError> {
        let targets = {
            let mut state = self.state();
            state.calls.push(PortCall::MarkReadAt {
                event_id: event_id.to_owned(),
            });
            state.check("mark_read_at")?;
            let room = state.room_mut(room_id)?;
            let (idx, _) = room
                .live_index_of(event_id)
                .ok_or_else(|| unknown_event(event_id))?;
            let ts = room.history[idx].timestamp_ms;
            room.own_last_read = Some(room.own_last_read.map_or(ts, |current| current.max(ts)));
            live_senders(&mut state.own_receipts, Some(room_id))
        };
        fan_out(targets, ()).await;
        Ok(())
    }

    async fn set_typing(&self, _room_id: &str, typing: bool) -> Result<(), RoomlineError> {
        let mut state = self.state();
        state.calls.push(PortCall::SetTyping { typing });
        state.check("set_typing")
    }
}

fn subscribe<T>(
    subscribers: &mut Vec<Subscriber<T>>,
    room_id: Option<&str>,
) -> (Subscription<T>, mpsc::Sender<T>) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let token = CancellationToken::new();
    subscribers.push(Subscriber {
        room_id: room_id.map(ToOwned::to_owned),
        tx: tx.clone(),
        token: token.clone(),
    });
    (Subscription::new(rx, SubscriptionHandle::new(token)), tx)
}

fn live_senders<T>(subscribers: &mut Vec<Subscriber<T>>, room_id: Option<&str>) -> Vec<mpsc::Sender<T>> {
    subscribers.retain(|sub| !sub.token.is_cancelled() && !sub.tx.is_closed());
    subscribers
        .iter()
        .filter(|sub| room_id.is_none() || sub.room_id.as_deref() == room_id)
        .map(|sub| sub.tx.clone())
        .collect()
}

fn count_live<T>(subscribers: &[Subscriber<T>], room_id: Option<&str>) -> usize {
    subscribers
        .iter()
        .filter(|sub| !sub.token.is_cancelled())
        .filter(|sub| room_id.is_none() || sub.room_id.as_deref() == room_id)
        .count()
}

async fn fan_out<T: Clone>(targets: Vec<mpsc::Sender<T>>, value: T) {
    for tx in targets {
        let _ = tx.send(value.clone()).await;
    }
}

fn unknown_room(room_id: &str) -> RoomlineError {
    RoomlineError::new(
        ErrorCategory::NotFound,
        "unknown_room",
        format!("room {room_id} is not known"),
    )
}

fn unknown_event(event_id: &str) -> RoomlineError {
    RoomlineError::new(
        ErrorCategory::NotFound,
        "unknown_event",
        format!("event {event_id} is not known"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "!room:example.org";

    fn history(n: u64) -> Vec<TimelineItem> {
        (0..n)
            .map(|i| TimelineItem::text(format!("i{i}"), Some(format!("$i{i}")), "@peer:x", "hi", i))
            .collect()
    }

    #[tokio::test]
    async fn timeline_subscription_starts_with_live_window() {
        let port = InMemoryPort::new(Some("@me:x"));
        port.add_room(ROOM, RoomFixture::new(history(5)).with_live_window(2));

        let mut sub = port
            .subscribe_timeline(ROOM)
            .await
            .expect("subscription should open");
        match sub.rx.recv().await {
            Some(DiffOp::Reset(items)) => {
                let ids: Vec<_> = items.iter().map(|it| it.item_id.as_str()).collect();
                assert_eq!(ids, vec!["i3", "i4"]);
            }
            other => panic!("unexpected first op: {other:?}"),
        }
        assert_eq!(port.live_timeline_subscriptions(ROOM), 1);
        sub.handle.cancel();
        assert_eq!(port.live_timeline_subscriptions(ROOM), 0);
    }

    #[tokio::test]
    async fn paginate_back_pushes_older_items_to_the_front() {
        let port = InMemoryPort::new(None);
        port.add_room(ROOM, RoomFixture::new(history(5)).with_live_window(2));
        let mut sub = port.subscribe_timeline(ROOM).await.expect("subscribe");
        sub.rx.recv().await.expect("initial reset");

        let hit_start = port.paginate_back(ROOM, 2).await.expect("paginate");
        assert!(!hit_start);
        assert!(matches!(sub.rx.recv().await, Some(DiffOp::PushFront(item)) if item.item_id == "i2"));
        assert!(matches!(sub.rx.recv().await, Some(DiffOp::PushFront(item)) if item.item_id == "i1"));

        assert!(port.paginate_back(ROOM, 50).await.expect("paginate"));
    }

    #[tokio::test]
    async fn injected_failures_surface_until_cleared() {
        let port = InMemoryPort::new(None);
        port.add_room(ROOM, RoomFixture::default());
        port.fail(
            "reactions",
            RoomlineError::new(ErrorCategory::Network, "offline", "no network"),
        );

        let err = port
            .reactions(ROOM, "$a")
            .await
            .expect_err("reactions should fail");
        assert_eq!(err.code, "offline");

        port.clear_failure("reactions");
        assert!(port.reactions(ROOM, "$a").await.expect("reactions").is_empty());
    }

    #[tokio::test]
    async fn thread_replies_page_backwards() {
        let port = InMemoryPort::new(None);
        port.add_room(ROOM, RoomFixture::default());
        port.set_thread_replies(ROOM, "$root", history(5));

        let first = port
            .thread_replies(ROOM, "$root", None, 2)
            .await
            .expect("first page");
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.messages[0].item_id, "i3");
        assert_eq!(first.next_batch.as_deref(), Some("3"));

        let last = port
            .thread_replies(ROOM, "$root", Some("1"), 2)
            .await
            .expect("last page");
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.next_batch, None);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let port = InMemoryPort::new(None);
        let err = port
            .subscribe_timeline("!missing:x")
            .await
            .expect_err("unknown room must fail");
        assert_eq!(err.category, ErrorCategory::NotFound);
    }
}
