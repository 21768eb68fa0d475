use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of media carried by a timeline item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    /// Still image (`m.image`).
    Image,
    /// Video clip (`m.video`).
    Video,
    /// Any other file (`m.file`, `m.audio`, ...).
    File,
}

/// Media reference attached to a timeline item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// Media kind.
    pub kind: AttachmentKind,
    /// `mxc://` URI of the full media.
    pub mxc_uri: String,
    /// MIME type when known.
    pub mime: Option<String>,
    /// Server-provided thumbnail URI, when present.
    pub thumbnail_mxc_uri: Option<String>,
    /// Size of the full media in bytes when known.
    pub size_bytes: Option<u64>,
}

impl Attachment {
    /// Whether a thumbnail should be fetched for this attachment.
    pub fn wants_thumbnail(&self) -> bool {
        matches!(self.kind, AttachmentKind::Image | AttachmentKind::Video)
            || self.thumbnail_mxc_uri.is_some()
    }

    /// Source URI used for thumbnail requests.
    pub fn thumbnail_source(&self) -> &str {
        self.thumbnail_mxc_uri.as_deref().unwrap_or(&self.mxc_uri)
    }
}

/// Quoted preview of the item being replied to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyPreview {
    /// Event ID of the replied-to item.
    pub event_id: String,
    /// Sender of the replied-to item, when resolved.
    pub sender: Option<String>,
    /// Body excerpt of the replied-to item, when resolved.
    pub body: Option<String>,
}

/// Delivery state of a locally initiated send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SendState {
    /// Accepted by the local send queue.
    Enqueued,
    /// Request in flight.
    Sending,
    /// Previous attempt failed; another is scheduled.
    Retrying,
    /// Homeserver acknowledged the event.
    Sent,
    /// Gave up; user action required.
    Failed,
}

/// One message-shaped unit of a conversation timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineItem {
    /// Stable local identity; survives edits and local-echo replacement.
    pub item_id: String,
    /// Server event ID. `None` while a local send is pending.
    pub event_id: Option<String>,
    /// Local transaction ID for items that originated on this device.
    #[serde(default)]
    pub txn_id: Option<String>,
    /// Origin server timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// Sender user ID.
    pub sender: String,
    /// Display-ready text body.
    pub body: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    /// Root event ID when this item is a thread reply.
    #[serde(default)]
    pub thread_root_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default)]
    pub send_state: Option<SendState>,
    #[serde(default)]
    pub is_edited: bool,
}

impl TimelineItem {
    /// Minimal text item; the remaining fields start empty.
    pub fn text(
        item_id: impl Into<String>,
        event_id: Option<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            event_id,
            txn_id: None,
            timestamp_ms,
            sender: sender.into(),
            body: body.into(),
            attachment: None,
            thread_root_id: None,
            reply_to: None,
            send_state: None,
            is_edited: false,
        }
    }

    /// Server event ID when present and non-blank.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// Whether the item belongs to a thread rather than the main timeline.
    pub fn is_thread_reply(&self) -> bool {
        self.thread_root_id.is_some()
    }
}

/// Incremental timeline operation pushed by the sync engine.
///
/// Indices are positions in the authoritative (unfiltered) sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiffOp {
    /// Replace the whole sequence.
    Reset(Vec<TimelineItem>),
    /// Extend the tail.
    Append(Vec<TimelineItem>),
    /// Add one item at the tail.
    PushBack(TimelineItem),
    /// Add one item at the head.
    PushFront(TimelineItem),
    /// Insert at a position; the index is clamped.
    InsertAt { index: usize, item: TimelineItem },
    /// Replace the item at a position.
    UpdateAt { index: usize, item: TimelineItem },
    /// Remove the item at a position.
    RemoveAt { index: usize },
    /// Keep only the first `length` items.
    Truncate { length: usize },
    /// Drop the first item.
    PopFront,
    /// Drop the last item.
    PopBack,
    /// Drop every item.
    Clear,
}

impl DiffOp {
    /// Stable short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reset(_) => "reset",
            Self::Append(_) => "append",
            Self::PushBack(_) => "push_back",
            Self::PushFront(_) => "push_front",
            Self::InsertAt { .. } => "insert_at",
            Self::UpdateAt { .. } => "update_at",
            Self::RemoveAt { .. } => "remove_at",
            Self::Truncate { .. } => "truncate",
            Self::PopFront => "pop_front",
            Self::PopBack => "pop_back",
            Self::Clear => "clear",
        }
    }

    /// Whether the op replaces the sequence rather than editing it.
    pub fn is_wholesale(&self) -> bool {
        matches!(self, Self::Reset(_) | Self::Clear)
    }
}

/// Send-queue progress reported by the sending collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendUpdate {
    /// Conversation the send belongs to.
    pub room_id: String,
    /// Client-generated transaction ID.
    pub txn_id: String,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// New delivery state.
    pub state: SendState,
    /// Event ID once the homeserver acknowledged the send.
    pub event_id: Option<String>,
    /// Failure detail for `Retrying`/`Failed`.
    pub error: Option<String>,
}

/// One aggregated reaction on an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionChip {
    /// Reaction key, usually an emoji.
    pub key: String,
    /// Number of senders that reacted with `key`.
    pub count: u32,
    /// Whether the local user is among them.
    pub mine: bool,
}

/// Reply count for a thread root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadSummary {
    pub root_event_id: String,
    pub count: u64,
    pub latest_ts_ms: Option<u64>,
}

/// One page of thread replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ThreadPage {
    /// Replies in chronological order.
    pub messages: Vec<TimelineItem>,
    /// Token for the next (older) page, when more history exists.
    pub next_batch: Option<String>,
}

/// Read-marker state for a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReadState {
    /// Timestamp of the local user's read marker.
    pub last_read_ts: Option<u64>,
    /// Whether the DM peer has read the last outgoing item.
    pub last_outgoing_read_by_peer: bool,
}

/// Back-pagination status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PaginationStatus {
    pub is_paginating_back: bool,
    pub hit_start: bool,
}

/// Outbox row for a locally initiated send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub txn_id: String,
    pub room_id: String,
    pub attempts: u32,
    pub state: SendState,
    pub error: Option<String>,
    pub event_id: Option<String>,
}

impl From<SendUpdate> for OutboxEntry {
    fn from(update: SendUpdate) -> Self {
        Self {
            txn_id: update.txn_id,
            room_id: update.room_id,
            attempts: update.attempts,
            state: update.state,
            error: update.error,
            event_id: update.event_id,
        }
    }
}

/// Immutable per-conversation state published to consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub room_name: String,
    pub my_user_id: Option<String>,
    /// Main-timeline items in display order.
    pub visible: Vec<TimelineItem>,
    /// Outbox entries that are not yet `Sent`, in first-seen order.
    pub outbox: Vec<OutboxEntry>,
    /// Reaction chips by event ID.
    pub reactions: HashMap<String, Vec<ReactionChip>>,
    /// Thread reply counts by root event ID.
    pub thread_counts: HashMap<String, u64>,
    /// Cached thumbnail paths by event ID.
    pub thumbnails: HashMap<String, PathBuf>,
    pub read: ReadState,
    /// Whether the conversation has a single DM peer.
    pub is_dm: bool,
    /// Newest timestamp among items not sent by the local user.
    pub last_incoming_ts: Option<u64>,
    pub typing: Vec<String>,
    pub pagination: PaginationStatus,
}

/// Presentation-layer commands accepted by a room controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomCommand {
    /// Send a text message, optionally as a reply.
    Send {
        text: String,
        reply_to: Option<String>,
    },
    /// Replace the body of an existing message.
    Edit { event_id: String, text: String },
    /// Redact an existing message.
    Delete { event_id: String },
    /// Toggle a reaction on an event.
    React { event_id: String, emoji: String },
    /// Retry a failed local send.
    Retry { txn_id: String },
    /// Load older history.
    PaginateBack,
    /// Move the read marker to an event.
    MarkReadAt { event_id: String },
    /// Composer text changed; drives the typing notice.
    SetComposerText { text: String },
    /// Tear down and re-acquire all subscriptions.
    Resync,
}

/// Stable command discriminant used in notices and logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RoomCommandKind {
    Send,
    Edit,
    Delete,
    React,
    Retry,
    PaginateBack,
    MarkReadAt,
    SetComposerText,
    Resync,
}

impl RoomCommand {
    pub fn kind(&self) -> RoomCommandKind {
        match self {
            Self::Send { .. } => RoomCommandKind::Send,
            Self::Edit { .. } => RoomCommandKind::Edit,
            Self::Delete { .. } => RoomCommandKind::Delete,
            Self::React { .. } => RoomCommandKind::React,
            Self::Retry { .. } => RoomCommandKind::Retry,
            Self::PaginateBack => RoomCommandKind::PaginateBack,
            Self::MarkReadAt { .. } => RoomCommandKind::MarkReadAt,
            Self::SetComposerText { .. } => RoomCommandKind::SetComposerText,
            Self::Resync => RoomCommandKind::Resync,
        }
    }
}

/// One-time side-channel notices emitted by a room controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomNotice {
    /// A command failed; shown to the user once.
    CommandFailed {
        command: RoomCommandKind,
        code: String,
        message: String,
    },
    /// A new incoming message should raise a notification.
    Incoming {
        room_id: String,
        event_id: Option<String>,
        title: String,
        body: String,
    },
}

/// Lifecycle of one conversation's subscription set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Nothing acquired.
    Closed,
    /// Acquisition in progress.
    Opening,
    /// All subscriptions live.
    Active,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_ops_read_from_externally_tagged_json() {
        let ops: Vec<DiffOp> = serde_json::from_str(
            r#"[
                {"PushBack": {"item_id": "a", "event_id": "$a", "timestamp_ms": 1,
                              "sender": "@x:y", "body": "hi"}},
                {"RemoveAt": {"index": 3}},
                "PopBack"
            ]"#,
        )
        .expect("script ops should parse");

        assert_eq!(ops.len(), 3);
        match &ops[0] {
            DiffOp::PushBack(item) => {
                assert_eq!(item.event_id(), Some("$a"));
                assert!(item.attachment.is_none());
                assert!(!item.is_edited);
            }
            other => panic!("unexpected op: {other:?}"),
        }
        assert_eq!(ops[1], DiffOp::RemoveAt { index: 3 });
        assert_eq!(ops[2].kind(), "pop_back");
    }

    #[test]
    fn blank_event_ids_are_treated_as_absent() {
        let item = TimelineItem::text("a", Some("  ".into()), "@x:y", "hi", 1);
        assert_eq!(item.event_id(), None);
    }

    #[test]
    fn thumbnail_source_prefers_server_thumbnail() {
        let mut attachment = Attachment {
            kind: AttachmentKind::File,
            mxc_uri: "mxc://x/full".into(),
            mime: None,
            thumbnail_mxc_uri: None,
            size_bytes: None,
        };
        assert!(!attachment.wants_thumbnail());
        assert_eq!(attachment.thumbnail_source(), "mxc://x/full");

        attachment.thumbnail_mxc_uri = Some("mxc://x/thumb".into());
        assert!(attachment.wants_thumbnail());
        assert_eq!(attachment.thumbnail_source(), "mxc://x/thumb");
    }
}
