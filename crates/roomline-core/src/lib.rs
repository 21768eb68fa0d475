//! Timeline reconciliation core shared by the async engine and its consumers.
//!
//! This crate holds the pure side of a conversation: the event log and its
//! diff reducer, derived projections, the outbox, the subscription lifecycle
//! model, and the channel and error types that cross the engine boundary.

/// Command/snapshot/notice channel primitives.
pub mod channel;
/// Stable error taxonomy.
pub mod error;
/// Command outcome and notification helpers.
pub mod normalization;
/// Local send tracking.
pub mod outbox;
/// Derived views recomputed after each diff.
pub mod projection;
/// Backoff schedule for subscription re-acquisition.
pub mod retry;
/// Subscription lifecycle state machine.
pub mod state_machine;
/// Event log and diff reducer.
pub mod timeline;
/// Domain types shared across crates.
pub mod types;

pub use channel::{ChannelError, NoticeStream, RoomChannels, SnapshotStream};
pub use error::{ErrorCategory, RoomlineError};
pub use normalization::{
    CommandOutcome, NotificationContext, classify_command_error_message, incoming_notice,
    normalize_command_outcome, sender_localpart, should_notify,
};
pub use outbox::OutboxTracker;
pub use projection::{
    ProjectionConfig, ProjectionEngine, ProjectionPlan, ReactionTally, ReadTracker,
    ThreadCounts, ThumbnailRequest, last_incoming_ts, last_outgoing,
};
pub use retry::{ReconnectBackoff, RetryPolicy};
pub use state_machine::SubscriptionStateMachine;
pub use timeline::{
    DiffOutcome, EventLog, merge_chronological, reduce, reduce_all, visible_items,
};
pub use types::{
    Attachment, AttachmentKind, DiffOp, OutboxEntry, PaginationStatus, ReactionChip, ReadState,
    ReplyPreview, RoomCommand, RoomCommandKind, RoomNotice, RoomSnapshot, SendState, SendUpdate,
    SubscriptionState, ThreadPage, ThreadSummary, TimelineItem,
};
