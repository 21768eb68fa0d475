//! Seam between the engine and the Matrix protocol/sync collaborator.

use std::path::PathBuf;

use async_trait::async_trait;
use roomline_core::{
    Attachment, DiffOp, ReactionChip, RoomlineError, SendUpdate, ThreadPage, ThreadSummary,
    TimelineItem,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cancels one live subscription. Dropping the handle cancels it too.
#[derive(Debug)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Item stream plus the handle that ends it.
#[derive(Debug)]
pub struct Subscription<T> {
    pub rx: mpsc::Receiver<T>,
    pub handle: SubscriptionHandle,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<T>, handle: SubscriptionHandle) -> Self {
        Self { rx, handle }
    }

    pub fn into_parts(self) -> (mpsc::Receiver<T>, SubscriptionHandle) {
        (self.rx, self.handle)
    }
}

/// Everything the engine needs from the protocol/sync layer.
///
/// Implementations own the network; the engine only sequences calls and
/// consumes the streams.
#[async_trait]
pub trait MatrixPort: Send + Sync {
    /// Local user ID, once logged in.
    async fn whoami(&self) -> Result<Option<String>, RoomlineError>;

    /// Live timeline diffs for a room, starting with a `Reset`.
    async fn subscribe_timeline(&self, room_id: &str)
    -> Result<Subscription<DiffOp>, RoomlineError>;

    /// Display names of users currently typing.
    async fn observe_typing(&self, room_id: &str)
    -> Result<Subscription<Vec<String>>, RoomlineError>;

    /// Fires whenever any read receipt in the room changes.
    async fn observe_receipts(&self, room_id: &str) -> Result<Subscription<()>, RoomlineError>;

    /// Fires whenever the local user's own receipt changes.
    async fn observe_own_receipt(&self, room_id: &str)
    -> Result<Subscription<()>, RoomlineError>;

    /// Send-queue progress for every room.
    async fn observe_sends(&self) -> Result<Subscription<SendUpdate>, RoomlineError>;

    /// Most recent `limit` items, oldest first.
    async fn load_recent(&self, room_id: &str, limit: u32)
    -> Result<Vec<TimelineItem>, RoomlineError>;

    /// Ask the timeline to load `count` older items. Returns `true` once the
    /// start of the room is reached.
    async fn paginate_back(&self, room_id: &str, count: u16) -> Result<bool, RoomlineError>;

    async fn reactions(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<ReactionChip>, RoomlineError>;

    async fn thread_summary(
        &self,
        room_id: &str,
        root_event_id: &str,
        per_page: u16,
        max_pages: u16,
    ) -> Result<ThreadSummary, RoomlineError>;

    async fn thread_replies(
        &self,
        room_id: &str,
        root_event_id: &str,
        from: Option<&str>,
        limit: u16,
    ) -> Result<ThreadPage, RoomlineError>;

    /// Timestamp of the local user's read marker.
    async fn own_last_read(&self, room_id: &str) -> Result<Option<u64>, RoomlineError>;

    /// The other member when the room is a direct message.
    async fn dm_peer_user_id(&self, room_id: &str) -> Result<Option<String>, RoomlineError>;

    async fn is_event_read_by(
        &self,
        room_id: &str,
        event_id: &str,
        user_id: &str,
    ) -> Result<bool, RoomlineError>;

    /// Download a thumbnail into the local cache and return its path.
    async fn thumbnail_to_cache(
        &self,
        attachment: &Attachment,
        width: u32,
        height: u32,
        crop: bool,
    ) -> Result<PathBuf, RoomlineError>;

    async fn send_text(
        &self,
        room_id: &str,
        body: &str,
        reply_to: Option<&str>,
        txn_id: &str,
    ) -> Result<(), RoomlineError>;

    async fn edit(&self, room_id: &str, event_id: &str, new_body: &str)
    -> Result<(), RoomlineError>;

    async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> Result<(), RoomlineError>;

    /// Toggle the local user's reaction `key` on an event.
    async fn react(&self, room_id: &str, event_id: &str, key: &str) -> Result<(), RoomlineError>;

    /// Re-queue a failed send. Returns `false` when the queue no longer knows
    /// the transaction.
    async fn retry_by_txn(&self, room_id: &str, txn_id: &str) -> Result<bool, RoomlineError>;

    async fn mark_read_at(&self, room_id: &str, event_id: &str) -> Result<(), RoomlineError>;

    async fn set_typing(&self, room_id: &str, typing: bool) -> Result<(), RoomlineError>;
}
