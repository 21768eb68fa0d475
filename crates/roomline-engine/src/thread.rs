use std::sync::Arc;

use roomline_core::{RoomlineError, TimelineItem, merge_chronological};
use tracing::debug;

use crate::port::MatrixPort;

/// Paged, chronological view of one thread's replies.
pub struct ThreadView {
    port: Arc<dyn MatrixPort>,
    room_id: String,
    root_event_id: String,
    page_limit: u16,
    messages: Vec<TimelineItem>,
    next_batch: Option<String>,
}

impl ThreadView {
    pub fn new(
        port: Arc<dyn MatrixPort>,
        room_id: impl Into<String>,
        root_event_id: impl Into<String>,
        page_limit: u16,
    ) -> Self {
        Self {
            port,
            room_id: room_id.into(),
            root_event_id: root_event_id.into(),
            page_limit: page_limit.max(1),
            messages: Vec::new(),
            next_batch: None,
        }
    }

    pub fn root_event_id(&self) -> &str {
        &self.root_event_id
    }

    pub fn messages(&self) -> &[TimelineItem] {
        &self.messages
    }

    pub fn has_more(&self) -> bool {
        self.next_batch.is_some()
    }

    /// Replace the view with the newest page.
    pub async fn refresh(&mut self) -> Result<&[TimelineItem], RoomlineError> {
        let page = self
            .port
            .thread_replies(&self.room_id, &self.root_event_id, None, self.page_limit)
            .await?;
        self.messages = merge_chronological(&[], &page.messages);
        self.next_batch = page.next_batch;
        debug!(
            room_id = %self.room_id,
            root = %self.root_event_id,
            replies = self.messages.len(),
            "thread refreshed"
        );
        Ok(&self.messages)
    }

    /// Merge the next older page. Returns `false` when there is none.
    pub async fn load_more(&mut self) -> Result<bool, RoomlineError> {
        let Some(from) = self.next_batch.clone() else {
            return Ok(false);
        };
        let page = self
            .port
            .thread_replies(&self.room_id, &self.root_event_id, Some(&from), self.page_limit)
            .await?;
        self.messages = merge_chronological(&self.messages, &page.messages);
        self.next_batch = page.next_batch;
        Ok(true)
    }

    /// Toggle a reaction on a reply.
    pub async fn react(&self, event_id: &str, key: &str) -> Result<(), RoomlineError> {
        self.port.react(&self.room_id, event_id, key).await
    }
}

#[cfg(test)]
mod tests {
    use roomline_core::ErrorCategory;

    use super::*;
    use crate::memory::{InMemoryPort, RoomFixture};

    const ROOM: &str = "!room:example.org";

    fn reply(i: u64) -> TimelineItem {
        let mut item = TimelineItem::text(format!("r{i}"), Some(format!("$r{i}")), "@peer:x", "re", i);
        item.thread_root_id = Some("$root".into());
        item
    }

    fn view(port: &InMemoryPort, limit: u16) -> ThreadView {
        ThreadView::new(Arc::new(port.clone()), ROOM, "$root", limit)
    }

    #[tokio::test]
    async fn pages_merge_chronologically() {
        let port = InMemoryPort::new(None);
        port.add_room(ROOM, RoomFixture::default());
        port.set_thread_replies(ROOM, "$root", (0..5).map(reply).collect());
        let mut thread = view(&port, 2);

        let first = thread.refresh().await.expect("refresh should work");
        assert_eq!(first.len(), 2);
        assert!(thread.has_more());

        assert!(thread.load_more().await.expect("second page"));
        assert!(thread.load_more().await.expect("third page"));
        assert!(!thread.has_more());
        assert!(!thread.load_more().await.expect("no more pages"));

        let ids: Vec<_> = thread.messages().iter().map(|m| m.item_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r3", "r4"]);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_messages() {
        let port = InMemoryPort::new(None);
        port.add_room(ROOM, RoomFixture::default());
        port.set_thread_replies(ROOM, "$root", (0..3).map(reply).collect());
        let mut thread = view(&port, 60);
        thread.refresh().await.expect("refresh should work");

        port.fail(
            "thread_replies",
            RoomlineError::new(ErrorCategory::Network, "offline", "no network"),
        );
        thread.refresh().await.expect_err("refresh should fail");
        assert_eq!(thread.messages().len(), 3);
    }
}
