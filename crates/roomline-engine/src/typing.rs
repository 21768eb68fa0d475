use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::port::MatrixPort;

/// Turns composer edits into typing notices.
///
/// A burst of edits sends one `typing = true` when it starts and one
/// `typing = false` once the composer has been idle, or immediately when it
/// is cleared.
pub struct TypingDebouncer {
    port: Arc<dyn MatrixPort>,
    room_id: String,
    idle: Duration,
    idle_timer: Option<JoinHandle<()>>,
}

impl TypingDebouncer {
    pub fn new(port: Arc<dyn MatrixPort>, room_id: impl Into<String>, idle: Duration) -> Self {
        Self {
            port,
            room_id: room_id.into(),
            idle,
            idle_timer: None,
        }
    }

    /// Whether a burst is in progress.
    pub fn is_typing(&self) -> bool {
        self.idle_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub fn on_composer_text(&mut self, text: &str) {
        let was_typing = self.abort_timer();

        if text.trim().is_empty() {
            if was_typing {
                self.notify(false);
            }
            return;
        }

        if !was_typing {
            self.notify(true);
        }

        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        let idle = self.idle;
        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Err(err) = port.set_typing(&room_id, false).await {
                debug!(room_id = %room_id, error = %err, "failed to clear typing notice");
            }
        }));
    }

    /// Drop any pending idle timer without sending anything.
    pub fn stop(&mut self) {
        self.abort_timer();
    }

    fn abort_timer(&mut self) -> bool {
        match self.idle_timer.take() {
            Some(timer) => {
                let active = !timer.is_finished();
                timer.abort();
                active
            }
            None => false,
        }
    }

    fn notify(&self, typing: bool) {
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            if let Err(err) = port.set_typing(&room_id, typing).await {
                debug!(room_id = %room_id, typing, error = %err, "failed to send typing notice");
            }
        });
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.abort_timer();
    }
}

#[cfg(test)]
mod tests {
    use roomline_core::TimelineItem;

    use super::*;
    use crate::memory::{InMemoryPort, PortCall, RoomFixture};

    const ROOM: &str = "!room:example.org";

    fn typing_calls(port: &InMemoryPort) -> Vec<bool> {
        port.calls()
            .into_iter()
            .filter_map(|call| match call {
                PortCall::SetTyping { typing } => Some(typing),
                _ => None,
            })
            .collect()
    }

    fn setup() -> (InMemoryPort, TypingDebouncer) {
        let port = InMemoryPort::new(Some("@me:example.org"));
        port.add_room(
            ROOM,
            RoomFixture::new(vec![TimelineItem::text("a", None, "@me:example.org", "x", 1)]),
        );
        let debouncer = TypingDebouncer::new(Arc::new(port.clone()), ROOM, Duration::from_secs(4));
        (port, debouncer)
    }

    #[tokio::test(start_paused = true)]
    async fn a_burst_sends_start_once_and_stop_once() {
        let (port, mut debouncer) = setup();

        debouncer.on_composer_text("h");
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.on_composer_text("he");
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.on_composer_text("hel");
        assert!(debouncer.is_typing());

        tokio::time::sleep(Duration::from_millis(3_900)).await;
        assert_eq!(typing_calls(&port), vec![true]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(typing_calls(&port), vec![true, false]);
        assert!(!debouncer.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_composer_stops_immediately() {
        let (port, mut debouncer) = setup();

        debouncer.on_composer_text("hello");
        debouncer.on_composer_text("   ");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(typing_calls(&port), vec![true, false]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(typing_calls(&port), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_text_without_a_burst_sends_nothing() {
        let (port, mut debouncer) = setup();
        debouncer.on_composer_text("");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(typing_calls(&port).is_empty());
    }
}
