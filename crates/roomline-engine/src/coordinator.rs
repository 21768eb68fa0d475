use roomline_core::{
    DiffOp, RoomlineError, SendUpdate, SubscriptionState, SubscriptionStateMachine,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::port::{MatrixPort, SubscriptionHandle};

/// One of the streams a conversation holds open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Timeline,
    Typing,
    Receipts,
    OwnReceipt,
    Sends,
}

/// Receivers handed to the room worker after a successful open.
#[derive(Debug)]
pub struct RoomStreams {
    pub diffs: mpsc::Receiver<DiffOp>,
    pub typing: mpsc::Receiver<Vec<String>>,
    pub receipts: mpsc::Receiver<()>,
    pub own_receipt: mpsc::Receiver<()>,
    pub sends: mpsc::Receiver<SendUpdate>,
}

/// Acquires and releases one conversation's subscription set.
///
/// Subscriptions are acquired in a fixed order and cancelled in reverse.
/// A failure part-way through releases whatever was already acquired.
#[derive(Debug)]
pub struct SubscriptionCoordinator {
    room_id: String,
    machine: SubscriptionStateMachine,
    handles: Vec<(SubscriptionKind, SubscriptionHandle)>,
}

impl SubscriptionCoordinator {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            machine: SubscriptionStateMachine::default(),
            handles: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.machine.state()
    }

    pub fn generation(&self) -> u64 {
        self.machine.generation()
    }

    /// Kinds currently held, in acquisition order.
    pub fn acquired(&self) -> Vec<SubscriptionKind> {
        self.handles.iter().map(|(kind, _)| *kind).collect()
    }

    /// Open every subscription, closing any previous set first.
    pub async fn open(&mut self, port: &dyn MatrixPort) -> Result<RoomStreams, RoomlineError> {
        if self.machine.state() != SubscriptionState::Closed {
            self.close();
        }
        let generation = self.machine.begin_open()?;
        debug!(room_id = %self.room_id, generation, "opening subscriptions");

        match self.acquire(port).await {
            Ok(streams) => {
                self.machine.mark_active()?;
                debug!(room_id = %self.room_id, generation, "subscriptions active");
                Ok(streams)
            }
            Err(err) => {
                warn!(
                    room_id = %self.room_id,
                    generation,
                    acquired = self.handles.len(),
                    error = %err,
                    "subscription open failed; releasing partial set"
                );
                self.release();
                self.machine.abort_open()?;
                Err(err)
            }
        }
    }

    /// Cancel every held subscription. Returns the kinds in cancellation order;
    /// empty when already closed.
    pub fn close(&mut self) -> Vec<SubscriptionKind> {
        if !self.machine.close() {
            return Vec::new();
        }
        debug!(room_id = %self.room_id, generation = self.machine.generation(), "closing subscriptions");
        self.release()
    }

    async fn acquire(&mut self, port: &dyn MatrixPort) -> Result<RoomStreams, RoomlineError> {
        let room_id = self.room_id.clone();

        let (diffs, handle) = port.subscribe_timeline(&room_id).await?.into_parts();
        self.handles.push((SubscriptionKind::Timeline, handle));

        let (typing, handle) = port.observe_typing(&room_id).await?.into_parts();
        self.handles.push((SubscriptionKind::Typing, handle));

        let (receipts, handle) = port.observe_receipts(&room_id).await?.into_parts();
        self.handles.push((SubscriptionKind::Receipts, handle));

        let (own_receipt, handle) = port.observe_own_receipt(&room_id).await?.into_parts();
        self.handles.push((SubscriptionKind::OwnReceipt, handle));

        let (sends, handle) = port.observe_sends().await?.into_parts();
        self.handles.push((SubscriptionKind::Sends, handle));

        Ok(RoomStreams {
            diffs,
            typing,
            receipts,
            own_receipt,
            sends,
        })
    }

    fn release(&mut self) -> Vec<SubscriptionKind> {
        let mut released = Vec::with_capacity(self.handles.len());
        while let Some((kind, handle)) = self.handles.pop() {
            handle.cancel();
            released.push(kind);
        }
        released
    }
}

impl Drop for SubscriptionCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use roomline_core::{ErrorCategory, TimelineItem};

    use super::*;
    use crate::memory::{InMemoryPort, RoomFixture};

    const ROOM: &str = "!room:example.org";

    fn port() -> InMemoryPort {
        let port = InMemoryPort::new(Some("@me:example.org"));
        port.add_room(
            ROOM,
            RoomFixture::new(vec![TimelineItem::text(
                "a",
                Some("$a".into()),
                "@peer:example.org",
                "hi",
                1,
            )]),
        );
        port
    }

    #[tokio::test]
    async fn open_acquires_everything_in_order() {
        let port = port();
        let mut coordinator = SubscriptionCoordinator::new(ROOM);

        let mut streams = coordinator.open(&port).await.expect("open should work");
        assert_eq!(coordinator.state(), SubscriptionState::Active);
        assert_eq!(
            coordinator.acquired(),
            vec![
                SubscriptionKind::Timeline,
                SubscriptionKind::Typing,
                SubscriptionKind::Receipts,
                SubscriptionKind::OwnReceipt,
                SubscriptionKind::Sends,
            ]
        );
        assert!(matches!(streams.diffs.recv().await, Some(DiffOp::Reset(_))));
        assert_eq!(port.live_subscriptions(ROOM), 4);
        assert_eq!(port.live_send_subscriptions(), 1);
    }

    #[tokio::test]
    async fn close_cancels_in_reverse_order_and_is_idempotent() {
        let port = port();
        let mut coordinator = SubscriptionCoordinator::new(ROOM);
        let _streams = coordinator.open(&port).await.expect("open should work");

        assert_eq!(
            coordinator.close(),
            vec![
                SubscriptionKind::Sends,
                SubscriptionKind::OwnReceipt,
                SubscriptionKind::Receipts,
                SubscriptionKind::Typing,
                SubscriptionKind::Timeline,
            ]
        );
        assert_eq!(coordinator.state(), SubscriptionState::Closed);
        assert_eq!(port.live_subscriptions(ROOM), 0);
        assert_eq!(port.live_send_subscriptions(), 0);

        assert!(coordinator.close().is_empty());
    }

    #[tokio::test]
    async fn reopening_keeps_a_single_timeline_subscription() {
        let port = port();
        let mut coordinator = SubscriptionCoordinator::new(ROOM);

        let _first = coordinator.open(&port).await.expect("first open");
        let _second = coordinator.open(&port).await.expect("second open");

        assert_eq!(port.live_timeline_subscriptions(ROOM), 1);
        assert_eq!(coordinator.generation(), 2);
    }

    #[tokio::test]
    async fn partial_failure_releases_acquired_subscriptions() {
        let port = port();
        port.fail(
            "observe_receipts",
            RoomlineError::new(ErrorCategory::Network, "offline", "no network"),
        );
        let mut coordinator = SubscriptionCoordinator::new(ROOM);

        let err = coordinator
            .open(&port)
            .await
            .expect_err("open should fail");
        assert_eq!(err.code, "offline");
        assert_eq!(coordinator.state(), SubscriptionState::Closed);
        assert!(coordinator.acquired().is_empty());
        assert_eq!(port.live_subscriptions(ROOM), 0);

        port.clear_failure("observe_receipts");
        coordinator.open(&port).await.expect("retry should work");
        assert_eq!(coordinator.state(), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn dropping_coordinator_releases_subscriptions() {
        let port = port();
        let mut coordinator = SubscriptionCoordinator::new(ROOM);
        let _streams = coordinator.open(&port).await.expect("open should work");
        drop(coordinator);
        assert_eq!(port.live_subscriptions(ROOM), 0);
    }
}
