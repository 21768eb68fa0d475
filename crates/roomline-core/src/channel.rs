use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

use crate::types::{RoomCommand, RoomNotice, RoomSnapshot};

/// Latest-value snapshot stream handed to presentation consumers.
pub type SnapshotStream = watch::Receiver<Arc<RoomSnapshot>>;
/// One-time notice stream handed to presentation consumers.
pub type NoticeStream = broadcast::Receiver<RoomNotice>;

/// Errors returned by room channel operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The worker side is gone.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The worker is not keeping up.
    #[error("command channel is full")]
    CommandChannelFull,
}

/// Command, snapshot and notice channels for one conversation.
#[derive(Clone, Debug)]
pub struct RoomChannels {
    command_tx: mpsc::Sender<RoomCommand>,
    snapshot_tx: Arc<watch::Sender<Arc<RoomSnapshot>>>,
    notice_tx: broadcast::Sender<RoomNotice>,
}

impl RoomChannels {
    /// Create a channel set seeded with `initial` and return the command receiver.
    pub fn new(
        command_buffer: usize,
        notice_buffer: usize,
        initial: RoomSnapshot,
    ) -> (Self, mpsc::Receiver<RoomCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (snapshot_tx, _) = watch::channel(Arc::new(initial));
        let (notice_tx, _) = broadcast::channel(notice_buffer.max(1));

        (
            Self {
                command_tx,
                snapshot_tx: Arc::new(snapshot_tx),
                notice_tx,
            },
            command_rx,
        )
    }

    /// Send one command without waiting.
    pub fn try_send_command(&self, command: RoomCommand) -> Result<(), ChannelError> {
        self.command_tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ChannelError::CommandChannelFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::CommandChannelClosed,
        })
    }

    /// Subscribe to snapshots. Slow readers only ever see the latest one.
    pub fn snapshots(&self) -> SnapshotStream {
        self.snapshot_tx.subscribe()
    }

    pub fn latest(&self) -> Arc<RoomSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Replace the published snapshot.
    pub fn publish(&self, snapshot: RoomSnapshot) {
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    pub fn notices(&self) -> NoticeStream {
        self.notice_tx.subscribe()
    }

    /// Emit a notice to current subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, notice: RoomNotice) {
        let _ = self.notice_tx.send(notice);
    }
}
