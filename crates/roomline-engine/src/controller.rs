//! Per-conversation worker and its presentation-facing handle.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use roomline_core::{
    CommandOutcome, DiffOp, DiffOutcome, ErrorCategory, EventLog, NoticeStream, NotificationContext,
    OutboxTracker, PaginationStatus, ProjectionEngine, ReactionChip, ReactionTally, ReadTracker,
    ReconnectBackoff, RoomChannels, RoomCommand, RoomCommandKind, RoomSnapshot, RoomlineError,
    SendUpdate, SnapshotStream, ThreadCounts, ThreadSummary, ThumbnailRequest, TimelineItem,
    incoming_notice, last_incoming_ts, last_outgoing, normalize_command_outcome, should_notify,
};
use roomline_platform::ActivityLog;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    coordinator::{RoomStreams, SubscriptionCoordinator, SubscriptionKind},
    port::MatrixPort,
    typing::TypingDebouncer,
};

const COMMAND_BUFFER: usize = 128;
const NOTICE_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 1_024;
const THREAD_SUMMARY_PER_PAGE: u16 = 50;
const THREAD_SUMMARY_MAX_PAGES: u16 = 3;

/// What a controller needs besides the port.
#[derive(Clone)]
pub struct RoomOptions {
    pub room_id: String,
    pub room_name: String,
    pub config: EngineConfig,
    /// Where send activity and read markers are persisted.
    pub activity: Option<ActivityLog>,
    /// Focus state used to suppress notifications. Without it every
    /// incoming message from someone else raises one.
    pub notifications: Option<watch::Receiver<NotificationContext>>,
}

impl RoomOptions {
    pub fn new(room_id: impl Into<String>, room_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            room_name: room_name.into(),
            config: EngineConfig::default(),
            activity: None,
            notifications: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_activity(mut self, activity: ActivityLog) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_notifications(mut self, rx: watch::Receiver<NotificationContext>) -> Self {
        self.notifications = Some(rx);
        self
    }
}

struct RunningRoomTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle to one open conversation.
///
/// Commands are fire-and-forget; failures arrive on [`RoomController::notices`].
pub struct RoomController {
    room_id: String,
    channels: RoomChannels,
    running: Mutex<Option<RunningRoomTask>>,
}

impl RoomController {
    /// Start the worker for a conversation and begin opening its subscriptions.
    pub fn spawn(port: Arc<dyn MatrixPort>, options: RoomOptions) -> Self {
        let room_id = options.room_id.clone();
        let initial = RoomSnapshot {
            room_id: options.room_id.clone(),
            room_name: options.room_name.clone(),
            ..RoomSnapshot::default()
        };
        let (channels, command_rx) = RoomChannels::new(COMMAND_BUFFER, NOTICE_BUFFER, initial);
        let stop = CancellationToken::new();
        let worker = RoomWorker::new(port, options, channels.clone(), command_rx, stop.child_token());
        let task = tokio::spawn(worker.run());

        Self {
            room_id,
            channels,
            running: Mutex::new(Some(RunningRoomTask { stop, task })),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn snapshots(&self) -> SnapshotStream {
        self.channels.snapshots()
    }

    pub fn latest(&self) -> Arc<RoomSnapshot> {
        self.channels.latest()
    }

    pub fn notices(&self) -> NoticeStream {
        self.channels.notices()
    }

    pub fn send(&self, text: impl Into<String>, reply_to: Option<String>) {
        self.dispatch(RoomCommand::Send {
            text: text.into(),
            reply_to,
        });
    }

    pub fn edit(&self, event_id: impl Into<String>, text: impl Into<String>) {
        self.dispatch(RoomCommand::Edit {
            event_id: event_id.into(),
            text: text.into(),
        });
    }

    pub fn delete(&self, event_id: impl Into<String>) {
        self.dispatch(RoomCommand::Delete {
            event_id: event_id.into(),
        });
    }

    pub fn react(&self, event_id: impl Into<String>, emoji: impl Into<String>) {
        self.dispatch(RoomCommand::React {
            event_id: event_id.into(),
            emoji: emoji.into(),
        });
    }

    pub fn retry(&self, txn_id: impl Into<String>) {
        self.dispatch(RoomCommand::Retry {
            txn_id: txn_id.into(),
        });
    }

    pub fn paginate_back(&self) {
        self.dispatch(RoomCommand::PaginateBack);
    }

    pub fn mark_read_at(&self, event_id: impl Into<String>) {
        self.dispatch(RoomCommand::MarkReadAt {
            event_id: event_id.into(),
        });
    }

    pub fn set_composer_text(&self, text: impl Into<String>) {
        self.dispatch(RoomCommand::SetComposerText { text: text.into() });
    }

    pub fn resync(&self) {
        self.dispatch(RoomCommand::Resync);
    }

    pub fn dispatch(&self, command: RoomCommand) {
        let kind = command.kind();
        if let Err(err) = self.channels.try_send_command(command) {
            warn!(room_id = %self.room_id, command = ?kind, error = %err, "dropping room command");
        }
    }

    /// Stop the worker and wait until every subscription is released.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return;
        };
        running.stop.cancel();
        let _ = running.task.await;
        debug!(room_id = %self.room_id, "room closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.running.lock().await.is_none()
    }
}

impl Drop for RoomController {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingFallback {
    deadline: Instant,
    baseline: usize,
}

#[derive(Debug)]
enum WorkerEvent {
    Diff(DiffOp),
    Typing(Vec<String>),
    ReceiptsChanged,
    OwnReceiptChanged,
    Send(SendUpdate),
    StreamEnded(SubscriptionKind),
    Identity {
        my_user_id: Option<String>,
        dm_peer: Option<String>,
    },
    InitialSnapshot(Vec<TimelineItem>),
    PaginationDone {
        hit_start: bool,
    },
    PaginationFailed(RoomlineError),
    FallbackSnapshot(Vec<TimelineItem>),
    Reactions {
        event_id: String,
        chips: Vec<ReactionChip>,
    },
    ReactionToggled {
        event_id: String,
    },
    ReactionToggleFailed {
        event_id: String,
        previous: Vec<ReactionChip>,
        error: RoomlineError,
    },
    ThreadSummary(ThreadSummary),
    /// `path` is `None` when the fetch failed.
    Thumbnail {
        item_id: String,
        event_id: String,
        path: Option<PathBuf>,
    },
    PeerRead {
        event_id: String,
        read: bool,
    },
    OwnLastRead(Option<u64>),
    CommandFailed {
        command: RoomCommandKind,
        error: RoomlineError,
    },
}

/// Worker event plus the subscription generation it belongs to. Command
/// results carry `None` and are accepted across re-syncs.
struct Tagged {
    generation: Option<u64>,
    event: WorkerEvent,
}

struct RoomWorker {
    port: Arc<dyn MatrixPort>,
    room_id: String,
    room_name: String,
    config: EngineConfig,
    channels: RoomChannels,
    command_rx: mpsc::Receiver<RoomCommand>,
    stop: CancellationToken,
    scope: CancellationToken,
    events_tx: mpsc::Sender<Tagged>,
    events_rx: mpsc::Receiver<Tagged>,
    coordinator: SubscriptionCoordinator,
    backoff: ReconnectBackoff,
    reconnect_at: Option<Instant>,

    log: EventLog,
    projection: ProjectionEngine,
    reactions: ReactionTally,
    thread_counts: ThreadCounts,
    thumbnails: HashMap<String, PathBuf>,
    read: ReadTracker,
    outbox: OutboxTracker,
    typing_names: Vec<String>,
    pagination: PaginationStatus,
    fallback: Option<PendingFallback>,
    my_user_id: Option<String>,
    dm_peer: Option<String>,

    typing: TypingDebouncer,
    activity: Option<ActivityLog>,
    notifications: Option<watch::Receiver<NotificationContext>>,
    dirty: bool,
}

impl RoomWorker {
    fn new(
        port: Arc<dyn MatrixPort>,
        options: RoomOptions,
        channels: RoomChannels,
        command_rx: mpsc::Receiver<RoomCommand>,
        stop: CancellationToken,
    ) -> Self {
        let RoomOptions {
            room_id,
            room_name,
            config,
            activity,
            notifications,
        } = options;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let typing = TypingDebouncer::new(Arc::clone(&port), room_id.clone(), config.typing_idle);
        let scope = stop.child_token();

        Self {
            projection: ProjectionEngine::new(config.projection(), None),
            coordinator: SubscriptionCoordinator::new(room_id.clone()),
            port,
            room_id,
            room_name,
            config,
            channels,
            command_rx,
            stop,
            scope,
            events_tx,
            events_rx,
            backoff: ReconnectBackoff::default(),
            reconnect_at: None,
            log: EventLog::new(),
            reactions: ReactionTally::default(),
            thread_counts: ThreadCounts::default(),
            thumbnails: HashMap::new(),
            read: ReadTracker::default(),
            outbox: OutboxTracker::new(),
            typing_names: Vec::new(),
            pagination: PaginationStatus::default(),
            fallback: None,
            my_user_id: None,
            dm_peer: None,
            typing,
            activity,
            notifications,
            dirty: false,
        }
    }

    async fn run(mut self) {
        debug!(room_id = %self.room_id, "room worker started");
        self.open_subscriptions().await;
        self.publish();

        loop {
            let fallback_at = self.fallback.map(|fallback| fallback.deadline);
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                _ = self.stop.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(tagged) = self.events_rx.recv() => self.handle_event(tagged),
                _ = sleep_until_opt(fallback_at) => self.run_fallback(),
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.open_subscriptions().await;
                }
            }

            if self.dirty {
                self.publish();
            }
        }

        self.shutdown();
    }

    async fn open_subscriptions(&mut self) {
        self.scope.cancel();
        self.scope = self.stop.child_token();
        self.fallback = None;
        let forgotten = self.projection.forget_pending_thumbnails();
        if forgotten > 0 {
            debug!(room_id = %self.room_id, forgotten, "thumbnail fetches cancelled by re-sync");
        }
        if self.pagination.is_paginating_back {
            self.pagination.is_paginating_back = false;
            self.dirty = true;
        }

        match self.coordinator.open(self.port.as_ref()).await {
            Ok(streams) => {
                self.backoff.reset();
                self.forward_streams(streams);
                self.start_initial_load();
            }
            Err(err) => {
                warn!(room_id = %self.room_id, error = %err, "failed to open room subscriptions");
                if err.is_transient() && !self.stop.is_cancelled() {
                    self.reconnect_at = Some(Instant::now() + self.backoff.next_delay());
                }
                self.emit_failure(RoomCommandKind::Resync, err);
            }
        }
    }

    fn shutdown(&mut self) {
        self.scope.cancel();
        self.stop.cancel();
        self.typing.stop();
        let released = self.coordinator.close();
        debug!(room_id = %self.room_id, released = released.len(), "room worker stopped");
    }

    fn forward_streams(&self, streams: RoomStreams) {
        let RoomStreams {
            diffs,
            typing,
            receipts,
            own_receipt,
            sends,
        } = streams;
        self.forward(SubscriptionKind::Timeline, diffs, WorkerEvent::Diff);
        self.forward(SubscriptionKind::Typing, typing, WorkerEvent::Typing);
        self.forward(SubscriptionKind::Receipts, receipts, |()| {
            WorkerEvent::ReceiptsChanged
        });
        self.forward(SubscriptionKind::OwnReceipt, own_receipt, |()| {
            WorkerEvent::OwnReceiptChanged
        });
        self.forward(SubscriptionKind::Sends, sends, WorkerEvent::Send);
    }

    fn forward<T, F>(&self, kind: SubscriptionKind, mut rx: mpsc::Receiver<T>, wrap: F)
    where
        T: Send + 'static,
        F: Fn(T) -> WorkerEvent + Send + 'static,
    {
        let scope = self.scope.clone();
        let tx = self.events_tx.clone();
        let generation = Some(self.coordinator.generation());
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = scope.cancelled() => return,
                    item = rx.recv() => item,
                };
                let ended = item.is_none();
                let event = match item {
                    Some(item) => wrap(item),
                    None => WorkerEvent::StreamEnded(kind),
                };
                if tx.send(Tagged { generation, event }).await.is_err() || ended {
                    return;
                }
            }
        });
    }

    /// Run subscription-bound work; its result is dropped after a re-sync or close.
    fn spawn_work<F>(&self, work: F)
    where
        F: Future<Output = Option<WorkerEvent>> + Send + 'static,
    {
        spawn_tagged(
            self.scope.clone(),
            self.events_tx.clone(),
            Some(self.coordinator.generation()),
            work,
        );
    }

    /// Run command work; its result survives a re-sync but not a close.
    fn spawn_command<F>(&self, work: F)
    where
        F: Future<Output = Option<WorkerEvent>> + Send + 'static,
    {
        spawn_tagged(self.stop.clone(), self.events_tx.clone(), None, work);
    }

    fn spawn_simple_command<F>(&self, command: RoomCommandKind, work: F)
    where
        F: Future<Output = Result<(), RoomlineError>> + Send + 'static,
    {
        self.spawn_command(async move {
            match CommandOutcome::from(work.await) {
                CommandOutcome::Success => None,
                CommandOutcome::Failure { error } => {
                    Some(WorkerEvent::CommandFailed { command, error })
                }
            }
        });
    }

    fn start_initial_load(&mut self) {
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_work(async move {
            let my_user_id = port.whoami().await.unwrap_or_else(|err| {
                warn!(error = %err, "failed to resolve own user id");
                None
            });
            let dm_peer = port.dm_peer_user_id(&room_id).await.unwrap_or_else(|err| {
                debug!(room_id = %room_id, error = %err, "failed to resolve dm peer");
                None
            });
            Some(WorkerEvent::Identity {
                my_user_id,
                dm_peer,
            })
        });

        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        let limit = self.config.initial_load_limit;
        self.spawn_work(async move {
            match port.load_recent(&room_id, limit).await {
                Ok(items) => Some(WorkerEvent::InitialSnapshot(items)),
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "initial load failed");
                    None
                }
            }
        });

        self.refresh_own_read();
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        trace!(room_id = %self.room_id, command = ?command.kind(), "room command");
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();

        match command {
            RoomCommand::Send { text, reply_to } => self.send_text(text, reply_to),
            RoomCommand::Edit { event_id, text } => {
                self.spawn_simple_command(RoomCommandKind::Edit, async move {
                    port.edit(&room_id, &event_id, &text).await
                });
            }
            RoomCommand::Delete { event_id } => {
                self.spawn_simple_command(RoomCommandKind::Delete, async move {
                    port.redact(&room_id, &event_id, None).await
                });
            }
            RoomCommand::React { event_id, emoji } => self.toggle_reaction(event_id, emoji),
            RoomCommand::Retry { txn_id } => self.retry_send(txn_id),
            RoomCommand::PaginateBack => self.start_pagination(),
            RoomCommand::MarkReadAt { event_id } => self.mark_read_at(event_id),
            RoomCommand::SetComposerText { text } => self.typing.on_composer_text(&text),
            RoomCommand::Resync => self.open_subscriptions().await,
        }
    }

    fn send_text(&mut self, text: String, reply_to: Option<String>) {
        if text.trim().is_empty() {
            return;
        }
        self.typing.on_composer_text("");
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        let txn_id = Uuid::new_v4().to_string();
        debug!(room_id = %self.room_id, txn_id = %txn_id, "sending message");
        self.spawn_simple_command(RoomCommandKind::Send, async move {
            port.send_text(&room_id, &text, reply_to.as_deref(), &txn_id)
                .await
        });
    }

    fn toggle_reaction(&mut self, event_id: String, emoji: String) {
        let previous = self.reactions.apply_optimistic_toggle(&event_id, &emoji);
        self.dirty = true;
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_command(async move {
            match port.react(&room_id, &event_id, &emoji).await {
                Ok(()) => Some(WorkerEvent::ReactionToggled { event_id }),
                Err(error) => Some(WorkerEvent::ReactionToggleFailed {
                    event_id,
                    previous,
                    error,
                }),
            }
        });
    }

    fn retry_send(&mut self, txn_id: String) {
        let body = self
            .log
            .find_by_txn_id(&txn_id)
            .map(|item| item.body.clone());
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_simple_command(RoomCommandKind::Retry, async move {
            if port.retry_by_txn(&room_id, &txn_id).await? {
                return Ok(());
            }
            let Some(body) = body else {
                return Err(RoomlineError::new(
                    ErrorCategory::NotFound,
                    "unknown_transaction",
                    format!("no local message for transaction {txn_id}"),
                ));
            };
            debug!(room_id = %room_id, txn_id = %txn_id, "retry unknown to queue; resending body");
            port.send_text(&room_id, &body, None, &Uuid::new_v4().to_string())
                .await
        });
    }

    fn mark_read_at(&mut self, event_id: String) {
        let ts = self
            .log
            .find_by_event_id(&event_id)
            .map(|item| item.timestamp_ms);
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_command(async move {
            match port.mark_read_at(&room_id, &event_id).await {
                Ok(()) => Some(WorkerEvent::OwnLastRead(ts)),
                Err(error) => Some(WorkerEvent::CommandFailed {
                    command: RoomCommandKind::MarkReadAt,
                    error,
                }),
            }
        });
    }

    fn handle_event(&mut self, tagged: Tagged) {
        if let Some(generation) = tagged.generation
            && generation != self.coordinator.generation()
        {
            trace!(room_id = %self.room_id, generation, "dropping stale result");
            return;
        }

        match tagged.event {
            WorkerEvent::Diff(op) => self.apply_diff(op),
            WorkerEvent::Typing(names) => {
                if self.typing_names != names {
                    self.typing_names = names;
                    self.dirty = true;
                }
            }
            WorkerEvent::ReceiptsChanged => self.check_peer_read(),
            WorkerEvent::OwnReceiptChanged => self.refresh_own_read(),
            WorkerEvent::Send(update) => self.apply_send_update(update),
            WorkerEvent::StreamEnded(kind) => self.on_stream_ended(kind),
            WorkerEvent::Identity {
                my_user_id,
                dm_peer,
            } => {
                self.projection.set_my_user_id(my_user_id.clone());
                self.my_user_id = my_user_id;
                self.dm_peer = dm_peer;
                self.dirty = true;
                self.sync_last_outgoing(true);
            }
            WorkerEvent::InitialSnapshot(items) => self.apply_initial_snapshot(items),
            WorkerEvent::PaginationDone { hit_start } => self.finish_pagination(hit_start),
            WorkerEvent::PaginationFailed(error) => {
                self.pagination.is_paginating_back = false;
                self.dirty = true;
                self.emit_failure(RoomCommandKind::PaginateBack, error);
            }
            WorkerEvent::FallbackSnapshot(items) => {
                if !items.is_empty() {
                    self.apply_diff(DiffOp::Reset(items));
                }
            }
            WorkerEvent::Reactions { event_id, chips } => {
                if self.reactions.replace(&event_id, chips) {
                    self.dirty = true;
                }
            }
            WorkerEvent::ReactionToggled { event_id } => self.refresh_reactions(event_id),
            WorkerEvent::ReactionToggleFailed {
                event_id,
                previous,
                error,
            } => {
                self.reactions.replace(&event_id, previous);
                self.dirty = true;
                self.emit_failure(RoomCommandKind::React, error);
            }
            WorkerEvent::ThreadSummary(summary) => {
                if self.thread_counts.apply(&summary) {
                    self.dirty = true;
                }
            }
            WorkerEvent::Thumbnail {
                item_id,
                event_id,
                path,
            } => {
                self.projection.settle_thumbnail(&item_id);
                if let Some(path) = path {
                    self.thumbnails.insert(event_id, path);
                    self.dirty = true;
                }
            }
            WorkerEvent::PeerRead { event_id, read } => {
                if self.read.observe_peer_read(&event_id, read) {
                    self.dirty = true;
                }
            }
            WorkerEvent::OwnLastRead(ts) => {
                if let Some(ts) = ts {
                    self.advance_read_marker(ts);
                }
            }
            WorkerEvent::CommandFailed { command, error } => self.emit_failure(command, error),
        }
    }

    fn apply_diff(&mut self, op: DiffOp) {
        if self.log.apply(&op) == DiffOutcome::Ignored {
            return;
        }
        self.dirty = true;
        let plan = self.projection.plan(&self.log, &op);

        if self
            .fallback
            .is_some_and(|fallback| self.log.visible().len() > fallback.baseline)
        {
            debug!(room_id = %self.room_id, "log grew; fallback cancelled");
            self.fallback = None;
        }

        if op.is_wholesale() {
            self.prune_projections();
        }

        if matches!(
            op,
            DiffOp::Append(_) | DiffOp::PushBack(_) | DiffOp::InsertAt { .. }
        ) {
            self.notify_arrivals(&plan.arrivals);
        }

        for event_id in plan.reaction_refresh {
            self.refresh_reactions(event_id);
        }
        for request in plan.thumbnail_requests {
            self.fetch_thumbnail(request);
        }
        for root in plan.thread_refresh {
            self.refresh_thread_summary(root);
        }
        self.sync_last_outgoing(plan.read_check_needed);
    }

    fn prune_projections(&mut self) {
        let visible = self.log.visible();
        let keep_events: HashSet<&str> = visible.iter().filter_map(TimelineItem::event_id).collect();
        let keep_items: HashSet<&str> = visible.iter().map(|item| item.item_id.as_str()).collect();
        self.reactions.retain_events(&keep_events);
        self.thread_counts.retain_roots(&keep_events);
        self.thumbnails
            .retain(|event_id, _| keep_events.contains(event_id.as_str()));
        self.projection.retain_thumbnails(&keep_items);
    }

    fn apply_initial_snapshot(&mut self, items: Vec<TimelineItem>) {
        if self.log.is_empty() && !items.is_empty() {
            debug!(room_id = %self.room_id, items = items.len(), "seeding log from initial snapshot");
            self.apply_diff(DiffOp::Reset(items));
        }
        if self.log.visible().len() < self.config.initial_load_limit as usize
            && !self.pagination.hit_start
        {
            self.start_pagination();
        }
    }

    fn start_pagination(&mut self) {
        if self.pagination.is_paginating_back || self.pagination.hit_start {
            trace!(room_id = %self.room_id, "pagination skipped");
            return;
        }
        self.pagination.is_paginating_back = true;
        self.fallback = Some(PendingFallback {
            deadline: Instant::now() + self.config.fallback_timeout,
            baseline: self.log.visible().len(),
        });
        self.dirty = true;

        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        let count = self.config.effective_page_size();
        self.spawn_work(async move {
            Some(match port.paginate_back(&room_id, count).await {
                Ok(hit_start) => WorkerEvent::PaginationDone { hit_start },
                Err(error) => WorkerEvent::PaginationFailed(error),
            })
        });
    }

    fn finish_pagination(&mut self, hit_start: bool) {
        self.pagination.is_paginating_back = false;
        self.pagination.hit_start = hit_start;
        self.dirty = true;

        if hit_start {
            self.fallback = None;
        } else if self.fallback.is_some() {
            debug!(room_id = %self.room_id, "pagination returned without growing the log");
        }
    }

    fn run_fallback(&mut self) {
        let Some(fallback) = self.fallback.take() else {
            return;
        };
        let len = self.log.visible().len();
        if len > fallback.baseline {
            return;
        }
        if self.pagination.is_paginating_back {
            self.pagination.is_paginating_back = false;
            self.dirty = true;
        }
        let page = usize::from(self.config.page_size);
        let limit = u32::try_from(len.saturating_add(page).max(page)).unwrap_or(u32::MAX);
        debug!(room_id = %self.room_id, limit, "pagination stalled; loading snapshot");

        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_work(async move {
            match port.load_recent(&room_id, limit).await {
                Ok(items) => Some(WorkerEvent::FallbackSnapshot(items)),
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "fallback snapshot failed");
                    None
                }
            }
        });
    }

    fn refresh_reactions(&self, event_id: String) {
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_work(async move {
            match port.reactions(&room_id, &event_id).await {
                Ok(chips) => Some(WorkerEvent::Reactions { event_id, chips }),
                Err(err) => {
                    debug!(room_id = %room_id, event_id = %event_id, error = %err, "reaction refresh failed");
                    None
                }
            }
        });
    }

    fn fetch_thumbnail(&self, request: ThumbnailRequest) {
        let port = Arc::clone(&self.port);
        let size = self.config.thumbnail_size_px;
        self.spawn_work(async move {
            let path = match port
                .thumbnail_to_cache(&request.attachment, size, size, true)
                .await
            {
                Ok(path) => Some(path),
                Err(err) => {
                    debug!(item_id = %request.item_id, error = %err, "thumbnail fetch failed");
                    None
                }
            };
            Some(WorkerEvent::Thumbnail {
                item_id: request.item_id,
                event_id: request.event_id,
                path,
            })
        });
    }

    fn refresh_thread_summary(&self, root_event_id: String) {
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_work(async move {
            match port
                .thread_summary(
                    &room_id,
                    &root_event_id,
                    THREAD_SUMMARY_PER_PAGE,
                    THREAD_SUMMARY_MAX_PAGES,
                )
                .await
            {
                Ok(summary) => Some(WorkerEvent::ThreadSummary(summary)),
                Err(err) => {
                    debug!(room_id = %room_id, root = %root_event_id, error = %err, "thread summary failed");
                    None
                }
            }
        });
    }

    fn refresh_own_read(&self) {
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_work(async move {
            match port.own_last_read(&room_id).await {
                Ok(ts) => Some(WorkerEvent::OwnLastRead(ts)),
                Err(err) => {
                    debug!(room_id = %room_id, error = %err, "own read marker refresh failed");
                    None
                }
            }
        });
    }

    fn sync_last_outgoing(&mut self, check: bool) {
        let outgoing = last_outgoing(self.log.visible(), self.my_user_id.as_deref())
            .and_then(TimelineItem::event_id)
            .map(ToOwned::to_owned);
        if self.read.set_last_outgoing(outgoing) {
            self.dirty = true;
        }
        if check {
            self.check_peer_read();
        }
    }

    fn check_peer_read(&self) {
        let (Some(peer), Some(event_id)) = (
            self.dm_peer.clone(),
            self.read.outgoing_event().map(ToOwned::to_owned),
        ) else {
            return;
        };
        let port = Arc::clone(&self.port);
        let room_id = self.room_id.clone();
        self.spawn_work(async move {
            match port.is_event_read_by(&room_id, &event_id, &peer).await {
                Ok(read) => Some(WorkerEvent::PeerRead { event_id, read }),
                Err(err) => {
                    debug!(room_id = %room_id, error = %err, "peer read check failed");
                    None
                }
            }
        });
    }

    fn advance_read_marker(&mut self, ts: u64) {
        if !self.read.advance_last_read(ts) {
            return;
        }
        self.dirty = true;
        if let Some(activity) = &self.activity
            && let Err(err) = activity.record_read_ts(&self.room_id, ts)
        {
            warn!(room_id = %self.room_id, error = %err, "failed to persist read marker");
        }
    }

    fn apply_send_update(&mut self, update: SendUpdate) {
        if update.room_id != self.room_id {
            return;
        }
        if let Some(activity) = &self.activity
            && let Err(err) = activity.record_activity(&self.room_id, now_ms())
        {
            warn!(room_id = %self.room_id, error = %err, "failed to persist room activity");
        }
        if self.outbox.apply(update) {
            self.dirty = true;
        }
    }

    fn on_stream_ended(&mut self, kind: SubscriptionKind) {
        if self.stop.is_cancelled() {
            return;
        }
        warn!(room_id = %self.room_id, stream = ?kind, "subscription stream ended");
        if kind == SubscriptionKind::Timeline && self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + self.backoff.next_delay());
        }
    }

    fn notify_arrivals(&self, arrivals: &[TimelineItem]) {
        let Some(me) = self.my_user_id.as_deref() else {
            return;
        };
        let ctx = self
            .notifications
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();
        for item in arrivals {
            if should_notify(&ctx, &self.room_id, item.sender == me) {
                self.channels
                    .emit(incoming_notice(&self.room_id, &self.room_name, item));
            }
        }
    }

    fn emit_failure(&self, command: RoomCommandKind, error: RoomlineError) {
        warn!(room_id = %self.room_id, command = ?command, error = %error, "room command failed");
        if let Some(notice) = normalize_command_outcome(command, CommandOutcome::Failure { error }) {
            self.channels.emit(notice);
        }
    }

    fn publish(&mut self) {
        self.dirty = false;
        let visible = self.log.visible();
        let snapshot = RoomSnapshot {
            room_id: self.room_id.clone(),
            room_name: self.room_name.clone(),
            my_user_id: self.my_user_id.clone(),
            visible: visible.to_vec(),
            outbox: self.outbox.visible_for(&self.room_id),
            reactions: self.reactions.as_map().clone(),
            thread_counts: self.thread_counts.as_map().clone(),
            thumbnails: self.thumbnails.clone(),
            read: self.read.state(),
            is_dm: self.dm_peer.is_some(),
            last_incoming_ts: last_incoming_ts(visible, self.my_user_id.as_deref()),
            typing: self.typing_names.clone(),
            pagination: self.pagination,
        };
        trace!(room_id = %self.room_id, visible = snapshot.visible.len(), "publishing snapshot");
        self.channels.publish(snapshot);
    }
}

fn spawn_tagged<F>(
    scope: CancellationToken,
    tx: mpsc::Sender<Tagged>,
    generation: Option<u64>,
    work: F,
) where
    F: Future<Output = Option<WorkerEvent>> + Send + 'static,
{
    tokio::spawn(async move {
        let event = tokio::select! {
            _ = scope.cancelled() => return,
            event = work => event,
        };
        if let Some(event) = event {
            let _ = tx.send(Tagged { generation, event }).await;
        }
    });
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
