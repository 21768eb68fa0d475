use std::{collections::HashMap, sync::Arc};

use roomline_core::NotificationContext;
use roomline_platform::ActivityLog;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::{
    config::EngineConfig,
    controller::{RoomController, RoomOptions},
    port::MatrixPort,
    thread::ThreadView,
};

/// Owns the open conversations of one account.
///
/// At most one controller exists per room; opening a room again closes the
/// previous controller before the new one subscribes.
pub struct RoomHub {
    port: Arc<dyn MatrixPort>,
    config: EngineConfig,
    activity: Option<ActivityLog>,
    focus: watch::Sender<NotificationContext>,
    rooms: Mutex<HashMap<String, Arc<RoomController>>>,
}

impl RoomHub {
    pub fn new(port: Arc<dyn MatrixPort>, config: EngineConfig) -> Self {
        let (focus, _) = watch::channel(NotificationContext::default());
        Self {
            port,
            config,
            activity: None,
            focus,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_activity(mut self, activity: ActivityLog) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn open_room(&self, room_id: &str, room_name: &str) -> Arc<RoomController> {
        let mut rooms = self.rooms.lock().await;
        if let Some(previous) = rooms.remove(room_id) {
            debug!(room_id, "closing previous controller before reopening");
            previous.close().await;
        }

        let mut options = RoomOptions::new(room_id, room_name)
            .with_config(self.config.clone())
            .with_notifications(self.focus.subscribe());
        if let Some(activity) = &self.activity {
            options = options.with_activity(activity.clone());
        }
        let controller = Arc::new(RoomController::spawn(Arc::clone(&self.port), options));
        rooms.insert(room_id.to_owned(), Arc::clone(&controller));
        controller
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<RoomController>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Open room IDs, sorted.
    pub async fn open_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns `false` when the room was not open.
    pub async fn close_room(&self, room_id: &str) -> bool {
        let controller = self.rooms.lock().await.remove(room_id);
        match controller {
            Some(controller) => {
                controller.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let controllers: Vec<_> = self.rooms.lock().await.drain().map(|(_, c)| c).collect();
        for controller in controllers {
            controller.close().await;
        }
    }

    pub fn set_focused_room(&self, room_id: Option<&str>) {
        let room_id = room_id.map(ToOwned::to_owned);
        self.focus.send_modify(|ctx| ctx.focused_room = room_id);
    }

    pub fn set_window_focused(&self, focused: bool) {
        self.focus.send_modify(|ctx| ctx.window_focused = focused);
    }

    pub fn notification_context(&self) -> NotificationContext {
        self.focus.borrow().clone()
    }

    pub fn thread_view(&self, room_id: &str, root_event_id: &str) -> ThreadView {
        ThreadView::new(
            Arc::clone(&self.port),
            room_id,
            root_event_id,
            self.config.thread_page_limit,
        )
    }
}
