use std::{sync::Arc, time::Duration};

use roomline_core::{
    DiffOutcome, EventLog, ProjectionEngine, RoomSnapshot, TimelineItem, reduce_all,
};
use roomline_engine::{EngineConfig, InMemoryPort, RoomController, RoomFixture, RoomOptions};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::script::ReplayScript;

/// What the pure reducer and projection produced for a script.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OfflineReport {
    pub ops: usize,
    pub clamped: usize,
    pub ignored: usize,
    pub arrivals: usize,
    pub reaction_refreshes: usize,
    pub thumbnail_requests: usize,
    pub thread_refreshes: usize,
    pub visible: Vec<TimelineItem>,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("reducer runs disagree after {ops} ops")]
    Nondeterministic { ops: usize },
    #[error("engine view diverged: expected {expected:?}, got {actual:?}")]
    Diverged {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("engine did not reach {stage} within {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
}

/// Fold the script through the reducer twice and once op-by-op with
/// projection planning; all three must agree.
pub fn replay_offline(
    script: &ReplayScript,
    config: &EngineConfig,
) -> Result<OfflineReport, ReplayError> {
    let ops = script.full_ops();
    let folded = reduce_all(&EventLog::new(), &ops);
    if folded != reduce_all(&EventLog::new(), &ops) {
        return Err(ReplayError::Nondeterministic { ops: ops.len() });
    }

    let mut projection = ProjectionEngine::new(config.projection(), script.my_user_id.clone());
    let mut log = EventLog::new();
    let mut report = OfflineReport {
        ops: ops.len(),
        ..OfflineReport::default()
    };
    for op in &ops {
        match log.apply(op) {
            DiffOutcome::Ignored => {
                report.ignored += 1;
                continue;
            }
            DiffOutcome::Clamped => report.clamped += 1,
            DiffOutcome::Applied => {}
        }
        let plan = projection.plan(&log, op);
        report.arrivals += plan.arrivals.len();
        report.reaction_refreshes += plan.reaction_refresh.len();
        report.thumbnail_requests += plan.thumbnail_requests.len();
        report.thread_refreshes += plan.thread_refresh.len();
    }
    if log != folded {
        return Err(ReplayError::Nondeterministic { ops: ops.len() });
    }

    report.visible = log.visible().to_vec();
    debug!(
        ops = report.ops,
        visible = report.visible.len(),
        clamped = report.clamped,
        ignored = report.ignored,
        "offline replay finished"
    );
    Ok(report)
}

/// Push the script through a real controller over [`InMemoryPort`] and
/// return its settled snapshot, which must match `expected`.
pub async fn replay_live(
    script: &ReplayScript,
    config: &EngineConfig,
    expected: &[TimelineItem],
    timeout: Duration,
) -> Result<Arc<RoomSnapshot>, ReplayError> {
    let port = InMemoryPort::new(script.my_user_id.as_deref());
    port.add_room(&script.room_id, RoomFixture::new(script.history.clone()));
    let options =
        RoomOptions::new(&script.room_id, &script.room_name).with_config(config.clone());
    let controller = RoomController::spawn(Arc::new(port.clone()), options);

    let result = drive(&port, &controller, script, expected, timeout).await;
    controller.close().await;
    result
}

async fn drive(
    port: &InMemoryPort,
    controller: &RoomController,
    script: &ReplayScript,
    expected: &[TimelineItem],
    timeout: Duration,
) -> Result<Arc<RoomSnapshot>, ReplayError> {
    wait_for(controller, "initial load", timeout, |s| s.pagination.hit_start).await?;

    for op in &script.ops {
        port.push_diff(&script.room_id, op.clone()).await;
    }

    let expected_ids = item_ids(expected);
    match wait_for(controller, "settled view", timeout, |s| {
        item_ids(&s.visible) == expected_ids
    })
    .await
    {
        Ok(snapshot) => {
            info!(
                room_id = %script.room_id,
                visible = snapshot.visible.len(),
                "live replay matches reducer"
            );
            Ok(snapshot)
        }
        Err(ReplayError::Timeout { .. }) => Err(ReplayError::Diverged {
            expected: expected_ids,
            actual: item_ids(&controller.latest().visible),
        }),
        Err(err) => Err(err),
    }
}

async fn wait_for<F>(
    controller: &RoomController,
    stage: &'static str,
    timeout: Duration,
    mut predicate: F,
) -> Result<Arc<RoomSnapshot>, ReplayError>
where
    F: FnMut(&RoomSnapshot) -> bool,
{
    let mut rx = controller.snapshots();
    let waited = tokio::time::timeout(timeout, async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return Some(snapshot);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;

    match waited {
        Ok(Some(snapshot)) => Ok(snapshot),
        Ok(None) | Err(_) => Err(ReplayError::Timeout { stage, timeout }),
    }
}

fn item_ids(items: &[TimelineItem]) -> Vec<String> {
    items.iter().map(|item| item.item_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use roomline_core::{Attachment, AttachmentKind, DiffOp};

    use super::*;

    fn text(id: &str, sender: &str, ts: u64) -> TimelineItem {
        TimelineItem::text(id, Some(format!("${id}")), sender, id, ts)
    }

    fn script() -> ReplayScript {
        let mut photo = text("photo", "@bob:example.org", 5);
        photo.attachment = Some(Attachment {
            kind: AttachmentKind::Image,
            mxc_uri: "mxc://example.org/photo".into(),
            mime: None,
            thumbnail_mxc_uri: None,
            size_bytes: None,
        });
        let mut reply = text("reply", "@bob:example.org", 6);
        reply.thread_root_id = Some("$a".into());

        ReplayScript {
            room_id: "!room:example.org".into(),
            room_name: "Lobby".into(),
            my_user_id: Some("@me:example.org".into()),
            history: vec![text("a", "@bob:example.org", 1), text("b", "@me:example.org", 2)],
            ops: vec![
                DiffOp::PushBack(photo),
                DiffOp::PushBack(reply),
                DiffOp::InsertAt {
                    index: 99,
                    item: text("late", "@bob:example.org", 7),
                },
                DiffOp::RemoveAt { index: 42 },
                DiffOp::PopFront,
            ],
        }
    }

    #[test]
    fn offline_replay_counts_outcomes() {
        let report = replay_offline(&script(), &EngineConfig::default()).expect("replay");

        assert_eq!(report.ops, 6);
        assert_eq!(report.clamped, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.thumbnail_requests, 1);
        assert_eq!(item_ids(&report.visible), vec!["b", "photo", "late"]);
    }

    #[tokio::test]
    async fn live_replay_matches_the_reducer() {
        let script = script();
        let config = EngineConfig::default();
        let report = replay_offline(&script, &config).expect("offline replay");

        let snapshot = replay_live(&script, &config, &report.visible, Duration::from_secs(5))
            .await
            .expect("live replay");
        assert_eq!(snapshot.visible, report.visible);
        assert_eq!(snapshot.room_name, "Lobby");
    }
}
