mod logging;
mod replay;
mod script;

use std::{env, path::PathBuf, process, time::Duration};

use roomline_core::RoomSnapshot;
use roomline_engine::EngineConfig;
use serde::Serialize;
use tracing::info;

use crate::{
    replay::{OfflineReport, replay_live, replay_offline},
    script::ReplayScript,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ReplayOutput<'a> {
    offline: &'a OfflineReport,
    snapshot: &'a RoomSnapshot,
}

#[tokio::main]
async fn main() {
    logging::init();

    let Some(path) = env::args_os()
        .nth(1)
        .or_else(|| env::var_os("ROOMLINE_REPLAY_SCRIPT"))
        .map(PathBuf::from)
    else {
        eprintln!("usage: roomline-replay <script.json>  (or set ROOMLINE_REPLAY_SCRIPT)");
        process::exit(2);
    };

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };

    let script = match ReplayScript::load(&path) {
        Ok(script) => script,
        Err(err) => {
            eprintln!("Failed to load script: {err}");
            process::exit(1);
        }
    };
    info!(
        room_id = %script.room_id,
        history = script.history.len(),
        ops = script.ops.len(),
        "replaying script"
    );

    let offline = match replay_offline(&script, &config) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Offline replay failed: {err}");
            process::exit(1);
        }
    };

    let snapshot = match replay_live(&script, &config, &offline.visible, SETTLE_TIMEOUT).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            eprintln!("Live replay failed: {err}");
            process::exit(1);
        }
    };

    let output = ReplayOutput {
        offline: &offline,
        snapshot: &snapshot,
    };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("Failed to encode snapshot: {err}");
            process::exit(1);
        }
    }
}
