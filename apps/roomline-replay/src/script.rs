use std::{fs, path::Path};

use roomline_core::{DiffOp, TimelineItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A recorded conversation: server history plus the diffs pushed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayScript {
    pub room_id: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub my_user_id: Option<String>,
    /// Items the live timeline starts with, oldest first.
    #[serde(default)]
    pub history: Vec<TimelineItem>,
    pub ops: Vec<DiffOp>,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid replay script: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("replay script has a blank room_id")]
    MissingRoom,
}

impl ReplayScript {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let raw = fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ScriptError> {
        let script: Self = serde_json::from_str(raw)?;
        if script.room_id.trim().is_empty() {
            return Err(ScriptError::MissingRoom);
        }
        Ok(script)
    }

    /// Every op a subscriber sees: the opening reset, then the script.
    pub fn full_ops(&self) -> Vec<DiffOp> {
        std::iter::once(DiffOp::Reset(self.history.clone()))
            .chain(self.ops.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_script() {
        let script = ReplayScript::from_json(
            r#"{
                "room_id": "!room:example.org",
                "ops": [
                    {"PushBack": {"item_id": "a", "event_id": "$a", "timestamp_ms": 1,
                                  "sender": "@bob:example.org", "body": "hi"}},
                    "PopFront"
                ]
            }"#,
        )
        .expect("script should parse");

        assert_eq!(script.room_name, "");
        assert!(script.history.is_empty());
        assert_eq!(script.ops.len(), 2);
        assert_eq!(script.full_ops().len(), 3);
        assert!(matches!(script.full_ops()[0], DiffOp::Reset(ref items) if items.is_empty()));
    }

    #[test]
    fn rejects_blank_room_and_bad_json() {
        assert!(matches!(
            ReplayScript::from_json(r#"{"room_id": "  ", "ops": []}"#),
            Err(ScriptError::MissingRoom)
        ));
        assert!(matches!(
            ReplayScript::from_json("{"),
            Err(ScriptError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_the_path() {
        let err = ReplayScript::load(Path::new("/nonexistent/roomline/script.json"))
            .expect_err("missing file should fail");
        assert!(err.to_string().contains("/nonexistent/roomline/script.json"));
    }
}
