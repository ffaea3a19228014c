//! Filesystem change records as they appear on the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "op_created")]
    Created,
    #[serde(rename = "op_removed")]
    Removed,
    #[serde(rename = "op_modified")]
    Modified,
}

/// One filesystem event. `path` is relative to the sync root and doubles as
/// the remote object key. `stage` separates the baseline scan (stage 0)
/// from live watch events recorded after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOp {
    pub path: String,
    pub op: Op,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stage: u64,
}

impl FileOp {
    pub fn new(path: String, op: Op, stage: u64) -> Self {
        Self {
            path,
            op,
            timestamp: Utc::now(),
            stage,
        }
    }

    /// A baseline record as emitted by the initial scan. The epoch
    /// timestamp sentinel guarantees any real event supersedes it.
    pub fn baseline(path: String) -> Self {
        Self {
            path,
            op: Op::Created,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            stage: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_serialize_to_their_wire_names() {
        assert_eq!(
            "\"op_created\"",
            serde_json::to_string(&Op::Created).unwrap()
        );
        assert_eq!(
            "\"op_removed\"",
            serde_json::to_string(&Op::Removed).unwrap()
        );
        assert_eq!(
            "\"op_modified\"",
            serde_json::to_string(&Op::Modified).unwrap()
        );
    }

    #[test]
    fn stage_defaults_to_zero_when_absent() {
        let raw = r#"{"path":"a.txt","op":"op_modified","timestamp":"2024-05-01T10:00:00Z"}"#;
        let op: FileOp = serde_json::from_str(raw).unwrap();
        assert_eq!(0, op.stage);
        assert_eq!(Op::Modified, op.op);
    }

    #[test]
    fn record_round_trips_through_json() {
        let op = FileOp::new("dir/file.txt".to_string(), Op::Created, 1);
        let bytes = serde_json::to_vec(&op).unwrap();
        let back: FileOp = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(op, back);
    }

    #[test]
    fn baseline_records_use_the_epoch_sentinel() {
        let op = FileOp::baseline("a.txt".to_string());
        assert_eq!(0, op.timestamp.timestamp());
        assert_eq!(Op::Created, op.op);
    }
}
