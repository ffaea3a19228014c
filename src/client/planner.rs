//! Turns index snapshots into a plan of uploads and deletions.

use std::collections::HashMap;

use crate::client::indexer::FileMetadata;
use crate::client::ops::Op;
use crate::client::rest::RemoteFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanRequest {
    Upload(FileMetadata),
    Delete(String),
}

#[derive(Debug, Default)]
pub struct Plan {
    pub requests: Vec<PlanRequest>,
}

/// Diffs the local snapshot against the server's, when one is available.
///
/// Without a server snapshot the plan mirrors the local ops directly.
/// With one, locally removed entries are discarded from the working copy,
/// uploads cover keys the server misses or holds with a different checksum,
/// and every server key absent locally becomes a deletion.
pub fn generate(
    mut local: HashMap<String, FileMetadata>,
    server: Option<&HashMap<String, RemoteFile>>,
) -> Plan {
    let Some(server) = server else {
        let requests = local
            .into_values()
            .map(|md| match md.op {
                Op::Created | Op::Modified => PlanRequest::Upload(md),
                Op::Removed => PlanRequest::Delete(md.path),
            })
            .collect();
        return Plan { requests };
    };

    local.retain(|_, md| md.op != Op::Removed);

    let mut requests = Vec::new();
    for (key, md) in &local {
        match server.get(key) {
            Some(remote) if remote.sha256_checksum == md.sha256 => {}
            _ => requests.push(PlanRequest::Upload(md.clone())),
        }
    }
    for key in server.keys() {
        if !local.contains_key(key) {
            requests.push(PlanRequest::Delete(key.clone()));
        }
    }

    Plan { requests }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn md(path: &str, sha256: &str, op: Op) -> FileMetadata {
        FileMetadata {
            path: path.to_string(),
            size: 1,
            sha256: sha256.to_string(),
            mtime: 100,
            op,
            timestamp: Utc::now(),
        }
    }

    fn remote(key: &str, sha256: &str) -> RemoteFile {
        RemoteFile {
            key: key.to_string(),
            size: 1,
            sha256_checksum: sha256.to_string(),
        }
    }

    #[test]
    fn without_server_snapshot_ops_map_directly() {
        let local = HashMap::from([
            ("a".to_string(), md("a", "s1", Op::Created)),
            ("b".to_string(), md("b", "s2", Op::Modified)),
            ("c".to_string(), md("c", "", Op::Removed)),
        ]);

        let plan = generate(local, None);

        let mut uploads = 0;
        let mut deletes = Vec::new();
        for req in plan.requests {
            match req {
                PlanRequest::Upload(_) => uploads += 1,
                PlanRequest::Delete(key) => deletes.push(key),
            }
        }
        assert_eq!(2, uploads);
        assert_eq!(vec!["c".to_string()], deletes);
    }

    #[test]
    fn server_snapshot_skips_matching_checksums() {
        let local = HashMap::from([
            ("same".to_string(), md("same", "abc", Op::Created)),
            ("changed".to_string(), md("changed", "new", Op::Modified)),
            ("fresh".to_string(), md("fresh", "xyz", Op::Created)),
        ]);
        let server = HashMap::from([
            ("same".to_string(), remote("same", "abc")),
            ("changed".to_string(), remote("changed", "old")),
        ]);

        let plan = generate(local, Some(&server));

        let uploads: Vec<String> = plan
            .requests
            .iter()
            .filter_map(|req| match req {
                PlanRequest::Upload(md) => Some(md.path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(2, uploads.len());
        assert!(uploads.contains(&"changed".to_string()));
        assert!(uploads.contains(&"fresh".to_string()));
    }

    #[test]
    fn server_keys_absent_locally_are_deleted() {
        let local = HashMap::from([("kept".to_string(), md("kept", "abc", Op::Created))]);
        let server = HashMap::from([
            ("kept".to_string(), remote("kept", "abc")),
            ("orphan".to_string(), remote("orphan", "zzz")),
        ]);

        let plan = generate(local, Some(&server));

        assert_eq!(
            vec![PlanRequest::Delete("orphan".to_string())],
            plan.requests
        );
    }

    #[test]
    fn locally_removed_entries_count_as_absent_when_diffing() {
        // A file removed locally but still on the server must be deleted
        // there, via the absent-locally rule.
        let local = HashMap::from([("gone".to_string(), md("gone", "", Op::Removed))]);
        let server = HashMap::from([("gone".to_string(), remote("gone", "abc"))]);

        let plan = generate(local, Some(&server));

        assert_eq!(vec![PlanRequest::Delete("gone".to_string())], plan.requests);
    }

    #[test]
    fn empty_snapshots_produce_an_empty_plan() {
        let plan = generate(HashMap::new(), Some(&HashMap::new()));
        assert!(plan.requests.is_empty());
    }
}
