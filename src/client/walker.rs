//! Baseline scan of the sync root.
//!
//! Directories are registered with the watcher as they are discovered, and
//! every regular file produces a synthetic create record on the scan log.
//! When the traversal finishes the watcher's stage counter is bumped so live
//! events recorded afterwards are distinguishable from the baseline.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::client::is_ignored_name;
use crate::client::ops::FileOp;
use crate::client::watcher::Watcher;
use crate::wal::Wal;

pub async fn walk(root: &Path, watcher: &Watcher, wal: &Wal) -> Result<()> {
    info!(root = %root.display(), "walking directory");

    let mut stack = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = stack.pop_back() {
        watcher.watch(&dir)?;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read dir {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await.context("next dir entry")? {
            let path = entry.path();
            if is_ignored_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let meta = tokio::fs::symlink_metadata(&path)
                .await
                .with_context(|| format!("stat {}", path.display()))?;
            if meta.is_symlink() {
                continue;
            }
            if meta.is_dir() {
                stack.push_back(path);
                continue;
            }
            if !meta.is_file() {
                // sockets, fifos and friends are not mirrored
                continue;
            }

            let rel = path
                .strip_prefix(root)
                .context("entry outside the scan root")?
                .to_string_lossy()
                .replace('\\', "/");
            let op = FileOp::baseline(rel);
            let bytes = serde_json::to_vec(&op).context("marshal baseline record")?;
            wal.append(&bytes)
                .await
                .context("append baseline record to wal")?;
            debug!(path = %op.path, "file picked up by baseline scan");
        }
    }

    watcher.inc_stage_num();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::client::ops::Op;

    async fn scan(root: &Path) -> (Vec<FileOp>, u64) {
        let wal_dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(Wal::open(wal_dir.path().join("scan.wal")).await.unwrap());
        let watcher = Watcher::new(root.to_path_buf(), wal.clone()).unwrap();

        walk(root, &watcher, &wal).await.unwrap();
        wal.close();

        let cancel = CancellationToken::new();
        let mut ops = Vec::new();
        while let Some(entry) = wal.next(&cancel).await.unwrap() {
            ops.push(serde_json::from_slice::<FileOp>(&entry.bytes).unwrap());
        }
        (ops, watcher.stage_num())
    }

    #[tokio::test]
    async fn emits_a_baseline_create_per_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/b")).await.unwrap();
        tokio::fs::write(dir.path().join("top.txt"), b"1").await.unwrap();
        tokio::fs::write(dir.path().join("a/b/deep.txt"), b"2").await.unwrap();

        let (ops, stage) = scan(dir.path()).await;

        let mut paths: Vec<String> = ops.iter().map(|op| op.path.clone()).collect();
        paths.sort();
        assert_eq!(vec!["a/b/deep.txt".to_string(), "top.txt".to_string()], paths);
        assert!(ops.iter().all(|op| op.op == Op::Created));
        assert!(ops.iter().all(|op| op.timestamp.timestamp() == 0));
        assert!(ops.iter().all(|op| op.stage == 0));
        assert_eq!(1, stage);
    }

    #[tokio::test]
    async fn skips_hidden_and_temp_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join(".git")).await.unwrap();
        tokio::fs::write(dir.path().join(".git/config"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join(".hidden"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("draft.txt~"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("visible.txt"), b"x").await.unwrap();

        let (ops, _) = scan(dir.path()).await;

        let paths: Vec<&str> = ops.iter().map(|op| op.path.as_str()).collect();
        assert_eq!(vec!["visible.txt"], paths);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("real.txt"), b"x").await.unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link"))
            .unwrap();

        let (ops, _) = scan(dir.path()).await;

        let paths: Vec<&str> = ops.iter().map(|op| op.path.as_str()).collect();
        assert_eq!(vec!["real.txt"], paths);
    }

    #[tokio::test]
    async fn empty_tree_emits_nothing_but_still_advances_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (ops, stage) = scan(dir.path()).await;
        assert!(ops.is_empty());
        assert_eq!(1, stage);
    }
}
