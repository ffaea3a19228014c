//! Client side: observe the local tree, index it, reconcile with the server.

pub mod indexer;
pub mod ops;
pub mod planner;
pub mod rest;
pub mod syncer;
pub mod walker;
pub mod watcher;

/// Names the sync deliberately ignores: dotfiles and editor temp files.
pub(crate) fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with('~')
}
