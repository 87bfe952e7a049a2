//! Store adapter layer
//!
//! This module provides:
//! - [`TreeStore`] trait for the shared hierarchical store
//! - [`InMemoryTreeStore`] for testing
//!
//! Production deployments implement [`TreeStore`] against the real store
//! client; the queue core never talks to anything else.

mod memory;
mod tree;

pub use memory::InMemoryTreeStore;
pub use tree::{
    is_server_timestamp, resolve_server_timestamps, server_timestamp, ChildQuery, StoreError,
    TreePath, TreeStore, TxnDecision, TxnOutcome, TxnUpdate, Watch, WatchEvent, WatchHandle,
    WatchNotice, WatchTarget,
};
