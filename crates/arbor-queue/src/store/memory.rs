//! In-memory implementation of TreeStore for testing
//!
//! Stores the whole tree as one JSON value behind a lock and dispatches watch
//! notifications synchronously with each write, which gives it the strongest
//! version of the delivery contract the core depends on: every distinct prior
//! value produces its own `ChildChanged` notification.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::tree::*;

struct WatchReg {
    id: u64,
    target: WatchTarget,
    event: WatchEvent,
    tx: mpsc::UnboundedSender<WatchNotice>,
}

struct MemState {
    root: Value,
    watches: Vec<WatchReg>,
    next_watch: u64,
    push_seq: u64,
}

/// In-memory implementation of [`TreeStore`]
///
/// This is primarily for testing. All data lives in memory and writes are
/// serialized behind a single lock, so transactions never observe conflicts;
/// the optimistic-concurrency semantics (abort without effect when the update
/// function declines) are identical to a real store.
///
/// Null handling follows the hierarchical-store model: writing `null` deletes
/// a node, null fields inside written objects are pruned, and a node with no
/// remaining children ceases to exist.
pub struct InMemoryTreeStore {
    state: RwLock<MemState>,
}

impl InMemoryTreeStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemState {
                root: Value::Object(Map::new()),
                watches: Vec::new(),
                next_watch: 1,
                push_seq: 0,
            }),
        }
    }

    /// Number of children under `path` (for test assertions)
    pub fn child_count(&self, path: &TreePath) -> usize {
        let state = self.state.read();
        get_at(&state.root, path)
            .and_then(Value::as_object)
            .map_or(0, Map::len)
    }

    /// Clear all data (for testing); watches stay registered
    pub fn clear(&self) {
        let mut state = self.state.write();
        let old = state.root.clone();
        state.root = Value::Object(Map::new());
        dispatch(&state.watches, &old, &state.root);
    }

    fn write(&self, path: &TreePath, value: Option<Value>) {
        let mut state = self.state.write();
        let old = state.root.clone();
        set_at(&mut state.root, path, value);
        dispatch(&state.watches, &old, &state.root);
    }
}

impl Default for InMemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn get_at<'a>(root: &'a Value, path: &TreePath) -> Option<&'a Value> {
    let mut cur = root;
    for segment in path.segments() {
        cur = cur.as_object()?.get(segment)?;
    }
    Some(cur)
}

/// Remove null fields recursively; a value reduced to an empty object is
/// absent.
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        other => Some(other),
    }
}

fn set_at(root: &mut Value, path: &TreePath, value: Option<Value>) {
    let value = value.and_then(prune);
    let segments = path.segments();
    if segments.is_empty() {
        *root = value.unwrap_or_else(|| Value::Object(Map::new()));
        return;
    }

    // Walk down, creating intermediate objects on write
    let (key, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut cur = root;
    for segment in parents {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Some(map) = cur.as_object_mut() else { return };
        cur = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    let Some(map) = cur.as_object_mut() else { return };
    match value {
        Some(v) => {
            map.insert(key.clone(), v);
        }
        None => {
            map.remove(key);
        }
    }
}

/// Children of `path` matching the filter, ordered by key
fn query_members(root: &Value, query: &ChildQuery) -> Vec<(String, Value)> {
    let Some(children) = get_at(root, &query.path).and_then(Value::as_object) else {
        return Vec::new();
    };
    let sorted: BTreeMap<_, _> = children.iter().collect();
    let mut members: Vec<(String, Value)> = sorted
        .into_iter()
        .filter(|(_, child)| {
            let field = child.get(&query.order_by).unwrap_or(&Value::Null);
            *field == query.equal_to
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(limit) = query.limit_to_first {
        members.truncate(limit);
    }
    members
}

/// All children of `path`, ordered by key
fn path_members(root: &Value, path: &TreePath) -> Vec<(String, Value)> {
    let Some(children) = get_at(root, path).and_then(Value::as_object) else {
        return Vec::new();
    };
    let sorted: BTreeMap<_, _> = children.iter().collect();
    sorted
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn target_members(root: &Value, target: &WatchTarget) -> Vec<(String, Value)> {
    match target {
        WatchTarget::Path(path) => path_members(root, path),
        WatchTarget::Query(query) => query_members(root, query),
    }
}

fn dispatch(watches: &[WatchReg], old_root: &Value, new_root: &Value) {
    for reg in watches {
        match reg.event {
            WatchEvent::Value => {
                let WatchTarget::Path(path) = &reg.target else {
                    continue;
                };
                let old = get_at(old_root, path);
                let new = get_at(new_root, path);
                if old != new {
                    let _ = reg.tx.send(WatchNotice {
                        key: path.key().unwrap_or_default().to_string(),
                        value: new.cloned(),
                    });
                }
            }
            WatchEvent::ChildAdded | WatchEvent::ChildRemoved | WatchEvent::ChildChanged => {
                let old_members = target_members(old_root, &reg.target);
                let new_members = target_members(new_root, &reg.target);
                let old_map: BTreeMap<_, _> = old_members.iter().map(|(k, v)| (k, v)).collect();
                let new_map: BTreeMap<_, _> = new_members.iter().map(|(k, v)| (k, v)).collect();

                match reg.event {
                    WatchEvent::ChildAdded => {
                        for (key, value) in &new_members {
                            if !old_map.contains_key(key) {
                                let _ = reg.tx.send(WatchNotice {
                                    key: key.clone(),
                                    value: Some(value.clone()),
                                });
                            }
                        }
                    }
                    WatchEvent::ChildRemoved => {
                        for (key, value) in &old_members {
                            if !new_map.contains_key(key) {
                                let _ = reg.tx.send(WatchNotice {
                                    key: key.clone(),
                                    value: Some(value.clone()),
                                });
                            }
                        }
                    }
                    WatchEvent::ChildChanged => {
                        for (key, value) in &new_members {
                            if old_map.get(key).is_some_and(|old| *old != value) {
                                let _ = reg.tx.send(WatchNotice {
                                    key: key.clone(),
                                    value: Some(value.clone()),
                                });
                            }
                        }
                    }
                    WatchEvent::Value => unreachable!(),
                }
            }
        }
    }
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn get(&self, path: &TreePath) -> Result<Option<Value>, StoreError> {
        let state = self.state.read();
        Ok(get_at(&state.root, path).cloned())
    }

    async fn set(&self, path: &TreePath, value: Value) -> Result<(), StoreError> {
        let mut resolved = value;
        resolve_server_timestamps(&mut resolved, now_ms());
        self.write(path, Some(resolved));
        Ok(())
    }

    async fn push(&self, path: &TreePath, value: Value) -> Result<String, StoreError> {
        let key = {
            let mut state = self.state.write();
            state.push_seq += 1;
            format!("{:012x}{:08x}", now_ms(), state.push_seq)
        };
        let mut resolved = value;
        resolve_server_timestamps(&mut resolved, now_ms());
        self.write(&path.child(key.clone()), Some(resolved));
        Ok(key)
    }

    async fn transaction(
        &self,
        path: &TreePath,
        update: &mut TxnUpdate<'_>,
    ) -> Result<TxnOutcome, StoreError> {
        let mut state = self.state.write();
        let current = get_at(&state.root, path).cloned();

        match update(current.as_ref()) {
            TxnDecision::Abort => Ok(TxnOutcome {
                committed: false,
                snapshot: current,
            }),
            TxnDecision::Set(mut value) => {
                resolve_server_timestamps(&mut value, now_ms());
                let snapshot = prune(value);
                let old = state.root.clone();
                set_at(&mut state.root, path, snapshot.clone());
                dispatch(&state.watches, &old, &state.root);
                Ok(TxnOutcome {
                    committed: true,
                    snapshot,
                })
            }
            TxnDecision::Remove => {
                let old = state.root.clone();
                set_at(&mut state.root, path, None);
                dispatch(&state.watches, &old, &state.root);
                Ok(TxnOutcome {
                    committed: true,
                    snapshot: None,
                })
            }
        }
    }

    async fn query_first(&self, query: &ChildQuery) -> Result<Vec<(String, Value)>, StoreError> {
        let state = self.state.read();
        Ok(query_members(&state.root, query))
    }

    async fn watch(&self, target: WatchTarget, event: WatchEvent) -> Result<Watch, StoreError> {
        if event == WatchEvent::Value && !matches!(target, WatchTarget::Path(_)) {
            return Err(StoreError::Unsupported("value watch on a child query"));
        }

        let (tx, notices) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        let id = state.next_watch;
        state.next_watch += 1;

        // Initial events mirror the live-store contract
        match event {
            WatchEvent::Value => {
                if let WatchTarget::Path(path) = &target {
                    let _ = tx.send(WatchNotice {
                        key: path.key().unwrap_or_default().to_string(),
                        value: get_at(&state.root, path).cloned(),
                    });
                }
            }
            WatchEvent::ChildAdded => {
                for (key, value) in target_members(&state.root, &target) {
                    let _ = tx.send(WatchNotice {
                        key,
                        value: Some(value),
                    });
                }
            }
            WatchEvent::ChildRemoved | WatchEvent::ChildChanged => {}
        }

        state.watches.push(WatchReg {
            id,
            target,
            event,
            tx,
        });
        Ok(Watch {
            handle: WatchHandle(id),
            notices,
        })
    }

    async fn unwatch(&self, handle: WatchHandle) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let before = state.watches.len();
        state.watches.retain(|reg| reg.id != handle.0);
        if state.watches.len() == before {
            return Err(StoreError::UnknownWatch(handle.0));
        }
        Ok(())
    }
}
