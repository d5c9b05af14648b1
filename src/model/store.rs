//! Live object-model store.
//!
//! A read/write-locked JSON tree with a monotonic update counter. Mutations
//! go through a [`WriteAccess`] guard; when the guard drops, the commit bumps
//! the counter, wakes `wait_for_update` callers, and broadcasts the change
//! records to subscribers. Slow subscribers overflow the bounded broadcast
//! buffer and must resynchronize with a full snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Notify, RwLock, RwLockReadGuard};
use tracing::warn;

use super::path::{Change, ChangeKind, PathSegment};

/// Per-subscriber buffer of pending change records.
const CHANGE_BUFFER: usize = 256;

/// Object-model module keys, indexed by the id used in `GetObjectModel`
/// polls and firmware `ObjectModel` pushes.
pub const MODULE_KEYS: [&str; 8] = [
    "boards",
    "directories",
    "fans",
    "heat",
    "job",
    "move",
    "network",
    "state",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}

/// One entry of the model's growing `messages` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub severity: MessageSeverity,
    pub content: String,
}

impl Message {
    pub fn new(severity: MessageSeverity, content: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            severity,
            content: content.into(),
        }
    }
}

#[derive(Clone)]
pub struct ModelStore {
    inner: Arc<Inner>,
}

struct Inner {
    tree: RwLock<Value>,
    version: AtomicU64,
    updated: Notify,
    changes: broadcast::Sender<Change>,
}

impl ModelStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(seed_tree()),
                version: AtomicU64::new(0),
                updated: Notify::new(),
                changes,
            }),
        }
    }

    /// Shared read access; the snapshot stays consistent for the guard's
    /// lifetime.
    pub async fn access_read_only(&self) -> RwLockReadGuard<'_, Value> {
        self.inner.tree.read().await
    }

    /// Exclusive write access. Changes applied through the guard are
    /// committed (counter, notification, broadcast) when it drops.
    pub async fn access_read_write(&self) -> WriteAccess<'_> {
        WriteAccess {
            guard: Some(self.inner.tree.write().await),
            store: &self.inner,
            changes: Vec::new(),
        }
    }

    /// Clone of the current tree.
    pub async fn get(&self) -> Value {
        self.inner.tree.read().await.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Wait until the model version exceeds `since`; returns the new
    /// version. Callers bound this with `tokio::time::timeout`.
    pub async fn wait_for_update(&self, since: u64) -> u64 {
        loop {
            let notified = self.inner.updated.notified();
            let version = self.version();
            if version > since {
                return version;
            }
            notified.await;
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.inner.changes.subscribe()
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WriteAccess<'a> {
    guard: Option<tokio::sync::RwLockWriteGuard<'a, Value>>,
    store: &'a Inner,
    changes: Vec<Change>,
}

impl WriteAccess<'_> {
    fn tree(&mut self) -> &mut Value {
        self.guard.as_mut().expect("write guard taken")
    }

    /// Set a property at `path`, recording a `Property` change.
    pub fn set(&mut self, path: Vec<PathSegment>, value: Value) {
        self.apply(Change {
            kind: ChangeKind::Property,
            path,
            value,
        });
    }

    /// Replace an object collection at `path` (the final item node carries
    /// the new list size).
    pub fn set_collection(&mut self, path: Vec<PathSegment>, value: Value) {
        self.apply(Change {
            kind: ChangeKind::ObjectCollection,
            path,
            value,
        });
    }

    /// Append items to the growing collection at `path`; `Value::Null`
    /// clears it.
    pub fn append(&mut self, path: Vec<PathSegment>, items: Value) {
        self.apply(Change {
            kind: ChangeKind::GrowingCollection,
            path,
            value: items,
        });
    }

    /// Replace a whole object-model module from a firmware push.
    pub fn merge_module(&mut self, module: u8, value: Value) {
        let Some(key) = MODULE_KEYS.get(module as usize) else {
            warn!(module, "ignoring object model push for unknown module");
            return;
        };
        self.set(vec![PathSegment::key(*key)], value);
    }

    /// Append a message to the model's message log.
    pub fn add_message(&mut self, message: Message) {
        let value = serde_json::to_value(&message).unwrap_or(Value::Null);
        self.append(vec![PathSegment::key("messages")], json!([value]));
    }

    fn apply(&mut self, change: Change) {
        match apply_to_tree(self.tree(), &change) {
            Ok(()) => self.changes.push(change),
            Err(reason) => {
                // A bad diff must never take the store down.
                warn!(?change.path, "dropping inconsistent model update: {reason}");
            }
        }
    }
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        // Release the lock before waking readers.
        drop(self.guard.take());
        if self.changes.is_empty() {
            return;
        }
        self.store.version.fetch_add(1, Ordering::AcqRel);
        self.store.updated.notify_waiters();
        for change in self.changes.drain(..) {
            // Send fails only when nobody subscribes, which is fine.
            let _ = self.store.changes.send(change);
        }
    }
}

/// Walk `path` inside `tree`, materializing intermediate nodes, and apply
/// the change value at the target. Shared between the live tree and the
/// per-subscriber patch accumulators.
pub(crate) fn apply_to_tree(tree: &mut Value, change: &Change) -> Result<(), String> {
    if change.path.is_empty() {
        *tree = change.value.clone();
        return Ok(());
    }

    let mut node = tree;
    for (position, segment) in change.path.iter().enumerate() {
        let last = position == change.path.len() - 1;
        match segment {
            PathSegment::Key(key) => {
                let map = as_object(node, key)?;
                if last {
                    return finish(map, key, change);
                }
                node = map.entry(key.clone()).or_insert_with(|| json!({}));
            }
            PathSegment::Item { array, index, size } => {
                let map = as_object(node, array)?;
                let slot = map.entry(array.clone()).or_insert_with(|| json!([]));
                let Value::Array(list) = slot else {
                    return Err(format!("'{array}' is not a list"));
                };
                resize(list, *size);
                if *index >= list.len() {
                    return Err(format!("index {index} out of range for '{array}'"));
                }
                if last {
                    list[*index] = change.value.clone();
                    return Ok(());
                }
                if list[*index].is_null() {
                    list[*index] = json!({});
                }
                node = &mut list[*index];
            }
        }
    }
    Ok(())
}

fn finish(map: &mut Map<String, Value>, key: &str, change: &Change) -> Result<(), String> {
    match change.kind {
        ChangeKind::Property | ChangeKind::ObjectCollection => {
            map.insert(key.to_string(), change.value.clone());
            Ok(())
        }
        ChangeKind::GrowingCollection => {
            let slot = map.entry(key.to_string()).or_insert_with(|| json!([]));
            if change.value.is_null() {
                *slot = json!([]);
                return Ok(());
            }
            let Value::Array(appended) = &change.value else {
                return Err(format!("growing collection '{key}' diff is not a list"));
            };
            let Value::Array(list) = slot else {
                return Err(format!("growing collection '{key}' target is not a list"));
            };
            list.extend(appended.iter().cloned());
            Ok(())
        }
    }
}

fn as_object<'a>(node: &'a mut Value, key: &str) -> Result<&'a mut Map<String, Value>, String> {
    match node {
        Value::Object(map) => Ok(map),
        _ => Err(format!("parent of '{key}' is not an object")),
    }
}

/// Shrink by truncation, grow by appending nulls.
fn resize(list: &mut Vec<Value>, size: usize) {
    if list.len() > size {
        list.truncate(size);
    } else {
        while list.len() < size {
            list.push(Value::Null);
        }
    }
}

fn seed_tree() -> Value {
    json!({
        "boards": [],
        "directories": {},
        "fans": [],
        "heat": {},
        "job": { "file": null, "filePosition": null, "layers": [] },
        "messages": [],
        "move": {},
        "network": { "hostname": null, "interfaces": [] },
        "state": { "status": "starting", "time": null },
        "volumes": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_read_back() {
        let store = ModelStore::new();
        {
            let mut access = store.access_read_write().await;
            access.set(
                vec![PathSegment::key("state"), PathSegment::key("status")],
                json!("idle"),
            );
        }
        let tree = store.access_read_only().await;
        assert_eq!(tree["state"]["status"], json!("idle"));
    }

    #[tokio::test]
    async fn commit_bumps_version_and_notifies() {
        let store = ModelStore::new();
        let version = store.version();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_update(version).await })
        };
        tokio::task::yield_now().await;
        {
            let mut access = store.access_read_write().await;
            access.set(vec![PathSegment::key("state"), PathSegment::key("status")], json!("busy"));
        }
        let new_version = waiter.await.unwrap();
        assert!(new_version > version);
    }

    #[tokio::test]
    async fn empty_commit_does_not_bump_version() {
        let store = ModelStore::new();
        let version = store.version();
        {
            let _access = store.access_read_write().await;
        }
        assert_eq!(store.version(), version);
    }

    #[tokio::test]
    async fn item_paths_materialize_lists() {
        let store = ModelStore::new();
        {
            let mut access = store.access_read_write().await;
            access.set(
                vec![
                    PathSegment::key("network"),
                    PathSegment::item("interfaces", 1, 2),
                    PathSegment::key("speed"),
                ],
                json!(1000),
            );
        }
        let tree = store.get().await;
        assert_eq!(tree["network"]["interfaces"][0], Value::Null);
        assert_eq!(tree["network"]["interfaces"][1]["speed"], json!(1000));
    }

    #[tokio::test]
    async fn growing_collection_appends_and_clears() {
        let store = ModelStore::new();
        {
            let mut access = store.access_read_write().await;
            access.add_message(Message::new(MessageSeverity::Info, "hello"));
            access.add_message(Message::new(MessageSeverity::Error, "boom"));
        }
        let tree = store.get().await;
        assert_eq!(tree["messages"].as_array().unwrap().len(), 2);

        {
            let mut access = store.access_read_write().await;
            access.append(vec![PathSegment::key("messages")], Value::Null);
        }
        let tree = store.get().await;
        assert!(tree["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inconsistent_update_is_dropped_not_fatal() {
        let store = ModelStore::new();
        {
            let mut access = store.access_read_write().await;
            // "state" is an object; treating it as a growing collection is a
            // bad diff and must be dropped.
            access.append(vec![PathSegment::key("state")], json!([1]));
        }
        let tree = store.get().await;
        assert!(tree["state"].is_object());
    }

    #[tokio::test]
    async fn changes_are_broadcast() {
        let store = ModelStore::new();
        let mut rx = store.subscribe_changes();
        {
            let mut access = store.access_read_write().await;
            access.set(vec![PathSegment::key("state"), PathSegment::key("status")], json!("idle"));
        }
        let change = rx.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Property);
        assert_eq!(change.value, json!("idle"));
    }
}
