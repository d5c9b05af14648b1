//! Patch accumulation for `Patch`-mode subscribers.

use serde_json::{json, Value};
use tracing::warn;

use super::path::Change;
use super::store::apply_to_tree;

/// Accumulates change records into a nested diff document between sends.
///
/// After a successful send the accumulator is taken and starts empty, so it
/// only ever contains changes since the last acknowledged message.
#[derive(Debug)]
pub struct PatchBuilder {
    root: Value,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self { root: json!({}) }
    }

    pub fn record(&mut self, change: &Change) {
        if let Err(reason) = apply_to_tree(&mut self.root, change) {
            warn!(?change.path, "dropping change from patch: {reason}");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.as_object().map_or(true, |map| map.is_empty())
    }

    /// Take the accumulated diff, leaving the builder empty.
    pub fn take(&mut self) -> Value {
        std::mem::replace(&mut self.root, json!({}))
    }
}

impl Default for PatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a patch document to a client-side snapshot.
///
/// Objects merge recursively; lists resize to the patch length with null
/// elements meaning "unchanged"; everything else replaces. This mirrors how
/// subscribers are expected to consume `Patch`-mode documents.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(slot) => merge_patch(slot, patch_value),
                    None => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (Value::Array(target_list), Value::Array(patch_list)) => {
            target_list.truncate(patch_list.len());
            while target_list.len() < patch_list.len() {
                target_list.push(Value::Null);
            }
            for (slot, patch_value) in target_list.iter_mut().zip(patch_list) {
                if !patch_value.is_null() {
                    merge_patch(slot, patch_value);
                }
            }
        }
        (slot, patch_value) => *slot = patch_value.clone(),
    }
}

/// Union of the subtrees selected by `filters`, positioned as in the source
/// tree. Used for filtered `Full`-mode subscriptions.
pub fn filtered_snapshot(tree: &Value, filters: &[super::path::Filter]) -> Value {
    let mut out = json!({});
    for filter in filters {
        if let Some(piece) = filter_copy(tree, filter.segments()) {
            merge_patch(&mut out, &piece);
        }
    }
    out
}

fn filter_copy(node: &Value, segments: &[super::path::FilterSegment]) -> Option<Value> {
    use super::path::FilterSegment;

    let Some(segment) = segments.first() else {
        return Some(node.clone());
    };
    match segment {
        FilterSegment::Wildcard => Some(node.clone()),
        FilterSegment::Key(key) => {
            let child = node.as_object()?.get(key)?;
            Some(json!({ key.clone(): filter_copy(child, &segments[1..])? }))
        }
        FilterSegment::Array { name, index } => {
            let list = node.as_object()?.get(name)?.as_array()?;
            let copied: Vec<Value> = list
                .iter()
                .enumerate()
                .map(|(position, element)| {
                    let selected = index.map_or(true, |pinned| pinned == position);
                    selected
                        .then(|| filter_copy(element, &segments[1..]))
                        .flatten()
                        .unwrap_or(Value::Null)
                })
                .collect();
            Some(json!({ name.clone(): copied }))
        }
    }
}
