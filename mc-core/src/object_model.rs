//! # OBJECT MODEL STORE
//!
//! A single reader-writer-guarded document (component C6), mirrored from
//! firmware state. Ingress (the Packet Router) is the only writer; every
//! other component and every IPC client is a reader.
//!
//! Patch semantics follow JSON Merge Patch (RFC 7396) with two
//! extensions: an object key that parses as a non-negative integer
//! addresses an array element by index, and a `null` value removes the
//! addressed key/index rather than setting it to `null`.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Revision(pub u64);

/// What a subscriber receives on a change notification: the full
/// document (first subscription, or after a firmware reset) or a
/// structural delta (the patch as applied).
#[derive(Clone, Debug)]
pub enum Update {
  Full(Value),
  Delta(Value),
}

struct Subscriber {
  sender: std::sync::mpsc::Sender<Update>,
}

pub struct ObjectModelStore {
  document: RwLock<Value>,
  revision: std::sync::atomic::AtomicU64,
  subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for ObjectModelStore {
  fn default() -> Self {
    Self::new()
  }
}

impl ObjectModelStore {
  pub fn new() -> Self {
    Self {
      document: RwLock::new(Value::Object(serde_json::Map::new())),
      revision: std::sync::atomic::AtomicU64::new(0),
      subscribers: Mutex::new(Vec::new()),
    }
  }

  pub fn revision(&self) -> Revision {
    Revision(self.revision.load(std::sync::atomic::Ordering::Acquire))
  }

  /// Many concurrent holders; returns a clone of the current document, so
  /// a reader never blocks a concurrent writer and never observes a
  /// torn intermediate state.
  pub fn read(&self) -> Value {
    self.document.read().unwrap().clone()
  }

  /// Reads the value at `path` (a `/`-separated JSON Pointer), or `None`
  /// if no such path exists.
  pub fn read_path(&self, path: &str) -> Option<Value> {
    let document = self.document.read().unwrap();
    document.pointer(path).cloned()
  }

  /// Registers a subscriber; it immediately receives the full document,
  /// then a `Delta` on every subsequent `apply_patch`.
  pub fn subscribe(&self) -> std::sync::mpsc::Receiver<Update> {
    let (sender, receiver) = std::sync::mpsc::channel();
    let snapshot = self.read();
    let _ = sender.send(Update::Full(snapshot));
    self.subscribers.lock().unwrap().push(Subscriber { sender });
    receiver
  }

  /// Applies a JSON Merge Patch at `path`, with the array-index and
  /// null-deletes-key extensions. Bumps the revision and notifies
  /// subscribers with the patch as a `Delta`, even when `path` is the
  /// document root.
  pub fn apply_patch(&self, path: &str, value: Value) {
    {
      let mut document = self.document.write().unwrap();
      let target = navigate_to_parent(&mut document, path);
      merge_patch(target, value.clone());
    }
    self.revision.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    self.notify(Update::Delta(serde_json::json!({ "path": path, "value": value })));
  }

  fn notify(&self, update: Update) {
    let mut subscribers = self.subscribers.lock().unwrap();
    subscribers.retain(|subscriber| subscriber.sender.send(update.clone()).is_ok());
  }

  /// Replaces the whole document (a firmware reset) and notifies every
  /// subscriber with the new `Full` snapshot.
  pub fn reset(&self, document: Value) {
    *self.document.write().unwrap() = document.clone();
    self.revision.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    self.notify(Update::Full(document));
  }
}

/// Navigates `root` to the JSON value addressed by a (possibly empty)
/// `/`-separated path, creating intermediate objects as needed, and
/// returns a mutable reference to it. An empty path returns `root`
/// itself.
fn navigate_to_parent<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
  let mut current = root;
  for segment in path.split('/').filter(|s| !s.is_empty()) {
    if current.is_object() && current.get(segment).is_none() {
      current.as_object_mut().unwrap().insert(segment.to_string(), Value::Object(serde_json::Map::new()));
    }
    current = index_into(current, segment);
  }
  current
}

fn index_into<'a>(value: &'a mut Value, segment: &str) -> &'a mut Value {
  if let Ok(index) = segment.parse::<usize>() {
    if value.is_array() {
      let arr = value.as_array_mut().unwrap();
      while arr.len() <= index {
        arr.push(Value::Null);
      }
      return &mut arr[index];
    }
  }
  value.as_object_mut().unwrap().entry(segment.to_string()).or_insert(Value::Null)
}

/// Applies RFC 7396 JSON Merge Patch semantics to `target`, with the
/// array-index and null-deletes extensions described in the module docs.
fn merge_patch(target: &mut Value, patch: Value) {
  match (target.is_object() || target.is_array(), &patch) {
    (true, Value::Object(patch_map)) => {
      for (key, patch_value) in patch_map {
        if patch_value.is_null() {
          remove_key(target, key);
          continue;
        }
        let slot = index_into(target, key);
        if slot.is_object() && patch_value.is_object() {
          merge_patch(slot, patch_value.clone());
        } else {
          *slot = patch_value.clone();
        }
      }
    }
    _ => *target = patch,
  }
}

fn remove_key(target: &mut Value, key: &str) {
  if let Ok(index) = key.parse::<usize>() {
    if let Some(arr) = target.as_array_mut() {
      if index < arr.len() {
        arr.remove(index);
      }
      return;
    }
  }
  if let Some(obj) = target.as_object_mut() {
    obj.remove(key);
  }
}

pub type SharedObjectModel = Arc<ObjectModelStore>;

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn apply_patch_sets_a_new_key() {
    let store = ObjectModelStore::new();
    store.apply_patch("", json!({ "state": { "status": "idle" } }));
    assert_eq!(store.read_path("/state/status"), Some(json!("idle")));
  }

  #[test]
  fn apply_patch_merges_rather_than_replaces_siblings() {
    let store = ObjectModelStore::new();
    store.apply_patch("", json!({ "state": { "status": "idle", "temp": 20 } }));
    store.apply_patch("", json!({ "state": { "status": "busy" } }));
    assert_eq!(store.read_path("/state/status"), Some(json!("busy")));
    assert_eq!(store.read_path("/state/temp"), Some(json!(20)));
  }

  #[test]
  fn null_value_deletes_the_key() {
    let store = ObjectModelStore::new();
    store.apply_patch("", json!({ "state": { "status": "idle" } }));
    store.apply_patch("", json!({ "state": { "status": null } }));
    assert_eq!(store.read_path("/state/status"), None);
  }

  #[test]
  fn array_elements_addressed_by_integer_index() {
    let store = ObjectModelStore::new();
    store.apply_patch("", json!({ "tools": [{ "temp": 0 }, { "temp": 0 }] }));
    store.apply_patch("/tools", json!({ "1": { "temp": 200 } }));
    assert_eq!(store.read_path("/tools/1/temp"), Some(json!(200)));
    assert_eq!(store.read_path("/tools/0/temp"), Some(json!(0)));
  }

  #[test]
  fn revision_is_monotone_across_patches() {
    let store = ObjectModelStore::new();
    let before = store.revision();
    store.apply_patch("", json!({ "a": 1 }));
    let after = store.revision();
    assert!(after > before);
  }

  #[test]
  fn applying_the_same_patch_twice_is_idempotent() {
    let store = ObjectModelStore::new();
    store.apply_patch("", json!({ "a": { "b": 1 } }));
    let first = store.read();
    store.apply_patch("", json!({ "a": { "b": 1 } }));
    let second = store.read();
    assert_eq!(first, second);
  }

  #[test]
  fn subscriber_receives_full_snapshot_then_deltas() {
    let store = ObjectModelStore::new();
    let receiver = store.subscribe();
    assert!(matches!(receiver.recv().unwrap(), Update::Full(_)));
    store.apply_patch("", json!({ "a": 1 }));
    assert!(matches!(receiver.recv().unwrap(), Update::Delta(_)));
  }
}
