//! Durable on-disk queues for events and state snapshots.
//!
//! Each queue is a whole-file JSON list rewritten on every mutation via
//! the atomic-write discipline in [`crate::fs_safe`]. That is deliberate:
//! expected sizes are small (hundreds of entries) and every successful
//! delivery drains the queue, so an append-log structure would buy
//! nothing. A missing or zero-byte file reads as empty; a malformed file
//! fails the operation rather than silently truncating.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::{DeviceState, Event};
use crate::fs_safe::{self, FsError};

/// Durable queue of events awaiting delivery.
pub type EventQueue = DurableQueue<Event>;

/// Durable queue of state snapshots awaiting delivery.
pub type StateQueue = DurableQueue<DeviceState>;

/// Errors from durable-queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing file could not be read or written.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The backing file exists but does not decode.
    #[error("decode queue {path}: {source}")]
    Decode {
        /// Path of the malformed file.
        path: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// A mutex-serialized queue persisted as one JSON file.
///
/// Callers observe linearizable ordering: `load` after `append` always
/// includes the appended items, and insertion order is preserved across
/// process restarts.
#[derive(Debug)]
pub struct DurableQueue<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<T>,
}

impl<T> DurableQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a queue backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all queued items in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the file cannot be read or decoded.
    pub fn load(&self) -> Result<Vec<T>, QueueError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.read_locked()
    }

    /// Appends items to the tail of the queue and persists the result.
    ///
    /// An empty iterator is a no-op and touches nothing on disk.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the existing file cannot be decoded or
    /// the new contents cannot be written.
    pub fn append(&self, items: impl IntoIterator<Item = T>) -> Result<(), QueueError> {
        let mut items = items.into_iter().peekable();
        if items.peek().is_none() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut existing = self.read_locked()?;
        existing.extend(items);
        self.write_locked(&existing)
    }

    /// Replaces the whole queue with the given items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the new contents cannot be written.
    pub fn replace(&self, items: &[T]) -> Result<(), QueueError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.write_locked(items)
    }

    fn read_locked(&self) -> Result<Vec<T>, QueueError> {
        let Some(data) = fs_safe::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        if data.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data).map_err(|source| QueueError::Decode {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write_locked(&self, items: &[T]) -> Result<(), QueueError> {
        fs_safe::atomic_write_json(&self.path, &items)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, serde_json::json!({}))
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queue: EventQueue = DurableQueue::new(dir.path().join("events.json"));
        assert!(queue.load().unwrap().is_empty());
    }

    #[test]
    fn zero_byte_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, b"").unwrap();

        let queue: EventQueue = DurableQueue::new(&path);
        assert!(queue.load().unwrap().is_empty());
    }

    #[test]
    fn malformed_file_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let queue: EventQueue = DurableQueue::new(&path);
        assert!(matches!(
            queue.load().unwrap_err(),
            QueueError::Decode { .. }
        ));
    }

    #[test]
    fn append_preserves_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let queue: EventQueue = DurableQueue::new(dir.path().join("events.json"));

        queue.append([event("a.one"), event("a.two")]).unwrap();
        queue.append([event("a.three")]).unwrap();

        let items = queue.load().unwrap();
        let types: Vec<&str> = items.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["a.one", "a.two", "a.three"]);
    }

    #[test]
    fn empty_append_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let queue: EventQueue = DurableQueue::new(&path);

        queue.append(std::iter::empty()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn order_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        {
            let queue: EventQueue = DurableQueue::new(&path);
            queue.append([event("first"), event("second")]).unwrap();
        }

        let reopened: EventQueue = DurableQueue::new(&path);
        let items = reopened.load().unwrap();
        assert_eq!(items[0].event_type, "first");
        assert_eq!(items[1].event_type, "second");
    }

    #[test]
    fn replace_drains_head_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue: StateQueue = DurableQueue::new(dir.path().join("state.json"));

        let a = DeviceState {
            update_status: "idle".to_string(),
            ..DeviceState::default()
        };
        let b = DeviceState {
            update_status: "reboot_required".to_string(),
            ..DeviceState::default()
        };

        queue.append([a, b]).unwrap();
        let pending = queue.load().unwrap();
        queue.replace(&pending[1..]).unwrap();

        let remaining = queue.load().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].update_status, "reboot_required");
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let queue: std::sync::Arc<EventQueue> =
            std::sync::Arc::new(DurableQueue::new(dir.path().join("events.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = std::sync::Arc::clone(&queue);
                std::thread::spawn(move || {
                    queue.append([event(&format!("thread.{i}"))]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.load().unwrap().len(), 8);
    }
}
