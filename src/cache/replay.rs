//! Cold on-disk replay store for recorded provider responses.
//!
//! A content-addressed file tree keyed by the request fingerprint:
//! `<root>/<first two hex chars>/<fingerprint>.json`, each file holding the
//! provider's raw response body. The execute plug consults this store below
//! the HTTP layer when the replay flag is active, so recorded exchanges
//! replay without any network; live responses are saved back for the next
//! run. Responses built from a replay hit carry `metadata.from_cache`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{LlmError, Result};
use crate::telemetry::{Telemetry, TelemetryEvent};

/// Disk store of recorded provider bodies, keyed by request fingerprint.
pub struct ReplayStore {
    root: PathBuf,
    telemetry: Telemetry,
}

impl std::fmt::Debug for ReplayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ReplayStore {
    /// Store rooted at `root` (created lazily on first save).
    pub fn new(root: impl Into<PathBuf>, telemetry: Telemetry) -> Self {
        Self {
            root: root.into(),
            telemetry,
        }
    }

    /// Directory the store writes under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let shard = key.get(..2).unwrap_or("xx");
        self.root.join(shard).join(format!("{key}.json"))
    }

    /// Recorded body for the fingerprint, if any.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let path = self.path_for(key);
        let Ok(raw) = fs::read(&path) else {
            self.telemetry.emit(TelemetryEvent::TestCacheMiss {
                key: key.to_string(),
            });
            return None;
        };
        match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => {
                self.telemetry.emit(TelemetryEvent::TestCacheHit {
                    key: key.to_string(),
                    size_bytes: raw.len(),
                });
                Some(value)
            }
            Err(err) => {
                tracing::warn!(?path, %err, "unreadable replay entry; treating as miss");
                self.telemetry.emit(TelemetryEvent::TestCacheMiss {
                    key: key.to_string(),
                });
                None
            }
        }
    }

    /// Record a live body for future replays.
    pub fn save(&self, key: &str, body: &Value) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LlmError::Other(format!("replay store mkdir failed: {e}")))?;
        }
        let pretty = serde_json::to_vec_pretty(body)?;
        let mut file = fs::File::create(&path)
            .map_err(|e| LlmError::Other(format!("replay store write failed: {e}")))?;
        file.write_all(&pretty)
            .map_err(|e| LlmError::Other(format!("replay store write failed: {e}")))?;
        self.telemetry.emit(TelemetryEvent::TestCacheSave {
            key: key.to_string(),
            size_bytes: pretty.len(),
        });
        Ok(())
    }

    /// Remove one recorded entry.
    pub fn remove(&self, key: &str) {
        let _ = fs::remove_file(self.path_for(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{EventHandler, FnEventHandler};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn store_with_events() -> (ReplayStore, Arc<Mutex<Vec<String>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_in = events.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(FnEventHandler(move |event: &_| {
            events_in.lock().push(TelemetryEvent::name(event).to_string());
        }));
        let store = ReplayStore::new(dir.path(), Telemetry::with_handler(handler));
        (store, events, dir)
    }

    #[test]
    fn test_save_then_lookup_round_trip() {
        let (store, events, _dir) = store_with_events();
        let body = json!({"choices": [{"message": {"content": "Hello there!"}}]});

        assert!(store.lookup("abcd1234").is_none());
        store.save("abcd1234", &body).unwrap();
        let replayed = store.lookup("abcd1234").expect("recorded body");
        assert_eq!(replayed, body);

        let events = events.lock().clone();
        assert_eq!(
            events,
            vec!["test_cache.miss", "test_cache.save", "test_cache.hit"]
        );
    }

    #[test]
    fn test_sharded_layout() {
        let (store, _events, dir) = store_with_events();
        store.save("abcdef", &json!({})).unwrap();
        assert!(dir.path().join("ab").join("abcdef.json").exists());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let (store, _events, dir) = store_with_events();
        let shard = dir.path().join("ff");
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join("ffff.json"), b"{not json").unwrap();
        assert!(store.lookup("ffff").is_none());
    }

    #[test]
    fn test_remove() {
        let (store, _events, _dir) = store_with_events();
        store.save("deadbeef", &json!({"x": 1})).unwrap();
        store.remove("deadbeef");
        assert!(store.lookup("deadbeef").is_none());
    }
}
