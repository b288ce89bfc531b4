//! Persisted event store, one JSON object per line.
//!
//! The event bus carries a HIGH-priority subscriber that appends every
//! published event here, tagged with the aggregate it concerns. The
//! store is the durable half of the at-least-once contract: handlers
//! may fail, but the event itself is never lost.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use nw_domain::Result;
use nw_events::Event;

/// An event as written to disk, with derived aggregate coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: Event,
    pub aggregate_type: String,
    #[serde(default)]
    pub aggregate_id: Option<String>,
}

impl StoredEvent {
    /// Derive aggregate coordinates from the event type and payload.
    pub fn from_event(event: &Event) -> Self {
        let (aggregate_type, id_key) = match event.event_type.as_str() {
            t if t.starts_with("Node") => ("node", "node_id"),
            t if t.starts_with("Client") => ("client", "client_id"),
            t if t.starts_with("User") || t.starts_with("Member") => ("user", "user_id"),
            t if t.starts_with("Group") => ("group", "group_id"),
            t if t.starts_with("Policy") => ("policy", "policy_id"),
            t if t.starts_with("IP") => ("ip_pool", "ip"),
            t if t.starts_with("Peer") => ("hub", "public_key"),
            t if t.starts_with("Config") => ("config", "version"),
            t if t.starts_with("Integrity") || t.starts_with("Trust") => ("node", "node_id"),
            _ => ("system", ""),
        };
        let aggregate_id = event
            .payload
            .get(id_key)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        StoredEvent {
            event: event.clone(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
        }
    }
}

/// JSONL-backed event store.
pub struct EventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path)?;
        Ok(EventStore {
            path: state_path.join("events.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    pub fn append(&self, event: &Event) -> Result<()> {
        let stored = StoredEvent::from_event(event);
        let line = serde_json::to_string(&stored)?;
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// The most recent `limit` events, oldest first, optionally filtered
    /// by event type.
    pub fn recent(&self, event_type: Option<&str>, limit: usize) -> Result<Vec<StoredEvent>> {
        let _guard = self.write_lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let events: Vec<StoredEvent> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<StoredEvent>(line).ok())
            .filter(|s| event_type.map_or(true, |t| s.event.event_type == t))
            .collect();
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }
}
