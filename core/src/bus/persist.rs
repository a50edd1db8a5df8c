//! Disk persistence for bus events.
//!
//! Layout: one pretty-printed JSON file per event, `<dir>/<type>/<id>.json`.
//! Writes propagate errors (a synchronous emit must not silently lose the
//! event); loading skips unreadable files with a warning so a corrupt entry
//! cannot block startup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::BusError;

use super::Event;

pub(super) fn write_event(dir: &Path, event: &Event) -> Result<(), BusError> {
    let type_dir = dir.join(&event.event_type);
    fs::create_dir_all(&type_dir)?;
    let path = type_dir.join(format!("{}.json", event.id));
    let json = serde_json::to_string_pretty(event)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load every persisted event, grouped by type and sorted by timestamp.
pub(super) fn load_events(dir: &Path) -> HashMap<String, Vec<Event>> {
    let mut store: HashMap<String, Vec<Event>> = HashMap::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "cannot read event storage directory");
            return store;
        }
    };

    for entry in entries.flatten() {
        let type_dir = entry.path();
        if !type_dir.is_dir() {
            continue;
        }
        for file in list_json_files(&type_dir) {
            match read_event(&file) {
                Ok(event) => store.entry(event.event_type.clone()).or_default().push(event),
                Err(err) => {
                    warn!(file = %file.display(), %err, "skipping unreadable event file");
                }
            }
        }
    }

    for events in store.values_mut() {
        events.sort_by_key(|e| e.timestamp);
    }

    store
}

/// Remove all persisted events, keeping the directory itself.
pub(super) fn clear_dir(dir: &Path) -> Result<(), BusError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                files.push(path);
            }
        }
    }
    files
}

fn read_event(path: &Path) -> Result<Event, BusError> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(id: &str, event_type: &str) -> Event {
        Event {
            id: id.into(),
            event_type: event_type.into(),
            payload: json!({"n": 1}),
            timestamp: Utc::now(),
            correlation_id: None,
            source_id: None,
            metadata: None,
        }
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        write_event(dir.path(), &event("1-1", "task:created")).unwrap();
        write_event(dir.path(), &event("1-2", "task:created")).unwrap();
        write_event(dir.path(), &event("1-3", "task:done")).unwrap();

        let store = load_events(dir.path());
        assert_eq!(store.get("task:created").map(Vec::len), Some(2));
        assert_eq!(store.get("task:done").map(Vec::len), Some(1));
    }

    #[test]
    fn corrupt_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_event(dir.path(), &event("1-1", "task:created")).unwrap();
        let bad = dir.path().join("task:created").join("bad.json");
        fs::write(bad, "{not json").unwrap();

        let store = load_events(dir.path());
        assert_eq!(store.get("task:created").map(Vec::len), Some(1));
    }

    #[test]
    fn clear_empties_directory() {
        let dir = TempDir::new().unwrap();
        write_event(dir.path(), &event("1-1", "task:created")).unwrap();
        clear_dir(dir.path()).unwrap();
        assert!(load_events(dir.path()).is_empty());
    }
}
