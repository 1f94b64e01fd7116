//! The cross-process half of the event bus (§4.2): a writer that drops one
//! file per event into `<dataPath>/events/`, and a watcher that drains
//! existing files on startup then follows filesystem create notifications,
//! built on the `notify::RecommendedWatcher` + `mpsc` forwarding idiom.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::types::{Event, EventFilePayload};

/// Write one event file into the drop directory (§4.2).
pub struct DropDirWriter {
    dir: PathBuf,
}

impl DropDirWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Serialize and write one event. Best-effort: a write failure is logged,
    /// never propagated, since drop-directory delivery is inherently lossy.
    pub fn write(&self, event: &Event) {
        let payload = EventFilePayload::from(event);
        let path = self.dir.join(event.drop_filename());
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&path, bytes) {
                    warn!(?path, %err, "failed to write drop-directory event file");
                }
            }
            Err(err) => warn!(%err, "failed to serialize drop-directory event"),
        }
    }
}

/// Read every `*.event` file currently in `dir`, in filename order, parsing
/// and deleting each as it's read. A file vanishing between scan and read
/// (lost the delete race to another reader) is non-fatal (§4.2).
pub fn drain(dir: &Path) -> Result<Vec<EventFilePayload>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|ext| ext == "event").unwrap_or(false))
        .collect();
    names.sort();

    let mut out = Vec::new();
    for path in names {
        match read_and_remove(&path) {
            Ok(Some(payload)) => out.push(payload),
            Ok(None) => {} // lost the delete race to another reader
            Err(err) => warn!(?path, %err, "failed to read drop-directory event file"),
        }
    }
    Ok(out)
}

fn read_and_remove(path: &Path) -> Result<Option<EventFilePayload>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let payload: EventFilePayload = serde_json::from_slice(&bytes)?;
    // A missing file at delete time means another reader already won the race;
    // the payload we already parsed is still valid to deliver once.
    let _ = std::fs::remove_file(path);
    Ok(Some(payload))
}

/// Watch `dir` for new `*.event` files, forwarding parsed payloads on `tx`.
/// Drains existing files first (§4.2: "a reader MUST first drain any
/// existing files"), then follows live filesystem notifications for the
/// rest of its life. The returned `RecommendedWatcher` must be kept alive by
/// the caller for as long as the watch should run.
pub fn watch(dir: impl Into<PathBuf>, tx: mpsc::UnboundedSender<EventFilePayload>) -> Result<RecommendedWatcher> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)?;

    for payload in drain(&dir)? {
        let _ = tx.send(payload);
    }

    let watch_dir = dir.clone();
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<NotifyEvent, notify::Error>| {
            let Ok(event) = result else { return };
            if !matches!(event.kind, notify::EventKind::Create(_)) {
                return;
            }
            for path in &event.paths {
                if path.extension().map(|ext| ext == "event").unwrap_or(false) {
                    if let Ok(Some(payload)) = read_and_remove(path) {
                        let _ = tx.send(payload);
                    }
                }
            }
        },
        Config::default().with_poll_interval(Duration::from_millis(100)),
    )
    .map_err(|e| crate::error::MementoError::Internal(e.to_string()))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::error::MementoError::Internal(e.to_string()))?;

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, MemoryId};

    fn tmp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("memento-dropdir-{}", crate::types::generate_id()))
    }

    #[test]
    fn writer_then_drain_round_trips() {
        let dir = tmp_dir();
        let writer = DropDirWriter::new(&dir).unwrap();
        let event = Event::now(EventType::MemoryCreated, MemoryId::from_parts("default", "abc"));
        writer.write(&event);

        let drained = drain(&dir).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].memory_id, "mem:default:abc");

        // file is removed after drain
        assert_eq!(drain(&dir).unwrap().len(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn drain_of_missing_directory_is_empty() {
        let dir = tmp_dir();
        assert_eq!(drain(&dir).unwrap().len(), 0);
    }
}
