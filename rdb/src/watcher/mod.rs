use crate::error::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Default interval between file polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Invoked whenever the watched file may have changed.
pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Something that can tell a table its file changed.
pub trait ChangeSource: Send + Sync {
    /// Start watching `path`. Watching stops when the returned handle is dropped.
    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<WatchHandle>;
}

/// Keeps a watch alive; dropping it stops the watch.
pub struct WatchHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        WatchHandle {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

/// Which change source a database hands to its tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeSourceKind {
    /// Stat the file at a fixed interval
    #[default]
    Poll,
    /// OS file notifications
    Notify,
}

impl ChangeSourceKind {
    pub fn build(self, poll_interval: Duration) -> Arc<dyn ChangeSource> {
        match self {
            ChangeSourceKind::Poll => Arc::new(PollingSource::new(poll_interval)),
            ChangeSourceKind::Notify => Arc::new(NotifySource::default()),
        }
    }
}

/// Polls the file's modification time and size on a background thread.
#[derive(Debug, Clone)]
pub struct PollingSource {
    interval: Duration,
}

impl PollingSource {
    pub fn new(interval: Duration) -> Self {
        PollingSource { interval }
    }
}

impl Default for PollingSource {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

/// (mtime, length, inode). Table writes replace the file by rename, so the
/// inode changes even when mtime and length do not.
type FileSignature = Option<(Option<SystemTime>, u64, u64)>;

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> u64 {
    0
}

fn file_signature(path: &Path) -> FileSignature {
    std::fs::metadata(path)
        .ok()
        .map(|meta| (meta.modified().ok(), meta.len(), file_identity(&meta)))
}

impl ChangeSource for PollingSource {
    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<WatchHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let path = path.to_path_buf();
        let interval = self.interval;
        let name = format!(
            "rdb-poll-{}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        let mut last = file_signature(&path);
        std::thread::Builder::new().name(name).spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let current = file_signature(&path);
                        if current != last {
                            last = current;
                            on_change();
                        }
                    }
                    // Handle dropped (or explicit stop)
                    _ => break,
                }
            }
        })?;

        Ok(WatchHandle::new(move || drop(stop_tx)))
    }
}

/// Uses OS notifications on the file's directory, debounced.
#[derive(Debug, Clone)]
pub struct NotifySource {
    debounce: Duration,
}

impl NotifySource {
    pub fn new(debounce: Duration) -> Self {
        NotifySource { debounce }
    }
}

impl Default for NotifySource {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ChangeSource for NotifySource {
    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<WatchHandle> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;

        // Writes replace the file through a rename, so watch the directory
        // and pick out events naming our file.
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let file_name = path.file_name().map(|n| n.to_os_string());
        let debounce = self.debounce;
        std::thread::Builder::new()
            .name("rdb-notify".into())
            .spawn(move || {
                let mut pending = false;
                let mut last_event = Instant::now();

                loop {
                    match notify_rx.recv_timeout(debounce) {
                        Ok(Ok(event)) => {
                            if matches!(event.kind, EventKind::Access(_)) {
                                continue;
                            }
                            let ours = event
                                .paths
                                .iter()
                                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                            if ours {
                                pending = true;
                                last_event = Instant::now();
                            }
                        }
                        Ok(Err(e)) => {
                            log::warn!("File watcher error: {e}");
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if pending && last_event.elapsed() >= debounce {
                                pending = false;
                                on_change();
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            // Watcher was dropped, exit the thread
                            break;
                        }
                    }
                }
            })?;

        Ok(WatchHandle::new(move || drop(watcher)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_polling_source_reports_changes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t_table.json");
        std::fs::write(&path, "{}").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let source = PollingSource::new(Duration::from_millis(10));
        let handle = source
            .watch(
                &path,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        std::fs::write(&path, "{\"changed\": true}").unwrap();
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 1));

        handle.stop();
        // Let an in-flight tick finish before sampling.
        std::thread::sleep(Duration::from_millis(30));
        let seen = hits.load(Ordering::SeqCst);
        std::fs::write(&path, "{\"changed\": \"again, longer\"}").unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_polling_source_reports_removal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t_table.json");
        std::fs::write(&path, "{}").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _handle = PollingSource::new(Duration::from_millis(10))
            .watch(
                &path,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 1));
    }

    #[cfg(unix)]
    #[test]
    fn test_polling_source_sees_same_size_replacement() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t_table.json");
        std::fs::write(&path, "{\"v\":1}").unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _handle = PollingSource::new(Duration::from_millis(10))
            .watch(
                &path,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // Same length, same mtime, new file moved into place.
        let replacement = tmp.path().join("t_table.json.tmp");
        std::fs::write(&replacement, "{\"v\":2}").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&replacement)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        std::fs::rename(&replacement, &path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);

        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 1));
    }

    #[test]
    fn test_notify_source_reports_table_writes() {
        let tmp = TempDir::new().unwrap();
        let schema = crate::schema::TableSchema::new(
            "events",
            vec![crate::schema::Column::new("title", crate::schema::ColumnType::String)],
        );
        let path = tmp.path().join(schema.file_name());
        let mut file = crate::table::TableFile::new(schema);
        file.write(&path).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = ChangeSourceKind::Notify
            .build(DEFAULT_POLL_INTERVAL)
            .watch(
                &path,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // Writes to other files in the directory are ignored.
        std::fs::write(tmp.path().join("other.txt"), "noise").unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        file.last_insert_id = 1;
        file.data.push(
            serde_json::json!({ "id": 1, "title": "launch" })
                .as_object()
                .cloned()
                .unwrap(),
        );
        file.write(&path).unwrap();
        assert!(wait_until(Duration::from_secs(10), || hits.load(Ordering::SeqCst) >= 1));

        handle.stop();
    }

    #[test]
    fn test_watch_handle_runs_stop_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let handle = WatchHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
