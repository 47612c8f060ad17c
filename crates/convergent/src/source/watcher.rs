//! File system watcher for local source directories.
//!
//! A change under a watched directory means a new desired-state revision has
//! arrived for the target; the controller cancels any in-flight cycle and
//! starts a fresh one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::broadcast;

use crate::error::{ConvergentError, Result};

/// Emitted when a file under a watched source changes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChangeEvent {
    pub target: String,
    /// Changed path relative to the watched directory.
    pub path: String,
    pub detected_at: DateTime<Utc>,
}

/// Watches local source directories and broadcasts [`SourceChangeEvent`]s.
pub struct SourceWatcher {
    sender: broadcast::Sender<SourceChangeEvent>,
    shutdown: Arc<AtomicBool>,
    debounce: Duration,
    handles: Vec<JoinHandle<()>>,
}

impl SourceWatcher {
    pub fn new(debounce: Duration) -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            shutdown: Arc::new(AtomicBool::new(false)),
            debounce,
            handles: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceChangeEvent> {
        self.sender.subscribe()
    }

    /// Starts watching `dir` on behalf of `target` in a background thread.
    ///
    /// Returns once the watch is registered, or with the registration error.
    pub fn watch(&mut self, target: impl Into<String>, dir: impl Into<PathBuf>) -> Result<()> {
        let target = target.into();
        let dir = dir.into();
        let sender = self.sender.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let debounce = self.debounce;
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let handle = std::thread::spawn(move || {
            let (tx, rx) = std::sync::mpsc::channel();

            let debouncer: std::result::Result<Debouncer<RecommendedWatcher>, String> =
                new_debouncer(debounce, tx)
                    .map_err(|e| e.to_string())
                    .and_then(|mut d| {
                        d.watcher()
                            .watch(&dir, RecursiveMode::Recursive)
                            .map(|_| d)
                            .map_err(|e| e.to_string())
                    });

            let _debouncer = match debouncer {
                Ok(d) => {
                    let _ = ready_tx.send(Ok(()));
                    d
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            log::info!("Watching source of {} at {}", target, dir.display());

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                // Use timeout to allow checking shutdown flag
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(events)) => {
                        if let Some(event) = summarize(&target, &dir, events) {
                            let _ = sender.send(event);
                        }
                    }
                    Ok(Err(e)) => log::error!("Watch error for {}: {}", target, e),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            log::info!("Stopped watching source of {}", target);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.handles.push(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(ConvergentError::Watch(e))
            }
            Err(_) => Err(ConvergentError::Watch(
                "watcher thread exited during startup".to_string(),
            )),
        }
    }

    /// Signals every watch thread to stop and waits for them.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collapses a debounced batch into one event, ignoring hidden paths.
fn summarize(target: &str, dir: &Path, events: Vec<DebouncedEvent>) -> Option<SourceChangeEvent> {
    let mut paths: Vec<String> = events
        .iter()
        .filter_map(|event| {
            let relative = event.path.strip_prefix(dir).ok()?;
            let hidden = relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
            (!hidden && !relative.as_os_str().is_empty())
                .then(|| relative.to_string_lossy().into_owned())
        })
        .collect();
    paths.sort();
    paths.dedup();

    let first = paths.into_iter().next()?;
    Some(SourceChangeEvent {
        target: target.to_string(),
        path: first,
        detected_at: Utc::now(),
    })
}
