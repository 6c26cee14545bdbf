//! Hot reload of the device / mapping file
//!
//! The parent directory is watched so editors that save through a rename
//! are picked up too. Bursts of events are coalesced: a reload only runs
//! once the file has been quiet for `RELOAD_DEBOUNCE`. Each accepted reload
//! comes with the set of devices it touches, so unchanged devices keep
//! running.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{AppConfig, ConfigChanges};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Outcome of one reload attempt
#[derive(Debug, Clone)]
pub enum ConfigUpdate {
    /// The file parsed and validated; `changes` is relative to the last
    /// applied config and never empty
    Applied { config: AppConfig, changes: ConfigChanges },
    /// The edit was invalid; the running config stays in effect
    Rejected { reason: String },
}

/// Shared between the notify thread and the reload tasks
struct ReloadState {
    path: PathBuf,
    /// Bumped on every relevant file event
    generation: AtomicU64,
    /// Last config handed out
    current: Mutex<AppConfig>,
    tx: mpsc::Sender<ConfigUpdate>,
}

impl ReloadState {
    fn concerns(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }

    /// Re-read the file unless a newer event superseded this one
    async fn reload(&self, generation: u64) {
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "Reload superseded by a newer file event");
            return;
        }

        let update = match AppConfig::load(&self.path.to_string_lossy()).await {
            Ok(config) => {
                let changes = ConfigChanges::between(&self.current.lock(), &config);
                if changes.is_empty() {
                    debug!("Config file touched without changes");
                    return;
                }
                info!("🔄 Configuration reloaded ({})", changes);
                *self.current.lock() = config.clone();
                ConfigUpdate::Applied { config, changes }
            }
            Err(e) => {
                warn!("Rejected config reload (keeping running config): {:#}", e);
                ConfigUpdate::Rejected {
                    reason: format!("{:#}", e),
                }
            }
        };

        if let Err(e) = self.tx.send(update).await {
            error!("Failed to deliver config update: {}", e);
        }
    }
}

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<ConfigUpdate>,
}

impl ConfigWatcher {
    /// Load the file once and start watching it
    ///
    /// Fails when the initial file is missing or invalid.
    pub async fn new(config_path: impl AsRef<Path>) -> Result<(Self, AppConfig)> {
        let path = config_path.as_ref().to_path_buf();
        let initial = AppConfig::load(&path.to_string_lossy())
            .await
            .context("Failed to load initial config")?;

        let (tx, rx) = mpsc::channel(10);
        let state = Arc::new(ReloadState {
            path: path.clone(),
            generation: AtomicU64::new(0),
            current: Mutex::new(initial.clone()),
            tx,
        });

        // notify calls back on its own thread
        let runtime = tokio::runtime::Handle::current();
        let callback_state = state.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if callback_state.concerns(&event) => {
                let generation = callback_state.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let state = callback_state.clone();
                runtime.spawn(async move { state.reload(generation).await });
            }
            Ok(_) => {}
            Err(e) => error!("Config watch error: {}", e),
        })?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config directory: {}", dir.display()))?;

        info!("Watching {} for changes", path.display());
        Ok((Self { _watcher: watcher, rx }, initial))
    }

    /// Next reload outcome; `None` once the watcher is gone
    pub async fn next_update(&mut self) -> Option<ConfigUpdate> {
        self.rx.recv().await
    }
}
