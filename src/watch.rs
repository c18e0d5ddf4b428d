//! Filesystem watching.
//!
//! Debounced change events for a container's roots are fed one path at a
//! time to [`ContainerManager::reconcile_path`], which serializes them
//! with the container's indexing jobs.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::container::ContainerManager;

/// Keeps the OS watcher alive. Dropping it stops watching.
pub struct ContainerWatcher {
    pub container: String,
    pub roots: Vec<PathBuf>,
    debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    listener: tokio::task::JoinHandle<()>,
}

impl ContainerWatcher {
    /// Watch every root of `container`.
    pub async fn start(
        manager: Arc<ContainerManager>,
        container: &str,
        debounce: Duration,
    ) -> Result<Self> {
        let roots: Vec<PathBuf> = manager
            .list()
            .await
            .into_iter()
            .find(|c| c.name == container)
            .map(|c| c.roots())
            .ok_or_else(|| {
                folio_core::error::FolioError::ContainerNotFound(container.to_string())
            })?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let listener = tokio::spawn(listen(manager, container.to_string(), events_rx));

        let mut debouncer = notify_debouncer_mini::new_debouncer(
            debounce,
            move |res: notify_debouncer_mini::DebounceEventResult| match res {
                Ok(events) => {
                    for ev in events {
                        // Runs on the notify thread, not inside the runtime.
                        if events_tx.blocking_send(ev.path).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
        )?;

        for root in &roots {
            match debouncer
                .watcher()
                .watch(root, notify::RecursiveMode::Recursive)
            {
                Ok(()) => info!(container, root = %root.display(), "watching"),
                Err(e) => warn!(container, root = %root.display(), error = %e, "cannot watch root"),
            }
        }

        Ok(Self {
            container: container.to_string(),
            roots,
            debouncer,
            listener,
        })
    }

    /// Stop watching and wait for queued events to drain.
    pub async fn shutdown(self) {
        drop(self.debouncer);
        let _ = self.listener.await;
    }
}

async fn listen(
    manager: Arc<ContainerManager>,
    container: String,
    mut events_rx: mpsc::Receiver<PathBuf>,
) {
    while let Some(path) = events_rx.recv().await {
        match manager.reconcile_path(&container, &path).await {
            Ok(outcome) => {
                debug!(container = %container, path = %path.display(), ?outcome, "reconciled")
            }
            Err(e) => error!(
                container = %container,
                path = %path.display(),
                error = %e,
                "failed to apply change"
            ),
        }
    }
}
