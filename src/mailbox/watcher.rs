//! Request discovery: filesystem events with a periodic rescan fallback.
//!
//! notify callbacks run on a watcher-internal thread and are forwarded into
//! a tokio channel; a bounded-interval rescan of `requests/` catches
//! anything the event stream missed (or platforms without native events).
//! A shared dedupe set keeps one path from entering the pending queue
//! twice; the claim rename makes any survivor duplicates harmless anyway.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::fsio;

pub type PendingSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Forward a discovered path to the workers unless it is already pending.
async fn offer(
    path: PathBuf,
    pending: &PendingSet,
    tx: &mpsc::Sender<PathBuf>,
) {
    if !pending.lock().insert(path.clone()) {
        return;
    }
    if tx.send(path.clone()).await.is_err() {
        pending.lock().remove(&path);
    }
}

fn is_discovery_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Spawn the discovery task. Returns once the watcher is installed; the
/// task runs until cancelled and owns the watcher for its lifetime.
pub fn spawn(
    requests_dir: PathBuf,
    tx: mpsc::Sender<PathBuf>,
    pending: PendingSet,
    scan_interval: Duration,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    let (event_tx, mut event_rx) = mpsc::channel::<Result<Event, notify::Error>>(64);

    // notify invokes this on its own thread; hop onto the runtime's channel.
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = event_tx.blocking_send(res);
        },
        notify::Config::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::io(format!("create watcher: {e}")))?;

    watcher
        .watch(&requests_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::io(format!("watch {}: {e}", requests_dir.display())))?;

    tracing::info!(path = %requests_dir.display(), "watching mailbox requests");

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for the duration of the task.
        let _watcher = watcher;
        let mut rescan = tokio::time::interval(scan_interval.max(Duration::from_millis(100)));
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = event_rx.recv() => {
                    match event {
                        Some(Ok(event)) if is_discovery_event(&event.kind) => {
                            for path in event.paths {
                                let eligible = path
                                    .file_name()
                                    .and_then(|n| n.to_str())
                                    .map(fsio::is_request_file)
                                    .unwrap_or(false);
                                if eligible {
                                    offer(path, &pending, &tx).await;
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "watcher error, rescan will cover");
                        }
                        None => break,
                    }
                }

                _ = rescan.tick() => {
                    match fsio::scan_requests(&requests_dir) {
                        Ok(paths) => {
                            for path in paths {
                                offer(path, &pending, &tx).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "request rescan failed");
                        }
                    }
                }
            }
        }

        tracing::info!("request discovery stopped");
    });

    Ok(handle)
}
