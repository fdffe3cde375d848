//! The mailbox server: request discovery, worker pool, command dispatch,
//! and stale-entry cleanup over a shared directory tree.
//!
//! Life of a request: a producer atomically drops `requests/X`; discovery
//! pushes the path to the pending queue; a worker claims it by renaming it
//! into `processing/`, parses and dispatches it, writes the response into
//! the client's outbox, and deletes the processing file. Unparseable
//! requests land in `dead/` with a reason sidecar. A crash mid-handling
//! leaves the file in `processing/` until the stale sweeper declares it
//! abandoned.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MailboxConfig;
use crate::error::Error;
use crate::manager::{EnqueueRequest, QueueManager};
use crate::validator::{MessageSchema, MessageValidator};

use super::fsio;
use super::protocol::{salvage_ids, Command, MailboxRequest, MailboxResponse};
use super::watcher;

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct CommandStats {
    total: u64,
    failed: u64,
}

/// Per-command request counters, surfaced in the `status` response.
#[derive(Default)]
pub struct RequestMetrics {
    total: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    per_command: Mutex<HashMap<Command, CommandStats>>,
}

impl RequestMetrics {
    fn record(&self, command: Command, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut per_command = self.per_command.lock();
        let stats = per_command.entry(command).or_default();
        stats.total += 1;
        if !ok {
            stats.failed += 1;
        }
    }

    fn record_malformed(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Value {
        let per_command: HashMap<String, CommandStats> = self
            .per_command
            .lock()
            .iter()
            .map(|(command, stats)| (command.to_string(), *stats))
            .collect();
        json!({
            "requests_total": self.total.load(Ordering::Relaxed),
            "requests_failed": self.failed.load(Ordering::Relaxed),
            "requests_malformed": self.malformed.load(Ordering::Relaxed),
            "commands": per_command,
        })
    }
}

/// Join handles for everything the mailbox spawned; awaiting drains the
/// in-flight workers.
pub struct MailboxTasks {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl MailboxTasks {
    pub async fn drained(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub struct MailboxHandler {
    manager: Arc<QueueManager>,
    validator: Arc<MessageValidator>,
    config: MailboxConfig,
    metrics: Arc<RequestMetrics>,
}

impl MailboxHandler {
    pub fn new(
        manager: Arc<QueueManager>,
        validator: Arc<MessageValidator>,
        config: MailboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            validator,
            config,
            metrics: Arc::new(RequestMetrics::default()),
        })
    }

    pub fn register_schema(&self, queue: impl Into<String>, schema: MessageSchema) {
        self.validator.register_schema(queue, schema);
    }

    pub fn unregister_schema(&self, queue: &str) {
        self.validator.unregister_schema(queue);
    }

    fn root(&self) -> PathBuf {
        PathBuf::from(&self.config.root)
    }

    fn requests_dir(&self) -> PathBuf {
        self.root().join(&self.config.requests_dir)
    }

    fn processing_dir(&self) -> PathBuf {
        self.root().join(&self.config.processing_dir)
    }

    fn responses_dir(&self) -> PathBuf {
        self.root().join(&self.config.responses_dir)
    }

    fn dead_dir(&self) -> PathBuf {
        self.root().join(&self.config.dead_dir)
    }

    fn response_path(&self, client_id: &str, file_stem: &str) -> PathBuf {
        self.responses_dir()
            .join(sanitize_component(client_id))
            .join(format!("{}.json", sanitize_component(file_stem)))
    }

    /// Create the directory tree and spawn discovery, workers, and the
    /// stale sweeper. Tasks run until `shutdown` is cancelled; awaiting the
    /// returned handles drains in-flight work.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<MailboxTasks, Error> {
        for dir in [
            self.requests_dir(),
            self.processing_dir(),
            self.responses_dir(),
            self.dead_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io(format!("create {}: {e}", dir.display())))?;
        }

        let (tx, rx) = mpsc::channel::<PathBuf>(self.config.pending_capacity.max(1));
        let pending: watcher::PendingSet = Arc::new(Mutex::new(HashSet::new()));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::new();

        handles.push(watcher::spawn(
            self.requests_dir(),
            tx,
            pending.clone(),
            Duration::from_millis(self.config.scan_interval_ms.max(100)),
            shutdown.clone(),
        )?);

        for worker in 0..self.config.worker_count.max(1) {
            let handler = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                handler.worker_loop(worker, rx, pending, shutdown).await;
            }));
        }

        {
            let handler = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                handler.stale_cleanup_loop(shutdown).await;
            }));
        }

        tracing::info!(
            root = %self.root().display(),
            workers = self.config.worker_count,
            "mailbox started"
        );

        Ok(MailboxTasks { handles })
    }

    async fn worker_loop(
        &self,
        worker: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PathBuf>>>,
        pending: watcher::PendingSet,
        shutdown: CancellationToken,
    ) {
        loop {
            let path = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    path = rx.recv() => path,
                }
            };
            let Some(path) = path else { break };
            pending.lock().remove(&path);

            if let Err(e) = self.process(&path, &shutdown).await {
                tracing::warn!(worker, path = %path.display(), error = %e, "request processing failed");
            }
        }
        tracing::debug!(worker, "mailbox worker stopped");
    }

    async fn process(&self, path: &PathBuf, shutdown: &CancellationToken) -> Result<(), Error> {
        // The rename is the claim: under duplicate discovery or a worker
        // race exactly one claim succeeds and the rest land here.
        let Some(claimed) = fsio::claim(path, &self.processing_dir()).await? else {
            return Ok(());
        };

        let raw = tokio::fs::read_to_string(&claimed).await?;

        match MailboxRequest::parse(&raw) {
            Ok(request) => {
                let result = if shutdown.is_cancelled() {
                    Err(Error::Unavailable)
                } else {
                    self.dispatch(&request).await
                };

                self.metrics.record(request.command, result.is_ok());

                let response = match result {
                    Ok(data) => MailboxResponse::success(&request.request_id, data),
                    Err(e) => {
                        tracing::debug!(
                            request_id = %request.request_id,
                            command = %request.command,
                            code = e.code(),
                            "request failed: {e}"
                        );
                        MailboxResponse::failure(&request.request_id, &e)
                    }
                };

                self.write_response(&request.client_id, &request.request_id, &response)
                    .await;
                tokio::fs::remove_file(&claimed).await?;
            }
            Err(parse_error) => {
                self.metrics.record_malformed();
                tracing::warn!(path = %claimed.display(), "malformed request: {parse_error}");
                fsio::move_to_dead(&claimed, &self.dead_dir(), &parse_error.to_string()).await?;

                // A response is only possible when the client id survived.
                let ids = salvage_ids(&raw);
                if let Some(client_id) = ids.client_id {
                    let request_id = ids.request_id.unwrap_or_default();
                    let file_stem = if request_id.is_empty() {
                        format!("malformed-{}", uuid::Uuid::new_v4())
                    } else {
                        request_id.clone()
                    };
                    let response = MailboxResponse::failure(request_id, &parse_error);
                    self.write_response(&client_id, &file_stem, &response).await;
                }
            }
        }

        Ok(())
    }

    async fn write_response(&self, client_id: &str, file_stem: &str, response: &MailboxResponse) {
        let path = self.response_path(client_id, file_stem);
        let body = match serde_json::to_vec_pretty(response) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "response serialization failed");
                return;
            }
        };
        if let Err(e) = fsio::atomic_write(&path, &body).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write response");
        }
    }

    async fn dispatch(&self, request: &MailboxRequest) -> Result<Value, Error> {
        match request.command {
            Command::Publish => {
                let queue = request.require_queue()?;
                let payload = request.payload_string()?;
                self.validator.validate(queue, &payload)?;

                let message_id = self
                    .manager
                    .enqueue(EnqueueRequest {
                        queue: queue.to_owned(),
                        payload,
                        attributes: request.attributes_string(),
                        priority: request.priority.unwrap_or(0),
                        delay_ms: request.delay_ms,
                        key: request.key.clone(),
                    })
                    .await?;

                Ok(json!({ "message_id": message_id }))
            }

            Command::ConsumeNext => {
                let queue = request.require_queue()?;
                let consumer_id = request.require_consumer_id()?;

                match self
                    .manager
                    .lease_next(queue, consumer_id, request.visibility_timeout_sec)
                    .await?
                {
                    Some((envelope, lease)) => Ok(json!({
                        "leased": true,
                        "envelope": envelope,
                        "lease": lease,
                    })),
                    None => Ok(json!({ "leased": false })),
                }
            }

            Command::Ack => {
                self.manager.ack(request.require_lease_id()?).await?;
                Ok(json!({}))
            }

            Command::Nack => {
                let lease_id = request.require_lease_id()?;
                let requeue = request.require_requeue()?;
                self.manager
                    .nack(lease_id, request.reason.as_deref(), requeue)
                    .await?;
                Ok(json!({}))
            }

            Command::ExtendLease => {
                let lease_id = request.require_lease_id()?;
                let visibility = request.require_visibility_timeout()?;
                let lease_until_ms = self.manager.extend_lease(lease_id, visibility).await?;
                Ok(json!({ "lease_until_ms": lease_until_ms }))
            }

            Command::Status => {
                let report = self.manager.status().await?;
                let mut data = serde_json::to_value(report)
                    .map_err(|e| Error::io(format!("serialize status: {e}")))?;
                data["mailbox"] = self.metrics.snapshot();
                Ok(data)
            }

            Command::Health => Ok(json!({ "ok": self.manager.health() })),

            Command::Metrics => {
                let queue = request.require_queue()?;
                let metrics = self.manager.metrics(queue).await?;
                serde_json::to_value(metrics)
                    .map_err(|e| Error::io(format!("serialize metrics: {e}")))
            }

            Command::ListDlq => {
                let queue = request.require_queue()?;
                let max = request
                    .max
                    .ok_or_else(|| Error::invalid_request("missing required field 'max'"))?;
                let items = self.manager.list_dlq(queue, max).await?;
                Ok(json!({ "items": items }))
            }

            Command::ReprocessDlq => {
                let queue = request.require_queue()?;
                let up_to = request
                    .up_to
                    .ok_or_else(|| Error::invalid_request("missing required field 'up_to'"))?;
                let reprocessed = self.manager.reprocess_dlq(queue, up_to).await?;
                Ok(json!({ "reprocessed": reprocessed }))
            }
        }
    }

    async fn stale_cleanup_loop(&self, shutdown: CancellationToken) {
        let request_ttl = Duration::from_secs(self.config.stale_request_ttl_sec.max(1));
        let response_ttl = Duration::from_secs(self.config.stale_response_ttl_sec.max(1));
        let cadence = Duration::from_secs(self.config.stale_request_ttl_sec.clamp(1, 30));

        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A request stuck in processing/ past its TTL was abandoned by
            // a crash between claim and response; declare it dead.
            match fsio::older_than(&self.processing_dir(), request_ttl) {
                Ok(stale) => {
                    for path in stale {
                        tracing::warn!(path = %path.display(), "abandoned request past TTL");
                        if let Err(e) = fsio::move_to_dead(
                            &path,
                            &self.dead_dir(),
                            "abandoned: processing exceeded TTL",
                        )
                        .await
                        {
                            tracing::warn!(path = %path.display(), error = %e, "failed to dead-letter stale request");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "stale request scan failed"),
            }

            // Response files the client never collected.
            if let Ok(entries) = std::fs::read_dir(self.responses_dir()) {
                for entry in entries.flatten() {
                    let client_dir = entry.path();
                    if !client_dir.is_dir() {
                        continue;
                    }
                    match fsio::older_than(&client_dir, response_ttl) {
                        Ok(stale) => {
                            for path in stale {
                                let _ = std::fs::remove_file(&path);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "stale response scan failed");
                        }
                    }
                }
            }
        }

        tracing::debug!("stale cleanup stopped");
    }
}

/// Client and request ids become path components; keep them on a short
/// leash so a hostile id cannot escape the responses tree.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_owned()
}
