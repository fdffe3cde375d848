//! Durable storage behind the broker.
//!
//! All persistent state (envelopes, leases, policies) lives behind the
//! [`Backend`] trait; the queue manager and mailbox never touch storage
//! directly. Three implementations exist: an embedded SQL store, a pure
//! filesystem store, and a hybrid that keeps metadata in SQL and payload
//! bytes on disk.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BackendKind, Config};
use crate::envelope::{LeaseToken, MessageEnvelope, NackDisposition, QueueMetrics};
use crate::error::Error;
use crate::policy::QueuePolicy;

pub mod fs;
pub mod hybrid;
pub mod sqlite;

pub use fs::FsBackend;
pub use hybrid::HybridBackend;
pub use sqlite::SqliteBackend;

/// Storage contract. Every operation is atomic and durable on return:
/// partial writes are never observable, and success implies the change
/// survives a crash.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Flush and release resources. Further calls may fail.
    async fn close(&self) -> Result<(), Error>;

    /// Insert a new message. The stored state is derived from
    /// `available_at_ms`: future timestamps land in `Delayed`, otherwise
    /// `Ready`. A `(queue, key)` collision is a `conflict` — this is the
    /// idempotency mechanism.
    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<(), Error>;

    /// Atomically claim the eligible message with minimum
    /// `(priority, available_at_ms, created_at_ms, key)`, transition it to
    /// inflight, increment its attempt counter, and record a lease.
    /// `None` when nothing is eligible. Concurrent callers never receive
    /// the same message.
    async fn lease_next(
        &self,
        queue: &str,
        consumer_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<Option<(MessageEnvelope, LeaseToken)>, Error>;

    /// Inflight to archived. `not_found` if the lease was already resolved
    /// or reclaimed.
    async fn ack(&self, lease_id: &str) -> Result<(), Error>;

    /// Resolve a lease negatively. With `requeue`, the message goes back to
    /// ready/delayed under the queue's backoff policy until retries are
    /// exhausted; without it (or once exhausted) it is dead-lettered, or
    /// deleted when the queue has no DLQ.
    async fn nack(
        &self,
        lease_id: &str,
        reason: &str,
        requeue: bool,
    ) -> Result<NackDisposition, Error>;

    /// Push the lease deadline out. Returns the new `lease_until_ms`.
    async fn extend_lease(
        &self,
        lease_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<i64, Error>;

    /// Leases whose deadline has passed, for the sweeper. A lease expiring
    /// exactly at `now_ms` is still valid.
    async fn expired_leases(&self, now_ms: i64, limit: u32) -> Result<Vec<LeaseToken>, Error>;

    async fn load_policy(&self, queue: &str) -> Result<Option<QueuePolicy>, Error>;
    async fn save_policy(&self, queue: &str, policy: &QueuePolicy) -> Result<(), Error>;

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics, Error>;

    /// Number of currently-eligible messages at one priority, for the
    /// enqueue backpressure check.
    async fn ready_depth(&self, queue: &str, priority: i32) -> Result<u64, Error>;

    /// Read up to `max` entries from the queue's DLQ, oldest first.
    async fn list_dlq(&self, queue: &str, max: u32) -> Result<Vec<MessageEnvelope>, Error>;

    /// Reinject up to `up_to` DLQ entries into the origin queue with
    /// `attempt = 0`. Returns how many were moved.
    async fn reprocess_dlq(&self, queue: &str, up_to: u32) -> Result<u64, Error>;
}

/// Build the backend selected by the configuration.
pub async fn open(config: &Config) -> Result<Arc<dyn Backend>, Error> {
    let defaults = config.policy_defaults.clone();
    match config.backend() {
        BackendKind::Sqlite => Ok(Arc::new(
            SqliteBackend::open(&config.sqlite, defaults).await?,
        )),
        BackendKind::Filesystem => Ok(Arc::new(
            FsBackend::open(&config.filesystem, defaults).await?,
        )),
        BackendKind::Hybrid => Ok(Arc::new(
            HybridBackend::open(&config.sqlite, &config.paths, defaults).await?,
        )),
    }
}
