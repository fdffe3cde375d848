//! Hybrid backend: metadata and state transitions in SQLite, payload bytes
//! on disk keyed by `message_id`.
//!
//! The SQL side gives fast ordered scans and transactional transitions; the
//! payload files keep large bodies out of the database. Rows store an empty
//! payload and reads rejoin it from `payloads/<message_id>`.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::{PathsConfig, SqliteConfig};
use crate::envelope::{LeaseToken, MessageEnvelope, NackDisposition, QueueMetrics};
use crate::error::Error;
use crate::policy::QueuePolicy;

use super::fs::atomic_write_bytes;
use super::sqlite::SqliteBackend;
use super::Backend;

const PAYLOAD_DIR: &str = "payloads";

pub struct HybridBackend {
    sql: SqliteBackend,
    payload_root: PathBuf,
}

impl HybridBackend {
    pub async fn open(
        sqlite: &SqliteConfig,
        paths: &PathsConfig,
        defaults: QueuePolicy,
    ) -> Result<Self, Error> {
        let payload_root = PathBuf::from(&paths.data_root).join(PAYLOAD_DIR);
        std::fs::create_dir_all(&payload_root)
            .map_err(|e| Error::io(format!("create {}: {e}", payload_root.display())))?;

        Ok(Self {
            sql: SqliteBackend::open(sqlite, defaults).await?,
            payload_root,
        })
    }

    fn payload_path(&self, message_id: &str) -> PathBuf {
        self.payload_root.join(message_id)
    }

    fn read_payload(&self, message_id: &str) -> Result<String, Error> {
        let path = self.payload_path(message_id);
        std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("payload {}: {e}", path.display())))
    }

    fn rejoin(&self, mut envelope: MessageEnvelope) -> Result<MessageEnvelope, Error> {
        envelope.payload = self.read_payload(&envelope.message_id)?;
        Ok(envelope)
    }

    /// The message id a lease currently points at, for payload cleanup.
    async fn leased_message_id(&self, lease_id: &str) -> Result<Option<String>, Error> {
        Ok(sqlx::query_scalar(
            "SELECT m.message_id FROM leases l
             JOIN messages m ON m.queue = l.queue AND m.key = l.message_key
             WHERE l.lease_id = $1",
        )
        .bind(lease_id)
        .fetch_optional(self.sql.db())
        .await?)
    }
}

#[async_trait]
impl Backend for HybridBackend {
    async fn close(&self) -> Result<(), Error> {
        self.sql.close().await
    }

    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<(), Error> {
        let payload_path = self.payload_path(&envelope.message_id);
        atomic_write_bytes(&payload_path, envelope.payload.as_bytes())?;

        let mut meta = envelope.clone();
        meta.payload = String::new();

        if let Err(e) = self.sql.enqueue(&meta).await {
            let _ = std::fs::remove_file(&payload_path);
            return Err(e);
        }
        Ok(())
    }

    async fn lease_next(
        &self,
        queue: &str,
        consumer_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<Option<(MessageEnvelope, LeaseToken)>, Error> {
        match self
            .sql
            .lease_next(queue, consumer_id, visibility_timeout_sec)
            .await?
        {
            Some((envelope, lease)) => Ok(Some((self.rejoin(envelope)?, lease))),
            None => Ok(None),
        }
    }

    async fn ack(&self, lease_id: &str) -> Result<(), Error> {
        self.sql.ack(lease_id).await
    }

    async fn nack(
        &self,
        lease_id: &str,
        reason: &str,
        requeue: bool,
    ) -> Result<NackDisposition, Error> {
        let message_id = self.leased_message_id(lease_id).await?;
        let disposition = self.sql.nack(lease_id, reason, requeue).await?;

        if disposition == NackDisposition::Dropped {
            if let Some(message_id) = message_id {
                let _ = std::fs::remove_file(self.payload_path(&message_id));
            }
        }
        Ok(disposition)
    }

    async fn extend_lease(
        &self,
        lease_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<i64, Error> {
        self.sql.extend_lease(lease_id, visibility_timeout_sec).await
    }

    async fn expired_leases(&self, now_ms: i64, limit: u32) -> Result<Vec<LeaseToken>, Error> {
        self.sql.expired_leases(now_ms, limit).await
    }

    async fn load_policy(&self, queue: &str) -> Result<Option<QueuePolicy>, Error> {
        self.sql.load_policy(queue).await
    }

    async fn save_policy(&self, queue: &str, policy: &QueuePolicy) -> Result<(), Error> {
        self.sql.save_policy(queue, policy).await
    }

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics, Error> {
        self.sql.metrics(queue).await
    }

    async fn ready_depth(&self, queue: &str, priority: i32) -> Result<u64, Error> {
        self.sql.ready_depth(queue, priority).await
    }

    async fn list_dlq(&self, queue: &str, max: u32) -> Result<Vec<MessageEnvelope>, Error> {
        self.sql
            .list_dlq(queue, max)
            .await?
            .into_iter()
            .map(|envelope| self.rejoin(envelope))
            .collect()
    }

    async fn reprocess_dlq(&self, queue: &str, up_to: u32) -> Result<u64, Error> {
        self.sql.reprocess_dlq(queue, up_to).await
    }
}
