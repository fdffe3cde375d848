//! Embedded SQL backend.
//!
//! Envelopes, leases, and policies live in SQLite under WAL journaling.
//! Every state transition is a single transaction whose first statement is
//! a write, so concurrent transitions serialize on the database write lock
//! and a claimed message can never be handed to two consumers. Contention
//! surfaces as SQLITE_BUSY and is retried with bounded exponential backoff.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, SqlitePool};

use crate::config::SqliteConfig;
use crate::envelope::{
    now_ms, LeaseToken, MessageEnvelope, MessageState, NackDisposition, QueueMetrics,
};
use crate::error::Error;
use crate::policy::QueuePolicy;

use super::Backend;

const MAX_BUSY_RETRIES: u32 = 10;
const BUSY_RETRY_INITIAL: Duration = Duration::from_millis(1);
const BUSY_RETRY_CAP: Duration = Duration::from_millis(100);

#[derive(FromRow)]
struct MessageRow {
    queue: String,
    key: String,
    message_id: String,
    payload: String,
    attributes: String,
    priority: i64,
    attempt: i64,
    state: String,
    created_at_ms: i64,
    available_at_ms: i64,
}

impl MessageRow {
    fn into_envelope(self) -> Result<MessageEnvelope, Error> {
        let state = MessageState::from_str(&self.state)
            .map_err(|_| Error::io(format!("corrupt message state '{}'", self.state)))?;
        Ok(MessageEnvelope {
            message_id: self.message_id,
            key: self.key,
            queue: self.queue,
            payload: self.payload,
            attributes: self.attributes,
            priority: self.priority as i32,
            attempt: self.attempt as u32,
            state,
            created_at_ms: self.created_at_ms,
            available_at_ms: self.available_at_ms,
        })
    }
}

#[derive(FromRow)]
struct LeaseRow {
    lease_id: String,
    queue: String,
    message_key: String,
    consumer_id: String,
    lease_until_ms: i64,
}

impl From<LeaseRow> for LeaseToken {
    fn from(r: LeaseRow) -> Self {
        LeaseToken {
            lease_id: r.lease_id,
            queue: r.queue,
            message_key: r.message_key,
            consumer_id: r.consumer_id,
            lease_until_ms: r.lease_until_ms,
        }
    }
}

pub struct SqliteBackend {
    db: SqlitePool,
    defaults: QueuePolicy,
}

impl SqliteBackend {
    pub async fn open(config: &SqliteConfig, defaults: QueuePolicy) -> Result<Self, Error> {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .journal_mode(parse_journal_mode(&config.journal_mode)?)
            .synchronous(parse_synchronous(&config.synchronous)?);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            db: pool,
            defaults,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    async fn policy_or_default(&self, queue: &str) -> Result<QueuePolicy, Error> {
        Ok(self.load_policy(queue).await?.unwrap_or_else(|| self.defaults.clone()))
    }

    async fn try_lease_next(
        &self,
        queue: &str,
        consumer_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<Option<(MessageEnvelope, LeaseToken)>, Error> {
        let now = now_ms();
        let mut tx = self.db.begin().await?;

        // The claim is the transaction's first statement and a write, so it
        // always sees the latest committed state.
        let row: Option<MessageRow> = sqlx::query_as(
            "
            UPDATE messages
            SET state = 'inflight', attempt = attempt + 1
            WHERE queue = $1 AND key = (
                SELECT key FROM messages
                WHERE queue = $1
                  AND state IN ('ready', 'delayed')
                  AND available_at_ms <= $2
                ORDER BY priority, available_at_ms, created_at_ms, key
                LIMIT 1
            )
            RETURNING queue, key, message_id, payload, attributes, priority,
                      attempt, state, created_at_ms, available_at_ms
            ",
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let lease = LeaseToken {
            lease_id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_owned(),
            message_key: row.key.clone(),
            consumer_id: consumer_id.to_owned(),
            lease_until_ms: now + visibility_timeout_sec as i64 * 1000,
        };

        sqlx::query(
            "
            INSERT INTO leases (lease_id, queue, message_key, consumer_id, lease_until_ms)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(&lease.lease_id)
        .bind(&lease.queue)
        .bind(&lease.message_key)
        .bind(&lease.consumer_id)
        .bind(lease.lease_until_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some((row.into_envelope()?, lease)))
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn close(&self) -> Result<(), Error> {
        self.db.close().await;
        Ok(())
    }

    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<(), Error> {
        let state = if envelope.available_at_ms > now_ms() {
            MessageState::Delayed
        } else {
            MessageState::Ready
        };

        let res = sqlx::query(
            "
            INSERT INTO messages (queue, key, message_id, payload, attributes,
                                  priority, attempt, state, created_at_ms, available_at_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(&envelope.queue)
        .bind(&envelope.key)
        .bind(&envelope.message_id)
        .bind(&envelope.payload)
        .bind(&envelope.attributes)
        .bind(envelope.priority as i64)
        .bind(envelope.attempt as i64)
        .bind(state.to_string())
        .bind(envelope.created_at_ms)
        .bind(envelope.available_at_ms)
        .execute(&self.db)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::conflict(format!(
                "duplicate key '{}' in queue '{}'",
                envelope.key, envelope.queue
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn lease_next(
        &self,
        queue: &str,
        consumer_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<Option<(MessageEnvelope, LeaseToken)>, Error> {
        let mut delay = BUSY_RETRY_INITIAL;
        for _ in 0..MAX_BUSY_RETRIES {
            match self
                .try_lease_next(queue, consumer_id, visibility_timeout_sec)
                .await
            {
                Err(e) if is_busy(&e) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BUSY_RETRY_CAP);
                }
                other => return other,
            }
        }
        Err(Error::transient(format!(
            "lease contention on queue '{queue}', try again"
        )))
    }

    async fn ack(&self, lease_id: &str) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        let row: Option<(String, String)> =
            sqlx::query_as("DELETE FROM leases WHERE lease_id = $1 RETURNING queue, message_key")
                .bind(lease_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((queue, key)) = row else {
            return Err(Error::lease_not_found(lease_id));
        };

        sqlx::query(
            "UPDATE messages SET state = 'archived'
             WHERE queue = $1 AND key = $2 AND state = 'inflight'",
        )
        .bind(&queue)
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn nack(
        &self,
        lease_id: &str,
        reason: &str,
        requeue: bool,
    ) -> Result<NackDisposition, Error> {
        let mut tx = self.db.begin().await?;

        let row: Option<(String, String)> =
            sqlx::query_as("DELETE FROM leases WHERE lease_id = $1 RETURNING queue, message_key")
                .bind(lease_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((queue, key)) = row else {
            return Err(Error::lease_not_found(lease_id));
        };

        let msg: Option<MessageRow> = sqlx::query_as(
            "SELECT queue, key, message_id, payload, attributes, priority,
                    attempt, state, created_at_ms, available_at_ms
             FROM messages WHERE queue = $1 AND key = $2",
        )
        .bind(&queue)
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(msg) = msg else {
            return Err(Error::not_found(format!("message '{key}' in queue '{queue}'")));
        };

        let policy = {
            let stored: Option<(String,)> =
                sqlx::query_as("SELECT policy FROM queue_policies WHERE queue = $1")
                    .bind(&queue)
                    .fetch_optional(&mut *tx)
                    .await?;
            match stored {
                Some((json,)) => serde_json::from_str(&json)
                    .map_err(|e| Error::io(format!("corrupt policy for '{queue}': {e}")))?,
                None => self.defaults.clone(),
            }
        };

        let attempt = msg.attempt as u32;
        let now = now_ms();

        let disposition = if requeue && !policy.exhausted(attempt) {
            let delay_ms = policy.retry.delay_secs(attempt) as i64 * 1000;
            let available_at = now + delay_ms;
            let state = if available_at > now {
                MessageState::Delayed
            } else {
                MessageState::Ready
            };

            sqlx::query(
                "UPDATE messages SET state = $1, available_at_ms = $2
                 WHERE queue = $3 AND key = $4",
            )
            .bind(state.to_string())
            .bind(available_at)
            .bind(&queue)
            .bind(&key)
            .execute(&mut *tx)
            .await?;

            if state == MessageState::Delayed {
                NackDisposition::Delayed {
                    available_at_ms: available_at,
                }
            } else {
                NackDisposition::Requeued
            }
        } else if policy.dlq.enabled {
            let dlq_queue = policy.dlq.queue_for(&queue);
            let attributes = append_reason(&msg.attributes, reason);

            // A previous DLQ entry with the same key (reprocessed, then
            // failed again) is replaced by this one.
            sqlx::query("DELETE FROM messages WHERE queue = $1 AND key = $2")
                .bind(&dlq_queue)
                .bind(&key)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE messages
                 SET queue = $1, state = 'dlq', available_at_ms = $2, attributes = $3
                 WHERE queue = $4 AND key = $5",
            )
            .bind(&dlq_queue)
            .bind(now)
            .bind(&attributes)
            .bind(&queue)
            .bind(&key)
            .execute(&mut *tx)
            .await?;

            NackDisposition::DeadLettered
        } else {
            sqlx::query("DELETE FROM messages WHERE queue = $1 AND key = $2")
                .bind(&queue)
                .bind(&key)
                .execute(&mut *tx)
                .await?;

            NackDisposition::Dropped
        };

        tx.commit().await?;
        Ok(disposition)
    }

    async fn extend_lease(
        &self,
        lease_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<i64, Error> {
        let lease_until = now_ms() + visibility_timeout_sec as i64 * 1000;
        let res = sqlx::query("UPDATE leases SET lease_until_ms = $1 WHERE lease_id = $2")
            .bind(lease_until)
            .bind(lease_id)
            .execute(&self.db)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::lease_not_found(lease_id));
        }
        Ok(lease_until)
    }

    async fn expired_leases(&self, now_ms: i64, limit: u32) -> Result<Vec<LeaseToken>, Error> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT lease_id, queue, message_key, consumer_id, lease_until_ms
             FROM leases WHERE lease_until_ms < $1
             ORDER BY lease_until_ms LIMIT $2",
        )
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn load_policy(&self, queue: &str) -> Result<Option<QueuePolicy>, Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT policy FROM queue_policies WHERE queue = $1")
                .bind(queue)
                .fetch_optional(&self.db)
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
                Error::io(format!("corrupt policy for '{queue}': {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn save_policy(&self, queue: &str, policy: &QueuePolicy) -> Result<(), Error> {
        let json = serde_json::to_string(policy)
            .map_err(|e| Error::io(format!("serialize policy: {e}")))?;

        sqlx::query(
            "INSERT INTO queue_policies (queue, policy) VALUES ($1, $2)
             ON CONFLICT (queue) DO UPDATE SET policy = excluded.policy",
        )
        .bind(queue)
        .bind(json)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics, Error> {
        let now = now_ms();
        let (ready, inflight, delayed): (i64, i64, i64) = sqlx::query_as(
            "
            SELECT
                COUNT(CASE WHEN state = 'ready'
                           OR (state = 'delayed' AND available_at_ms <= $2) THEN 1 END),
                COUNT(CASE WHEN state = 'inflight' THEN 1 END),
                COUNT(CASE WHEN state = 'delayed' AND available_at_ms > $2 THEN 1 END)
            FROM messages WHERE queue = $1
            ",
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        let dlq_queue = self.policy_or_default(queue).await?.dlq.queue_for(queue);
        let dlq: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE queue = $1 AND state = 'dlq'",
        )
        .bind(&dlq_queue)
        .fetch_one(&self.db)
        .await?;

        Ok(QueueMetrics {
            ready: ready as u64,
            inflight: inflight as u64,
            delayed: delayed as u64,
            dlq: dlq as u64,
        })
    }

    async fn ready_depth(&self, queue: &str, priority: i32) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE queue = $1 AND priority = $2
               AND state IN ('ready', 'delayed') AND available_at_ms <= $3",
        )
        .bind(queue)
        .bind(priority as i64)
        .bind(now_ms())
        .fetch_one(&self.db)
        .await?;

        Ok(count as u64)
    }

    async fn list_dlq(&self, queue: &str, max: u32) -> Result<Vec<MessageEnvelope>, Error> {
        let dlq_queue = self.policy_or_default(queue).await?.dlq.queue_for(queue);

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT queue, key, message_id, payload, attributes, priority,
                    attempt, state, created_at_ms, available_at_ms
             FROM messages WHERE queue = $1 AND state = 'dlq'
             ORDER BY available_at_ms, created_at_ms, key LIMIT $2",
        )
        .bind(&dlq_queue)
        .bind(max as i64)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(MessageRow::into_envelope).collect()
    }

    async fn reprocess_dlq(&self, queue: &str, up_to: u32) -> Result<u64, Error> {
        let dlq_queue = self.policy_or_default(queue).await?.dlq.queue_for(queue);
        let now = now_ms();

        let mut tx = self.db.begin().await?;

        let keys: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM messages WHERE queue = $1 AND state = 'dlq'
             ORDER BY available_at_ms, created_at_ms, key LIMIT $2",
        )
        .bind(&dlq_queue)
        .bind(up_to as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = 0u64;
        for (key,) in keys {
            // The origin slot may have been refilled with the same key in
            // the meantime; such entries stay in the DLQ.
            let occupied: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM messages WHERE queue = $1 AND key = $2")
                    .bind(queue)
                    .bind(&key)
                    .fetch_optional(&mut *tx)
                    .await?;
            if occupied.is_some() {
                continue;
            }

            sqlx::query(
                "UPDATE messages
                 SET queue = $1, state = 'ready', attempt = 0, available_at_ms = $2
                 WHERE queue = $3 AND key = $4",
            )
            .bind(queue)
            .bind(now)
            .bind(&dlq_queue)
            .bind(&key)
            .execute(&mut *tx)
            .await?;
            moved += 1;
        }

        tx.commit().await?;
        Ok(moved)
    }
}

fn parse_journal_mode(value: &str) -> Result<SqliteJournalMode, Error> {
    match value.to_ascii_lowercase().as_str() {
        "wal" => Ok(SqliteJournalMode::Wal),
        "delete" => Ok(SqliteJournalMode::Delete),
        "truncate" => Ok(SqliteJournalMode::Truncate),
        "persist" => Ok(SqliteJournalMode::Persist),
        "memory" => Ok(SqliteJournalMode::Memory),
        "off" => Ok(SqliteJournalMode::Off),
        other => Err(Error::invalid_request(format!(
            "unknown journal mode '{other}'"
        ))),
    }
}

fn parse_synchronous(value: &str) -> Result<SqliteSynchronous, Error> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Ok(SqliteSynchronous::Off),
        "normal" => Ok(SqliteSynchronous::Normal),
        "full" => Ok(SqliteSynchronous::Full),
        "extra" => Ok(SqliteSynchronous::Extra),
        other => Err(Error::invalid_request(format!(
            "unknown synchronous mode '{other}'"
        ))),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

fn is_busy(e: &Error) -> bool {
    match e {
        Error::Sqlx {
            source: sqlx::Error::Database(db),
        } => {
            let msg = db.message();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

/// Merge the DLQ routing reason into the message's attribute object. An
/// attribute blob that is not a JSON object is replaced wholesale.
pub(crate) fn append_reason(attributes: &str, reason: &str) -> String {
    let mut value: serde_json::Value =
        serde_json::from_str(attributes).unwrap_or_else(|_| serde_json::json!({}));
    if !value.is_object() {
        value = serde_json::json!({});
    }
    value["reason"] = serde_json::Value::String(reason.to_owned());
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_reason_merges_into_object() {
        let out = append_reason(r#"{"tenant":"a"}"#, "lease expired");
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["tenant"], "a");
        assert_eq!(v["reason"], "lease expired");
    }

    #[test]
    fn append_reason_replaces_non_object() {
        let out = append_reason("not json", "retries exhausted");
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["reason"], "retries exhausted");
    }
}
