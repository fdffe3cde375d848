//! The queue manager: a typed, policy-aware facade over the backend.
//!
//! Holds the read-mostly policy cache, assigns message identities, applies
//! backpressure at enqueue, and drives the time-based transitions the
//! sweeper asks for. All durable state stays behind the backend; the
//! manager never keeps message state in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::backend::Backend;
use crate::config::BackpressureConfig;
use crate::envelope::{
    now_ms, LeaseToken, MessageEnvelope, MessageState, NackDisposition, QueueMetrics,
};
use crate::error::Error;
use crate::policy::QueuePolicy;

pub struct EnqueueRequest {
    pub queue: String,
    pub payload: String,
    pub attributes: Option<String>,
    pub priority: i32,
    pub delay_ms: Option<i64>,
    /// Idempotency key; defaults to the assigned message id.
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub name: String,
    #[serde(flatten)]
    pub metrics: QueueMetrics,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub uptime_ms: u64,
    pub queues: Vec<QueueStatus>,
}

pub struct QueueManager {
    backend: Arc<dyn Backend>,
    policies: RwLock<HashMap<String, QueuePolicy>>,
    defaults: QueuePolicy,
    backpressure: BackpressureConfig,
    started_at: Instant,
    /// Messages deleted because retries ran out with no DLQ configured.
    dropped: AtomicU64,
}

impl QueueManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        defaults: QueuePolicy,
        backpressure: BackpressureConfig,
    ) -> Self {
        Self {
            backend,
            policies: RwLock::new(HashMap::new()),
            defaults,
            backpressure,
            started_at: Instant::now(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn registered_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cache the policy and make sure the backend has it persisted.
    pub async fn register_queue(&self, name: &str, policy: QueuePolicy) -> Result<(), Error> {
        self.backend.save_policy(name, &policy).await?;
        self.policies.write().insert(name.to_owned(), policy);
        Ok(())
    }

    pub async fn update_policy(&self, name: &str, policy: QueuePolicy) -> Result<(), Error> {
        self.register_queue(name, policy).await
    }

    /// Effective policy for a queue: cache, then backend, then defaults.
    /// Unregistered queues are served with the default policy, so producers
    /// do not have to pre-declare every queue.
    pub async fn policy(&self, queue: &str) -> Result<QueuePolicy, Error> {
        if let Some(policy) = self.policies.read().get(queue) {
            return Ok(policy.clone());
        }
        if let Some(policy) = self.backend.load_policy(queue).await? {
            self.policies.write().insert(queue.to_owned(), policy.clone());
            return Ok(policy);
        }
        Ok(self.defaults.clone())
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<String, Error> {
        if request.queue.is_empty() {
            return Err(Error::invalid_request("queue name must not be empty"));
        }

        let threshold = self.backpressure.max_ready_per_priority;
        if threshold > 0 {
            let depth = self
                .backend
                .ready_depth(&request.queue, request.priority)
                .await?;
            if depth >= threshold {
                return Err(Error::backpressure(format!(
                    "queue '{}' priority {} has {depth} ready messages",
                    request.queue, request.priority
                )));
            }
        }

        let now = now_ms();
        let message_id = uuid::Uuid::new_v4().to_string();
        let delay = request.delay_ms.unwrap_or(0).max(0);
        let available_at_ms = now + delay;

        let envelope = MessageEnvelope {
            key: request.key.unwrap_or_else(|| message_id.clone()),
            message_id: message_id.clone(),
            queue: request.queue,
            payload: request.payload,
            attributes: request.attributes.unwrap_or_else(|| "{}".to_owned()),
            priority: request.priority,
            attempt: 0,
            state: if delay > 0 {
                MessageState::Delayed
            } else {
                MessageState::Ready
            },
            created_at_ms: now,
            available_at_ms,
        };

        self.backend.enqueue(&envelope).await?;
        Ok(message_id)
    }

    /// Lease the next eligible message, using the queue policy's visibility
    /// timeout unless the consumer asked for a specific one.
    pub async fn lease_next(
        &self,
        queue: &str,
        consumer_id: &str,
        visibility_override: Option<u32>,
    ) -> Result<Option<(MessageEnvelope, LeaseToken)>, Error> {
        let visibility = match visibility_override {
            Some(v) => v,
            None => self.policy(queue).await?.visibility_timeout_sec,
        };
        self.backend.lease_next(queue, consumer_id, visibility).await
    }

    pub async fn ack(&self, lease_id: &str) -> Result<(), Error> {
        self.backend.ack(lease_id).await
    }

    pub async fn nack(
        &self,
        lease_id: &str,
        reason: Option<&str>,
        requeue: bool,
    ) -> Result<NackDisposition, Error> {
        let disposition = self
            .backend
            .nack(lease_id, reason.unwrap_or("nack"), requeue)
            .await?;
        if disposition == NackDisposition::Dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(disposition)
    }

    pub async fn extend_lease(
        &self,
        lease_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<i64, Error> {
        self.backend
            .extend_lease(lease_id, visibility_timeout_sec)
            .await
    }

    pub async fn list_dlq(&self, queue: &str, max: u32) -> Result<Vec<MessageEnvelope>, Error> {
        self.backend.list_dlq(queue, max).await
    }

    pub async fn reprocess_dlq(&self, queue: &str, up_to: u32) -> Result<u64, Error> {
        self.backend.reprocess_dlq(queue, up_to).await
    }

    pub async fn metrics(&self, queue: &str) -> Result<QueueMetrics, Error> {
        self.backend.metrics(queue).await
    }

    pub fn health(&self) -> bool {
        true
    }

    pub async fn status(&self) -> Result<StatusReport, Error> {
        let mut queues = Vec::new();
        for name in self.registered_queues() {
            let metrics = self.backend.metrics(&name).await?;
            queues.push(QueueStatus { name, metrics });
        }
        Ok(StatusReport {
            uptime_ms: self.uptime_ms(),
            queues,
        })
    }

    /// One sweep pass: every lease past its deadline is resolved as a nack
    /// with requeue, which applies the queue's backoff and DLQ rules.
    /// Returns how many leases were reclaimed.
    pub async fn sweep_expired(&self, limit: u32) -> Result<u64, Error> {
        let expired = self.backend.expired_leases(now_ms(), limit).await?;
        let mut reclaimed = 0u64;

        for lease in expired {
            match self
                .backend
                .nack(&lease.lease_id, "lease expired", true)
                .await
            {
                Ok(disposition) => {
                    if disposition == NackDisposition::Dropped {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::debug!(
                        lease_id = %lease.lease_id,
                        queue = %lease.queue,
                        ?disposition,
                        "reclaimed expired lease"
                    );
                    reclaimed += 1;
                }
                // The consumer resolved it between the scan and the nack.
                Err(Error::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(lease_id = %lease.lease_id, error = %e, "failed to reclaim lease");
                }
            }
        }

        Ok(reclaimed)
    }
}
