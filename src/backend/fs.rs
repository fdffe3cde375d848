//! Filesystem backend.
//!
//! Each queue is a directory tree: `inbox/` holds ready and delayed
//! envelopes, `processing/<lease_id>/` holds inflight envelopes next to a
//! lease descriptor, `archive/` holds acked envelopes, `dlq/` the
//! dead-lettered ones, and `meta/` the policy, key markers, and lockfile.
//!
//! The envelope filename encodes `(priority, available_at_ms,
//! created_at_ms, key)` so a plain lexicographic directory scan yields
//! eligibility order. Leasing is a rename from `inbox/` into the lease's
//! processing directory; the rename is the atomic commit, so two concurrent
//! consumers can race for the same file and exactly one wins.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::FilesystemConfig;
use crate::envelope::{
    now_ms, LeaseToken, MessageEnvelope, MessageState, NackDisposition, QueueMetrics,
};
use crate::error::Error;
use crate::policy::QueuePolicy;

use super::Backend;

const LEASE_FILE: &str = "lease.json";
const POLICY_FILE: &str = "policy.json";
const KEYS_DIR: &str = "keys";
const LOCK_FILE: &str = "queue.lock";
const LOCK_RETRIES: u32 = 200;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);

pub struct FsBackend {
    root: PathBuf,
    layout: FilesystemConfig,
    defaults: QueuePolicy,
}

impl FsBackend {
    pub async fn open(config: &FilesystemConfig, defaults: QueuePolicy) -> Result<Self, Error> {
        let root = PathBuf::from(&config.root);
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("create {}: {e}", root.display())))?;

        Ok(Self {
            root,
            layout: config.clone(),
            defaults,
        })
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(escape(queue))
    }

    fn inbox(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join(&self.layout.inbox_dir)
    }

    fn processing(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join(&self.layout.processing_dir)
    }

    fn archive(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join(&self.layout.archive_dir)
    }

    fn dlq(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join(&self.layout.dlq_dir)
    }

    fn meta(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join(&self.layout.meta_dir)
    }

    fn ensure_queue(&self, queue: &str) -> Result<(), Error> {
        for dir in [
            self.inbox(queue),
            self.processing(queue),
            self.archive(queue),
            self.dlq(queue),
            self.meta(queue).join(KEYS_DIR),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::io(format!("create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    async fn lock_queue(&self, queue: &str) -> Result<QueueLock, Error> {
        QueueLock::acquire(self.meta(queue).join(LOCK_FILE)).await
    }

    /// Names of the queues currently on disk.
    fn queues(&self) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(unescape(name));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Sorted envelope filenames in a directory, ignoring in-progress
    /// temporary files.
    fn scan_sorted(dir: &Path) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(".tmp.") && name.ends_with(".json") {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_envelope(path: &Path) -> Result<MessageEnvelope, Error> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::io(format!("corrupt envelope {}: {e}", path.display())))
    }

    /// Find the processing directory holding `lease_id`, across queues.
    fn find_processing(&self, lease_id: &str) -> Result<Option<(String, PathBuf)>, Error> {
        for queue in self.queues()? {
            let dir = self.processing(&queue).join(lease_id);
            if dir.is_dir() {
                return Ok(Some((queue, dir)));
            }
        }
        Ok(None)
    }

    /// The envelope file inside a processing directory (the only `.json`
    /// besides the lease descriptor).
    fn processing_envelope(dir: &Path) -> Result<Option<PathBuf>, Error> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name != LEASE_FILE && name.ends_with(".json") && !name.starts_with(".tmp.") {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    fn read_lease(dir: &Path) -> Result<Option<LeaseToken>, Error> {
        let path = dir.join(LEASE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                Error::io(format!("corrupt lease {}: {e}", path.display()))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn policy_or_default(&self, queue: &str) -> Result<QueuePolicy, Error> {
        let path = self.meta(queue).join(POLICY_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::io(format!("corrupt policy {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(self.defaults.clone()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a nacked or expired inflight message out of its processing
    /// directory, applying retry backoff or dead-letter routing.
    fn resolve_negative(
        &self,
        queue: &str,
        proc_dir: &Path,
        reason: &str,
        requeue: bool,
    ) -> Result<NackDisposition, Error> {
        let Some(envelope_path) = Self::processing_envelope(proc_dir)? else {
            return Err(Error::io(format!(
                "processing dir {} has no envelope",
                proc_dir.display()
            )));
        };
        let mut envelope = Self::read_envelope(&envelope_path)?;
        let policy = self.policy_or_default(queue)?;
        let now = now_ms();

        let disposition = if requeue && !policy.exhausted(envelope.attempt) {
            let delay_ms = policy.retry.delay_secs(envelope.attempt) as i64 * 1000;
            envelope.available_at_ms = now + delay_ms;
            envelope.state = if envelope.available_at_ms > now {
                MessageState::Delayed
            } else {
                MessageState::Ready
            };

            let target = self.inbox(queue).join(envelope_file_name(&envelope));
            atomic_write_json(&target, &envelope)?;

            if envelope.state == MessageState::Delayed {
                NackDisposition::Delayed {
                    available_at_ms: envelope.available_at_ms,
                }
            } else {
                NackDisposition::Requeued
            }
        } else if policy.dlq.enabled {
            envelope.state = MessageState::Dlq;
            envelope.available_at_ms = now;
            envelope.attributes = super::sqlite::append_reason(&envelope.attributes, reason);

            let dlq_dir = self.dlq(queue);
            // Replace any older dead-lettered entry for the same key.
            let suffix = format!("-{}.json", escape(&envelope.key));
            for stale in Self::scan_sorted(&dlq_dir)? {
                if stale.ends_with(&suffix) {
                    let _ = std::fs::remove_file(dlq_dir.join(stale));
                }
            }

            atomic_write_json(&dlq_dir.join(envelope_file_name(&envelope)), &envelope)?;

            // The move into the DLQ vacates the origin queue's key slot,
            // exactly as the SQL backend's queue-column update does; a
            // later enqueue may reuse the key.
            let marker = self.meta(queue).join(KEYS_DIR).join(escape(&envelope.key));
            let _ = std::fs::remove_file(marker);
            NackDisposition::DeadLettered
        } else {
            let marker = self.meta(queue).join(KEYS_DIR).join(escape(&envelope.key));
            let _ = std::fs::remove_file(marker);
            NackDisposition::Dropped
        };

        std::fs::remove_file(&envelope_path)?;
        let _ = std::fs::remove_file(proc_dir.join(LEASE_FILE));
        let _ = std::fs::remove_dir(proc_dir);

        Ok(disposition)
    }
}

#[async_trait]
impl Backend for FsBackend {
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn enqueue(&self, envelope: &MessageEnvelope) -> Result<(), Error> {
        self.ensure_queue(&envelope.queue)?;

        let marker = self
            .meta(&envelope.queue)
            .join(KEYS_DIR)
            .join(escape(&envelope.key));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::conflict(format!(
                    "duplicate key '{}' in queue '{}'",
                    envelope.key, envelope.queue
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let mut stored = envelope.clone();
        stored.state = if stored.available_at_ms > now_ms() {
            MessageState::Delayed
        } else {
            MessageState::Ready
        };

        let target = self.inbox(&envelope.queue).join(envelope_file_name(&stored));
        if let Err(e) = atomic_write_json(&target, &stored) {
            let _ = std::fs::remove_file(&marker);
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
        self.ensure_queue(queue)?;
        let inbox = self.inbox(queue);
        let now = now_ms();

        for name in Self::scan_sorted(&inbox)? {
            let Some(parsed) = parse_file_name(&name) else {
                continue;
            };
            if parsed.available_at_ms > now {
                continue;
            }

            let lease_id = uuid::Uuid::new_v4().to_string();
            let proc_dir = self.processing(queue).join(&lease_id);
            std::fs::create_dir_all(&proc_dir)?;

            let claimed = proc_dir.join(&name);
            match std::fs::rename(inbox.join(&name), &claimed) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Another consumer won the rename; try the next one.
                    let _ = std::fs::remove_dir(&proc_dir);
                    continue;
                }
                Err(e) => {
                    let _ = std::fs::remove_dir(&proc_dir);
                    return Err(e.into());
                }
            }

            let mut envelope = Self::read_envelope(&claimed)?;
            envelope.attempt += 1;
            envelope.state = MessageState::Inflight;
            atomic_write_json(&claimed, &envelope)?;

            let lease = LeaseToken {
                lease_id: lease_id.clone(),
                queue: queue.to_owned(),
                message_key: envelope.key.clone(),
                consumer_id: consumer_id.to_owned(),
                lease_until_ms: now + visibility_timeout_sec as i64 * 1000,
            };
            atomic_write_json(&proc_dir.join(LEASE_FILE), &lease)?;

            return Ok(Some((envelope, lease)));
        }

        Ok(None)
    }

    async fn ack(&self, lease_id: &str) -> Result<(), Error> {
        let Some((queue, proc_dir)) = self.find_processing(lease_id)? else {
            return Err(Error::lease_not_found(lease_id));
        };
        let _lock = self.lock_queue(&queue).await?;

        let Some(envelope_path) = Self::processing_envelope(&proc_dir)? else {
            return Err(Error::io(format!(
                "processing dir {} has no envelope",
                proc_dir.display()
            )));
        };

        let mut envelope = Self::read_envelope(&envelope_path)?;
        envelope.state = MessageState::Archived;
        atomic_write_json(
            &self.archive(&queue).join(envelope_file_name(&envelope)),
            &envelope,
        )?;

        std::fs::remove_file(&envelope_path)?;
        let _ = std::fs::remove_file(proc_dir.join(LEASE_FILE));
        let _ = std::fs::remove_dir(&proc_dir);
        Ok(())
    }

    async fn nack(
        &self,
        lease_id: &str,
        reason: &str,
        requeue: bool,
    ) -> Result<NackDisposition, Error> {
        let Some((queue, proc_dir)) = self.find_processing(lease_id)? else {
            return Err(Error::lease_not_found(lease_id));
        };
        let _lock = self.lock_queue(&queue).await?;
        self.resolve_negative(&queue, &proc_dir, reason, requeue)
    }

    async fn extend_lease(
        &self,
        lease_id: &str,
        visibility_timeout_sec: u32,
    ) -> Result<i64, Error> {
        let Some((_queue, proc_dir)) = self.find_processing(lease_id)? else {
            return Err(Error::lease_not_found(lease_id));
        };
        let Some(mut lease) = Self::read_lease(&proc_dir)? else {
            return Err(Error::lease_not_found(lease_id));
        };

        lease.lease_until_ms = now_ms() + visibility_timeout_sec as i64 * 1000;
        atomic_write_json(&proc_dir.join(LEASE_FILE), &lease)?;
        Ok(lease.lease_until_ms)
    }

    async fn expired_leases(&self, now_ms: i64, limit: u32) -> Result<Vec<LeaseToken>, Error> {
        let mut out = Vec::new();
        'queues: for queue in self.queues()? {
            let processing = self.processing(&queue);
            let entries = match std::fs::read_dir(&processing) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let dir = entry.path();
                let lease = match Self::read_lease(&dir)? {
                    Some(lease) => lease,
                    // A crash between claim and descriptor write left an
                    // orphan; surface it as immediately expired.
                    None => {
                        let key = Self::processing_envelope(&dir)?
                            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                            .and_then(|n| parse_file_name(&n).map(|p| p.key))
                            .unwrap_or_default();
                        LeaseToken {
                            lease_id: entry.file_name().to_string_lossy().into_owned(),
                            queue: queue.clone(),
                            message_key: key,
                            consumer_id: String::new(),
                            lease_until_ms: 0,
                        }
                    }
                };

                if lease.lease_until_ms < now_ms {
                    out.push(lease);
                    if out.len() >= limit as usize {
                        break 'queues;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn load_policy(&self, queue: &str) -> Result<Option<QueuePolicy>, Error> {
        let path = self.meta(queue).join(POLICY_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                Error::io(format!("corrupt policy {}: {e}", path.display()))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_policy(&self, queue: &str, policy: &QueuePolicy) -> Result<(), Error> {
        self.ensure_queue(queue)?;
        atomic_write_json(&self.meta(queue).join(POLICY_FILE), policy)
    }

    async fn metrics(&self, queue: &str) -> Result<QueueMetrics, Error> {
        let now = now_ms();
        let mut metrics = QueueMetrics::default();

        for name in Self::scan_sorted(&self.inbox(queue))? {
            match parse_file_name(&name) {
                Some(p) if p.available_at_ms > now => metrics.delayed += 1,
                Some(_) => metrics.ready += 1,
                None => {}
            }
        }

        let processing = self.processing(queue);
        if let Ok(entries) = std::fs::read_dir(&processing) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    metrics.inflight += 1;
                }
            }
        }

        metrics.dlq = Self::scan_sorted(&self.dlq(queue))?.len() as u64;
        Ok(metrics)
    }

    async fn ready_depth(&self, queue: &str, priority: i32) -> Result<u64, Error> {
        let now = now_ms();
        let mut depth = 0;
        for name in Self::scan_sorted(&self.inbox(queue))? {
            if let Some(p) = parse_file_name(&name) {
                if p.priority == priority && p.available_at_ms <= now {
                    depth += 1;
                }
            }
        }
        Ok(depth)
    }

    async fn list_dlq(&self, queue: &str, max: u32) -> Result<Vec<MessageEnvelope>, Error> {
        let dlq = self.dlq(queue);
        let mut out = Vec::new();
        for name in Self::scan_sorted(&dlq)?.into_iter().take(max as usize) {
            out.push(Self::read_envelope(&dlq.join(name))?);
        }
        Ok(out)
    }

    async fn reprocess_dlq(&self, queue: &str, up_to: u32) -> Result<u64, Error> {
        self.ensure_queue(queue)?;
        let _lock = self.lock_queue(queue).await?;

        let dlq = self.dlq(queue);
        let now = now_ms();
        let mut moved = 0u64;

        for name in Self::scan_sorted(&dlq)?.into_iter().take(up_to as usize) {
            let path = dlq.join(&name);
            let mut envelope = Self::read_envelope(&path)?;

            // The origin slot may have been refilled with the same key in
            // the meantime; such entries stay in the DLQ.
            let marker = self.meta(queue).join(KEYS_DIR).join(escape(&envelope.key));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
            {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }

            envelope.attempt = 0;
            envelope.state = MessageState::Ready;
            envelope.available_at_ms = now;

            atomic_write_json(
                &self.inbox(queue).join(envelope_file_name(&envelope)),
                &envelope,
            )?;
            std::fs::remove_file(&path)?;
            moved += 1;
        }
        Ok(moved)
    }
}

// ── Filename encoding ─────────────────────────────────────────────────────

struct ParsedName {
    priority: i32,
    available_at_ms: i64,
    #[allow(dead_code)]
    created_at_ms: i64,
    key: String,
}

/// `{priority}-{available_at}-{created_at}-{key}.json`, each numeric field
/// zero-padded so lexicographic order equals eligibility order. Priority is
/// offset-encoded to keep negative values sortable.
fn envelope_file_name(envelope: &MessageEnvelope) -> String {
    format!(
        "{:010}-{:020}-{:020}-{}.json",
        priority_sort_key(envelope.priority),
        envelope.available_at_ms.max(0),
        envelope.created_at_ms.max(0),
        escape(&envelope.key)
    )
}

fn priority_sort_key(priority: i32) -> u64 {
    (priority as i64 - i32::MIN as i64) as u64
}

fn parse_file_name(name: &str) -> Option<ParsedName> {
    let stem = name.strip_suffix(".json")?;
    let mut parts = stem.splitn(4, '-');
    let priority = parts.next()?.parse::<u64>().ok()?;
    let available = parts.next()?.parse::<i64>().ok()?;
    let created = parts.next()?.parse::<i64>().ok()?;
    let key = parts.next()?;
    Some(ParsedName {
        priority: (priority as i64 + i32::MIN as i64) as i32,
        available_at_ms: available,
        created_at_ms: created,
        key: unescape(key),
    })
}

/// Injective escaping of arbitrary names into path-safe form: bytes outside
/// `[A-Za-z0-9._]` become `%XX`.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' => out.push(b as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn unescape(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(hex) = name.get(i + 1..i + 3) {
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Atomic writes and locking ─────────────────────────────────────────────

/// Write-to-temp, fsync, rename. Readers never observe a torn file.
pub(crate) fn atomic_write_bytes(target: &Path, data: &[u8]) -> Result<(), Error> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::io(format!("no parent dir for {}", target.display())))?;
    let tmp = parent.join(format!(".tmp.{}", uuid::Uuid::new_v4()));

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp, target) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn atomic_write_json<T: serde::Serialize>(target: &Path, value: &T) -> Result<(), Error> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::io(format!("serialize {}: {e}", target.display())))?;
    atomic_write_bytes(target, &data)
}

/// Per-queue lockfile serializing multi-step maintenance. Released on drop.
struct QueueLock {
    path: PathBuf,
}

impl QueueLock {
    async fn acquire(path: PathBuf) -> Result<Self, Error> {
        for _ in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::transient(format!(
            "queue lock {} is held, try again",
            path.display()
        )))
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(priority: i32, available_at_ms: i64, created_at_ms: i64, key: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: "m".into(),
            key: key.into(),
            queue: "q".into(),
            payload: "{}".into(),
            attributes: "{}".into(),
            priority,
            attempt: 0,
            state: MessageState::Ready,
            created_at_ms,
            available_at_ms,
        }
    }

    #[test]
    fn filename_sorts_by_priority_then_time() {
        let high = envelope_file_name(&envelope(1, 50, 1, "b"));
        let low = envelope_file_name(&envelope(5, 10, 1, "a"));
        let earlier = envelope_file_name(&envelope(1, 40, 1, "c"));
        assert!(high < low, "lower numeric priority must sort first");
        assert!(earlier < high, "earlier availability wins within a priority");
    }

    #[test]
    fn negative_priority_sorts_before_zero() {
        let urgent = envelope_file_name(&envelope(-3, 10, 1, "a"));
        let normal = envelope_file_name(&envelope(0, 10, 1, "b"));
        assert!(urgent < normal);
    }

    #[test]
    fn filename_round_trips_fields() {
        let e = envelope(-7, 1_700_000_000_123, 1_700_000_000_000, "order-42/x");
        let name = envelope_file_name(&e);
        let parsed = parse_file_name(&name).unwrap();
        assert_eq!(parsed.priority, -7);
        assert_eq!(parsed.available_at_ms, 1_700_000_000_123);
        assert_eq!(parsed.key, "order-42/x");
    }

    #[test]
    fn escape_is_injective_for_awkward_keys() {
        let a = escape("a-b");
        let b = escape("a%2Db");
        assert_ne!(a, b);
        assert_eq!(unescape(&a), "a-b");
        assert_eq!(unescape(&b), "a%2Db");
    }

    #[test]
    fn tmp_files_are_invisible_to_scans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".tmp.abc"), b"partial").unwrap();
        std::fs::write(
            dir.path().join("0000000000-0-0-k.json"),
            b"{}",
        )
        .unwrap();
        // Only well-formed, fully-renamed envelope files are considered.
        let names = FsBackend::scan_sorted(dir.path()).unwrap();
        assert_eq!(names.len(), 1);
    }
}
