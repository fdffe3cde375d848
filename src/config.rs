//! Broker configuration.
//!
//! Loaded from a JSON file into strongly-typed structs; every key is
//! optional and falls back to the constants in [`defaults`]. Relative paths
//! (database file, data/log/mailbox roots) resolve against the directory
//! containing the config file. CLI flags override file values after loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::QueuePolicy;
use crate::validator::MessageSchema;

pub mod defaults {
    pub const NODE_ID: &str = "dropq-1";
    pub const SCHEMA_VERSION: &str = "1";
    pub const DATA_ROOT: &str = "./data";
    pub const LOG_ROOT: &str = "./logs";
    pub const DB_PATH: &str = "./data/dropq.db";
    pub const BUSY_TIMEOUT_MS: u64 = 5_000;
    pub const JOURNAL_MODE: &str = "WAL";
    pub const SYNCHRONOUS: &str = "NORMAL";
    pub const MAX_CONNECTIONS: u32 = 8;
    pub const FS_ROOT: &str = "./data/queues";
    pub const MAILBOX_ROOT: &str = "./data/mailbox";
    pub const MAILBOX_TIMEOUT_MS: u64 = 30_000;
    pub const WORKER_COUNT: usize = 4;
    pub const STALE_REQUEST_TTL_SEC: u64 = 300;
    pub const STALE_RESPONSE_TTL_SEC: u64 = 3_600;
    pub const SCAN_INTERVAL_MS: u64 = 2_000;
    pub const PENDING_CAPACITY: usize = 1_024;
    pub const SWEEP_INTERVAL_MS: u64 = 1_000;
    pub const MAX_READY_PER_PRIORITY: u64 = 100_000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Filesystem,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    pub data_root: String,
    pub log_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: defaults::DATA_ROOT.into(),
            log_root: defaults::LOG_ROOT.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqliteConfig {
    pub db_path: String,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
    pub synchronous: String,
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: defaults::DB_PATH.into(),
            busy_timeout_ms: defaults::BUSY_TIMEOUT_MS,
            journal_mode: defaults::JOURNAL_MODE.into(),
            synchronous: defaults::SYNCHRONOUS.into(),
            max_connections: defaults::MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilesystemConfig {
    pub root: String,
    pub inbox_dir: String,
    pub processing_dir: String,
    pub archive_dir: String,
    pub dlq_dir: String,
    pub meta_dir: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root: defaults::FS_ROOT.into(),
            inbox_dir: "inbox".into(),
            processing_dir: "processing".into(),
            archive_dir: "archive".into(),
            dlq_dir: "dlq".into(),
            meta_dir: "meta".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailboxConfig {
    pub root: String,
    pub requests_dir: String,
    pub processing_dir: String,
    pub responses_dir: String,
    pub dead_dir: String,
    pub timeout_ms: u64,
    pub worker_count: usize,
    pub stale_request_ttl_sec: u64,
    pub stale_response_ttl_sec: u64,
    /// Fallback rescan cadence when no watcher events arrive.
    pub scan_interval_ms: u64,
    /// Bound on the pending-request queue between discovery and workers.
    pub pending_capacity: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            root: defaults::MAILBOX_ROOT.into(),
            requests_dir: "requests".into(),
            processing_dir: "processing".into(),
            responses_dir: "responses".into(),
            dead_dir: "dead".into(),
            timeout_ms: defaults::MAILBOX_TIMEOUT_MS,
            worker_count: defaults::WORKER_COUNT,
            stale_request_ttl_sec: defaults::STALE_REQUEST_TTL_SEC,
            stale_response_ttl_sec: defaults::STALE_RESPONSE_TTL_SEC,
            scan_interval_ms: defaults::SCAN_INTERVAL_MS,
            pending_capacity: defaults::PENDING_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseConfig {
    pub visibility_timeout_sec: u32,
    pub sweep_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_sec: 30,
            sweep_interval_ms: defaults::SWEEP_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackpressureConfig {
    /// Ready-message threshold per (queue, priority); 0 disables the check.
    pub max_ready_per_priority: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_ready_per_priority: defaults::MAX_READY_PER_PRIORITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub policy: Option<QueuePolicy>,
    #[serde(default)]
    pub message_schema: Option<MessageSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub schema_version: Option<String>,
    pub node_id: Option<String>,
    pub backend: Option<BackendKind>,
    pub paths: PathsConfig,
    pub sqlite: SqliteConfig,
    pub filesystem: FilesystemConfig,
    pub mailbox: MailboxConfig,
    pub lease: LeaseConfig,
    pub policy_defaults: QueuePolicy,
    pub backpressure: BackpressureConfig,
    pub queues: Vec<QueueConfig>,
    pub write_console_log: Option<bool>,
    pub write_file_log: Option<bool>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::io(format!("config {}: {e}", path.display()))
        })?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::invalid_request(format!("config parse error: {e}")))?;

        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }

        Ok(config)
    }

    /// Rebase relative paths onto the config file's directory, the way the
    /// process would see them regardless of its own working directory.
    fn resolve_paths(&mut self, base: &Path) {
        self.sqlite.db_path = resolve(base, &self.sqlite.db_path);
        self.filesystem.root = resolve(base, &self.filesystem.root);
        self.mailbox.root = resolve(base, &self.mailbox.root);
        self.paths.data_root = resolve(base, &self.paths.data_root);
        self.paths.log_root = resolve(base, &self.paths.log_root);
    }

    pub fn node_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or(defaults::NODE_ID)
    }

    pub fn schema_version(&self) -> &str {
        self.schema_version
            .as_deref()
            .unwrap_or(defaults::SCHEMA_VERSION)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.unwrap_or(BackendKind::Sqlite)
    }

    pub fn write_console_log(&self) -> bool {
        self.write_console_log.unwrap_or(true)
    }

    pub fn write_file_log(&self) -> bool {
        self.write_file_log.unwrap_or(false)
    }
}

fn resolve(base: &Path, input: &str) -> String {
    if input.is_empty() {
        return input.to_owned();
    }
    let target = Path::new(input);
    if target.is_relative() {
        base.join(target).to_string_lossy().into_owned()
    } else {
        input.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gets_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backend(), BackendKind::Sqlite);
        assert_eq!(config.lease.visibility_timeout_sec, 30);
        assert_eq!(config.mailbox.worker_count, defaults::WORKER_COUNT);
        assert_eq!(config.policy_defaults.retry.limit, 3);
        assert!(config.queues.is_empty());
    }

    #[test]
    fn camel_case_keys_are_honored() {
        let config: Config = serde_json::from_str(
            r#"{
                "nodeId": "node-7",
                "backend": "filesystem",
                "lease": {"visibilityTimeoutSec": 5, "sweepIntervalMs": 250},
                "mailbox": {"workerCount": 2, "staleRequestTtlSec": 60},
                "queues": [{"name": "orders"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.node_id(), "node-7");
        assert_eq!(config.backend(), BackendKind::Filesystem);
        assert_eq!(config.lease.visibility_timeout_sec, 5);
        assert_eq!(config.lease.sweep_interval_ms, 250);
        assert_eq!(config.mailbox.worker_count, 2);
        assert_eq!(config.mailbox.stale_request_ttl_sec, 60);
        assert_eq!(config.queues[0].name, "orders");
        assert!(config.queues[0].policy.is_none());
    }

    #[test]
    fn relative_paths_rebase_on_config_dir() {
        let mut config = Config::default();
        config.sqlite.db_path = "data/dropq.db".into();
        config.mailbox.root = "/var/mailbox".into();
        config.resolve_paths(Path::new("/etc/dropq"));
        assert_eq!(config.sqlite.db_path, "/etc/dropq/data/dropq.db");
        assert_eq!(config.mailbox.root, "/var/mailbox");
    }
}
