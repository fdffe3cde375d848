//! Drop-box IPC over a shared directory tree.
//!
//! - `protocol` — request/response wire types and command parsing
//! - `fsio`     — atomic writes, claim renames, dead-letter moves
//! - `watcher`  — event-driven request discovery with rescan fallback
//! - `handler`  — worker pool, dispatch, and stale cleanup

pub mod fsio;
pub mod handler;
pub mod protocol;
pub mod watcher;

pub use handler::{MailboxHandler, MailboxTasks};
pub use protocol::{Command, MailboxRequest, MailboxResponse};
