//! File operations behind the drop-box protocol.
//!
//! Both sides of the protocol follow the same atomic write discipline:
//! write to `<target>.tmp.<unique>`, fsync, rename. A reader can therefore
//! never observe a partially-written request or response. Claiming a
//! request is a rename into `processing/`; under duplicate discovery the
//! second rename fails and the loser walks away.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;

use crate::error::Error;

/// Atomic write: temp file in the target's directory, fsync, rename.
pub async fn atomic_write(target: &Path, content: &[u8]) -> Result<(), Error> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::io(format!("no parent dir for {}", target.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(
        "{}.tmp.{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4()
    ));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Move a request into `processing/`. `Ok(None)` means another worker (or a
/// duplicate discovery of the same path) already claimed it.
pub async fn claim(request: &Path, processing_dir: &Path) -> Result<Option<PathBuf>, Error> {
    let Some(name) = request.file_name() else {
        return Ok(None);
    };
    let target = processing_dir.join(name);
    match tokio::fs::rename(request, &target).await {
        Ok(()) => Ok(Some(target)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Move an unprocessable request to `dead/` and record why in a `.reason`
/// sidecar.
pub async fn move_to_dead(file: &Path, dead_dir: &Path, reason: &str) -> Result<(), Error> {
    tokio::fs::create_dir_all(dead_dir).await?;
    let Some(name) = file.file_name() else {
        return Err(Error::io(format!("no file name in {}", file.display())));
    };

    let target = dead_dir.join(name);
    tokio::fs::rename(file, &target).await?;

    let sidecar = dead_dir.join(format!("{}.reason", name.to_string_lossy()));
    atomic_write(&sidecar, reason.as_bytes()).await?;
    Ok(())
}

/// Request files ready for discovery: completed JSON files only, temp files
/// still being written are skipped.
pub fn scan_requests(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_request_file(name) && entry.file_type()?.is_file() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

pub fn is_request_file(name: &str) -> bool {
    name.ends_with(".json") && !name.contains(".tmp.")
}

/// Entries in `dir` whose mtime is older than `ttl`.
pub fn older_than(dir: &Path, ttl: Duration) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    let now = SystemTime::now();
    for entry in entries {
        let entry = entry?;
        let modified = entry.metadata()?.modified()?;
        if now.duration_since(modified).unwrap_or_default() > ttl {
            out.push(entry.path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_filter_skips_temp_and_foreign_files() {
        assert!(is_request_file("req-001.json"));
        assert!(!is_request_file("req-001.json.tmp.abc123"));
        assert!(!is_request_file("req-001.tmp.abc123"));
        assert!(!is_request_file("notes.txt"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("req-1.json");
        atomic_write(&target, b"{\"a\":1}").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["req-1.json"]);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\"a\":1}");
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let requests = dir.path().join("requests");
        let processing = dir.path().join("processing");
        std::fs::create_dir_all(&requests).unwrap();
        std::fs::create_dir_all(&processing).unwrap();

        let request = requests.join("req-1.json");
        std::fs::write(&request, b"{}").unwrap();

        let first = claim(&request, &processing).await.unwrap();
        assert!(first.is_some());
        let second = claim(&request, &processing).await.unwrap();
        assert!(second.is_none(), "second claim must lose quietly");
    }

    #[tokio::test]
    async fn dead_requests_get_a_reason_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dir.path().join("dead");
        let file = dir.path().join("req-bad.json");
        std::fs::write(&file, b"not json").unwrap();

        move_to_dead(&file, &dead, "malformed request").await.unwrap();

        assert!(dead.join("req-bad.json").exists());
        let reason = std::fs::read_to_string(dead.join("req-bad.json.reason")).unwrap();
        assert_eq!(reason, "malformed request");
    }
}
