//! Last-activity resolution (DESIGN.md Open Question decision): the
//! authoritative "last activity" timestamp for an agent is the mtime of
//! `activity/ssh`, not the youngest transcript line, per spec §9's default.

use std::path::Path;

use chrono::{DateTime, Utc};

/// Returns `None` if the agent has never been attached to (no wrapper
/// script has ever run), which callers should treat as "not idle" rather
/// than "idle forever".
pub async fn last_activity_mtime(activity_ssh_path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(activity_ssh_path).await.ok()?;
    let modified = metadata.modified().ok()?;
    Some(modified.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity").join("ssh");
        assert!(last_activity_mtime(&path).await.is_none());
    }

    #[tokio::test]
    async fn existing_file_yields_recent_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity").join("ssh");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{}").await.unwrap();
        let mtime = last_activity_mtime(&path).await.unwrap();
        let age = Utc::now().signed_duration_since(mtime);
        assert!(age.num_seconds().abs() < 5);
    }
}
