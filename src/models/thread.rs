//! Append-only transcript records (supplemented feature, see SPEC_FULL.md
//! "Thread/zygote transcript types"). Grounded in `original_source`'s
//! `libs/mng_claude_zygote` jsonl conversation logs: plain role-tagged
//! messages, one JSON object per line, appended rather than rewritten.
//!
//! Inert data: nothing in `engine` or `facade` schedules or interprets these
//! beyond making the append/read helpers available to provisioning hooks.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MngrResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Message(ThreadMessage),
    StateChanged { from: String, to: String, timestamp: DateTime<Utc> },
}

/// Append one line to a jsonl transcript file, creating it if absent.
pub async fn append_line(path: &Path, notification: &Notification) -> MngrResult<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(notification)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Read every well-formed line of a jsonl transcript, skipping lines that
/// fail to parse rather than failing the whole read.
pub async fn read_all(path: &Path) -> MngrResult<Vec<Notification>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = tokio::fs::read_to_string(path).await?;
    Ok(data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        let msg = Notification::Message(ThreadMessage {
            role: Role::User,
            content: "hello".to_string(),
            timestamp: Utc::now(),
        });
        append_line(&path, &msg).await.unwrap();
        append_line(&path, &msg).await.unwrap();
        let all = read_all(&path).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn read_all_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        tokio::fs::write(&path, "not json\n{\"kind\":\"bogus\"}\n")
            .await
            .unwrap();
        let all = read_all(&path).await.unwrap();
        assert!(all.is_empty());
    }
}
