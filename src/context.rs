//! Context-window usage for terminal-driven agents, read from the agent's
//! own transcript files since no structured stream is available.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    engine::EngineEvent,
    protocol::{TokenUsage, DEFAULT_CONTEXT_WINDOW},
    Slot,
};

const TAIL_LINES: usize = 50;

/// Transcript directory the agent CLI keeps for sessions started in `cwd`.
pub fn project_dir(home: &Path, cwd: &Path) -> PathBuf {
    let munged: String = cwd
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    home.join(".claude").join("projects").join(munged)
}

/// Most recently modified `.jsonl` file in `dir`.
pub async fn latest_transcript(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if latest.as_ref().map_or(true, |(newest, _)| modified > *newest) {
            latest = Some((modified, path));
        }
    }
    latest.map(|(_, path)| path)
}

/// Usage of the last assistant turn among the final lines of a transcript.
pub fn last_usage(transcript: &str) -> Option<TokenUsage> {
    let lines: Vec<&str> = transcript.trim_end().lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..]
        .iter()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|entry| entry.get("type").and_then(Value::as_str) == Some("assistant"))
        .filter_map(|entry| entry.pointer("/message/usage").map(TokenUsage::from_value))
        .last()
}

pub async fn context_percent(dir: &Path) -> u8 {
    let Some(path) = latest_transcript(dir).await else {
        return 0;
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => last_usage(&text)
            .map(|usage| usage.percent_of(DEFAULT_CONTEXT_WINDOW))
            .unwrap_or(0),
        Err(error) => {
            tracing::debug!(target = "companion_broker::context", path = %path.display(), error = %error, "transcript unreadable");
            0
        }
    }
}

/// Poll `dir` immediately and then every `interval`, reporting usage for `slot`.
pub fn spawn_context_tracker(
    slot: Slot,
    dir: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tracing::info!(target = "companion_broker::context", dir = %dir.display(), every_secs = interval.as_secs(), "context tracker started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let percent = context_percent(&dir).await;
            if tx
                .send(EngineEvent::ContextUsage { slot, percent })
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::*;

    #[test]
    fn project_dir_munges_cwd() {
        let dir = project_dir(Path::new("/home/dev"), Path::new("/work/my_app.v2"));
        assert_eq!(
            dir,
            Path::new("/home/dev/.claude/projects/-work-my-app-v2")
        );
    }

    #[test]
    fn last_assistant_usage_wins() {
        let transcript = concat!(
            r#"{"type":"assistant","message":{"usage":{"input_tokens":10}}}"#,
            "\n",
            "garbage line\n",
            r#"{"type":"user","message":{"usage":{"input_tokens":99999}}}"#,
            "\n",
            r#"{"type":"assistant","message":{"usage":{"input_tokens":1000,"cache_creation_input_tokens":500,"cache_read_input_tokens":98500}}}"#,
            "\n",
        );
        let usage = last_usage(transcript).expect("usage present");
        assert_eq!(usage.context_tokens(), 100_000);
        assert_eq!(usage.percent_of(DEFAULT_CONTEXT_WINDOW), 50);
    }

    #[test]
    fn only_the_tail_is_considered() {
        let mut transcript =
            String::from(r#"{"type":"assistant","message":{"usage":{"input_tokens":5000}}}"#);
        transcript.push('\n');
        for _ in 0..TAIL_LINES {
            transcript.push_str("{\"type\":\"user\"}\n");
        }
        assert!(last_usage(&transcript).is_none());
    }

    #[tokio::test]
    async fn newest_transcript_is_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.jsonl");
        std::fs::write(
            &old,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":20000}}}"#,
        )
        .expect("write old");
        std::fs::File::options()
            .write(true)
            .open(&old)
            .and_then(|file| file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)))
            .expect("backdate old");
        let new = dir.path().join("new.jsonl");
        std::fs::write(
            &new,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":300000}}}"#,
        )
        .expect("write new");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write other");

        assert_eq!(latest_transcript(dir.path()).await, Some(new));
        assert_eq!(context_percent(dir.path()).await, 100);
    }

    #[tokio::test]
    async fn missing_directory_reports_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(context_percent(&dir.path().join("absent")).await, 0);
    }
}
