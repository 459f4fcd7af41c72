//! Transcripts of finished sessions.
//!
//! One newline-delimited JSON file per session: a header line describing
//! the session, then one line per buffered event.

use ptyplex_core::{CompletionHook, OutputEvent, SessionRecord, SessionState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// First line of every transcript.
#[derive(Debug, Serialize)]
struct TranscriptHeader<'a> {
    session_id: &'a str,
    owner_key: &'a str,
    working_dir: &'a Path,
    final_state: SessionState,
    created_at: i64,
    ended_at: i64,
    event_count: usize,
}

/// Completion hook writing `<dir>/<session_id>.jsonl`.
///
/// Writing is best-effort: failures are logged and never reach the session.
#[derive(Debug, Clone)]
pub struct TranscriptRecorder {
    dir: PathBuf,
}

impl TranscriptRecorder {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    /// Write the transcript for `record`, returning the file path.
    pub async fn write(&self, record: &SessionRecord) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.id);

        let header = TranscriptHeader {
            session_id: &record.id,
            owner_key: &record.owner_key,
            working_dir: &record.working_dir,
            final_state: record.final_state,
            created_at: record.created_at,
            ended_at: record.ended_at,
            event_count: record.history.len(),
        };
        let mut content = serde_json::to_string(&header)?;
        content.push('\n');
        for event in &record.history {
            content.push_str(&serde_json::to_string::<OutputEvent>(event)?);
            content.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }
}

impl CompletionHook for TranscriptRecorder {
    fn session_completed(&self, record: SessionRecord) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %record.id, "no runtime, transcript dropped");
            return;
        };
        let recorder = self.clone();
        runtime.spawn(async move {
            match recorder.write(&record).await {
                Ok(path) => debug!(session_id = %record.id, path = %path.display(), "transcript written"),
                Err(e) => error!(session_id = %record.id, error = %e, "failed to write transcript"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn record(history: Vec<OutputEvent>) -> SessionRecord {
        SessionRecord {
            id: "abc123".into(),
            owner_key: "task-9".into(),
            working_dir: PathBuf::from("/srv/project"),
            final_state: SessionState::Crashed,
            created_at: 1_000,
            ended_at: 2_500,
            history,
        }
    }

    fn lines(content: &str) -> Vec<Value> {
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn writes_header_then_events() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TranscriptRecorder::new(dir.path().join("transcripts"));
        let path = recorder
            .write(&record(vec![OutputEvent::output("$ ls\n"), OutputEvent::system("process exited")]))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("transcripts/abc123.jsonl"));

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines = lines(&content);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["session_id"], "abc123");
        assert_eq!(lines[0]["owner_key"], "task-9");
        assert_eq!(lines[0]["final_state"], "crashed");
        assert_eq!(lines[0]["event_count"], 2);
        assert_eq!(lines[1]["type"], "output");
        assert_eq!(lines[1]["content"], "$ ls\n");
        assert_eq!(lines[2]["type"], "system");
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TranscriptRecorder::new(dir.path().to_path_buf());
        recorder.write(&record(vec![OutputEvent::output("a"), OutputEvent::output("b")])).await.unwrap();
        let path = recorder.write(&record(vec![])).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(lines(&content).len(), 1);
    }

    #[tokio::test]
    async fn hook_writes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TranscriptRecorder::new(dir.path().to_path_buf());
        recorder.session_completed(record(vec![OutputEvent::user("hello")]));

        let path = recorder.path_for("abc123");
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if content.lines().count() == 2 {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "transcript not written");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
