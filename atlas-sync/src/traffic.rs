//! Optional per-session traffic log.
//!
//! One JSON object per line, in the order the session saw them:
//!
//! ```text
//! {"ts":1718000000123,"dir":"incoming","client":"5f0c…","msg":{"seq":3,...}}
//! {"ts":1718000000124,"dir":"reply","client":"5f0c…","msg":{"change":{...}}}
//! {"ts":1718000000131,"dir":"broadcast","msg":{"acks":{...},...}}
//! ```
//!
//! Lines are buffered in memory and handed to a writer task on
//! [`TrafficLog::flush`], so the session never waits on the file. Meant for
//! reproducing sync bugs, not for auditing. A write error disables the log
//! for the rest of the session.

use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{IncomingMessage, OutgoingMessage};

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    Incoming,
    Reply,
    Broadcast,
}

#[derive(Serialize)]
struct Line<'a, M: Serialize> {
    ts: u128,
    dir: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<Uuid>,
    msg: &'a M,
}

pub struct TrafficLog {
    path: PathBuf,
    buf: Vec<u8>,
    chunks: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
}

impl TrafficLog {
    /// Open (append) `<dir>/<doc_id>.jsonl`, creating `dir` if needed.
    pub async fn open(dir: &Path, doc_id: Uuid) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{doc_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let (chunks, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_chunks(file, rx, path.clone()));
        Ok(Self {
            path,
            buf: Vec::new(),
            chunks: Some(chunks),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn incoming(&mut self, client: Uuid, msg: &IncomingMessage) {
        self.write(Direction::Incoming, Some(client), msg);
    }

    pub fn reply(&mut self, client: Uuid, msg: &OutgoingMessage) {
        self.write(Direction::Reply, Some(client), msg);
    }

    pub fn broadcast(&mut self, msg: &OutgoingMessage) {
        self.write(Direction::Broadcast, None, msg);
    }

    /// Hand buffered lines to the writer task.
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let chunk = mem::take(&mut self.buf);
        if let Some(chunks) = &self.chunks {
            if chunks.send(chunk).is_err() {
                // The writer stopped after an error and already said so.
                self.chunks = None;
            }
        }
    }

    /// Flush and wait until every line is on disk.
    pub async fn close(mut self) {
        self.flush();
        self.chunks = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }

    fn write<M: Serialize>(&mut self, dir: Direction, client: Option<Uuid>, msg: &M) {
        if self.chunks.is_none() {
            return;
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        match serde_json::to_vec(&Line { ts, dir, client, msg }) {
            Ok(line) => {
                self.buf.extend_from_slice(&line);
                self.buf.push(b'\n');
            }
            Err(e) => log::warn!("Traffic log {} skipped a line: {e}", self.path.display()),
        }
    }
}

impl Drop for TrafficLog {
    fn drop(&mut self) {
        self.flush();
    }
}

async fn write_chunks(mut file: File, mut chunks: mpsc::UnboundedReceiver<Vec<u8>>, path: PathBuf) {
    while let Some(chunk) = chunks.recv().await {
        let result = match file.write_all(&chunk).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Traffic log {} disabled: {e}", path.display());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lines_are_json_objects() {
        let dir = tempdir().unwrap();
        let doc = Uuid::new_v4();
        let client = Uuid::new_v4();

        let mut log = TrafficLog::open(&dir.path().join("traffic"), doc).await.unwrap();
        log.incoming(client, &IncomingMessage { seq: 1, ..IncomingMessage::default() });
        log.reply(client, &OutgoingMessage::error(ErrorKind::SessionClosed));
        log.broadcast(&OutgoingMessage::default());
        let path = log.path().to_path_buf();
        log.close().await;

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["dir"], "incoming");
        assert_eq!(lines[0]["msg"]["seq"], 1);
        assert_eq!(lines[1]["client"], client.to_string());
        assert_eq!(lines[2]["dir"], "broadcast");
        assert!(lines[2].get("client").is_none());
    }

    #[tokio::test]
    async fn test_nothing_written_until_flush() {
        let dir = tempdir().unwrap();
        let doc = Uuid::new_v4();
        let mut log = TrafficLog::open(dir.path(), doc).await.unwrap();
        log.incoming(Uuid::nil(), &IncomingMessage { seq: 1, ..IncomingMessage::default() });

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.is_empty());

        log.close().await;
        let text = std::fs::read_to_string(dir.path().join(format!("{doc}.jsonl"))).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempdir().unwrap();
        let doc = Uuid::new_v4();
        for seq in 1..3 {
            let mut log = TrafficLog::open(dir.path(), doc).await.unwrap();
            log.incoming(Uuid::nil(), &IncomingMessage { seq, ..IncomingMessage::default() });
            log.close().await;
        }
        let text = std::fs::read_to_string(dir.path().join(format!("{doc}.jsonl"))).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
