//! Durable inbound/outbound message queues shared with the chat frontend.
//!
//! Each queue is a `{"messages": [...]}` file rewritten atomically. Every
//! read-modify-write holds an exclusive advisory lock on a sidecar
//! `<queue>.lock` file, so the daemon and the frontend can mutate the same
//! queue without losing messages. Messages are never deleted; only their `read`/`sent` flags flip. Delivery to the
//! frontend is at-least-once: `drain_unsent_outbound` does not mark anything,
//! the frontend calls `mark_sent` after it delivered.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::fsutil::write_json_atomic;
use super::schema::{MESSAGES_SCHEMA, load_record};

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Agent,
}

/// File reference sent to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Attachment {
    Document {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

/// Message body: plain text or an attachment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Attachment(Attachment),
}

impl Payload {
    /// Text shown to the operator (the caption or path for documents).
    pub fn display_text(&self) -> &str {
        match self {
            Payload::Text(text) => text,
            Payload::Attachment(Attachment::Document { path, caption }) => {
                caption.as_deref().unwrap_or(path)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub payload: Payload,
    pub read: bool,
    pub sent: bool,
    /// Frontend-specific markup (inline buttons); opaque to relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<Value>,
}

/// What the agent side wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPayload {
    Text(String),
    Document {
        path: String,
        caption: Option<String>,
    },
    /// Text with reply markup such as continue/stop buttons.
    Markup { text: String, markup: Value },
}

impl OutboundPayload {
    fn into_parts(self) -> (Payload, Option<Value>) {
        match self {
            OutboundPayload::Text(text) => (Payload::Text(text), None),
            OutboundPayload::Document { path, caption } => {
                (Payload::Attachment(Attachment::Document { path, caption }), None)
            }
            OutboundPayload::Markup { text, markup } => (Payload::Text(text), Some(markup)),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    messages: Vec<Message>,
}

/// One queue file (`state/inbox.json` or `state/outbox.json`).
#[derive(Debug, Clone)]
pub struct MessageQueue {
    path: PathBuf,
}

impl MessageQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All messages in id order. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<Message>> {
        let file: Option<QueueFile> = load_record(&self.path, MESSAGES_SCHEMA, "queue")?;
        Ok(file.map(|file| file.messages).unwrap_or_default())
    }

    /// Replace the queue with an empty collection.
    pub fn reset(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.store(Vec::new())
    }

    fn store(&self, messages: Vec<Message>) -> Result<()> {
        write_json_atomic(&self.path, &QueueFile { messages })
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Block until this process holds the queue's sidecar lock.
    ///
    /// The lock is released when the returned handle is dropped, or by the
    /// kernel if the process dies.
    fn lock(&self) -> Result<File> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open queue lock {}", path.display()))?;
        file.lock()
            .with_context(|| format!("lock queue {}", path.display()))?;
        Ok(file)
    }

    /// Load, mutate, and store (when `mutate` reports a change) under the lock.
    fn update<R>(&self, mutate: impl FnOnce(&mut Vec<Message>) -> (R, bool)) -> Result<R> {
        let _lock = self.lock()?;
        let mut messages = self.load()?;
        let (result, changed) = mutate(&mut messages);
        if changed {
            self.store(messages)?;
        }
        Ok(result)
    }

    fn append(&self, origin: Origin, payload: Payload, reply_markup: Option<Value>) -> Result<Message> {
        let message = self.update(|messages| {
            let id = messages.iter().map(|message| message.id).max().unwrap_or(0) + 1;
            let message = Message {
                id,
                timestamp: Utc::now(),
                origin,
                payload,
                read: false,
                sent: false,
                reply_markup,
            };
            messages.push(message.clone());
            (message, true)
        })?;
        debug!(queue = %self.path.display(), id = message.id, ?origin, "message enqueued");
        Ok(message)
    }

    pub fn enqueue_inbound(&self, text: &str) -> Result<Message> {
        self.append(Origin::User, Payload::Text(text.to_string()), None)
    }

    pub fn enqueue_outbound(&self, payload: OutboundPayload) -> Result<Message> {
        let (payload, markup) = payload.into_parts();
        self.append(Origin::Agent, payload, markup)
    }

    /// Return unread operator messages and mark them read in the same rewrite.
    pub fn drain_unread_inbound(&self) -> Result<Vec<Message>> {
        self.update(|messages| {
            let mut drained = Vec::new();
            for message in messages {
                if message.origin == Origin::User && !message.read {
                    message.read = true;
                    drained.push(message.clone());
                }
            }
            let changed = !drained.is_empty();
            (drained, changed)
        })
    }

    /// Return undelivered agent messages without marking them.
    pub fn drain_unsent_outbound(&self) -> Result<Vec<Message>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|message| message.origin == Origin::Agent && !message.sent)
            .collect())
    }

    /// Flip `sent` for `ids`; returns how many messages changed.
    pub fn mark_sent(&self, ids: &[u64]) -> Result<usize> {
        self.update(|messages| {
            let mut changed = 0;
            for message in messages {
                if ids.contains(&message.id) && !message.sent {
                    message.sent = true;
                    changed += 1;
                }
            }
            (changed, changed > 0)
        })
    }

    pub fn has_unread_inbound(&self) -> Result<bool> {
        Ok(self
            .load()?
            .iter()
            .any(|message| message.origin == Origin::User && !message.read))
    }
}
