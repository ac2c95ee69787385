//! Point-to-point and broadcast messaging between the coordinator and workers.
//!
//! Each endpoint has one unbounded FIFO mailbox, so messages from one sender
//! to one recipient arrive in order. Delivery is at-least-once: a sender may
//! repeat a progress report, and [`Mailbox`] drops the repeats.
//!
//! Messages carry metadata only. `summary` is required and short, `content`
//! is capped; bulk data travels through file artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::artifact::write_atomic;
use crate::core::task::TaskId;
use crate::orchestration::WorkerId;
use crate::{clog_debug, clog_trace, Error, Result};

pub const MAX_SUMMARY_CHARS: usize = 120;
pub const MAX_CONTENT_BYTES: usize = 2048;
/// Message ids a mailbox remembers for redelivery checks.
pub const DEDUP_WINDOW: usize = 1024;

/// A party that can send and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Endpoint {
    Coordinator,
    Worker(WorkerId),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Coordinator => write!(f, "coordinator"),
            Endpoint::Worker(id) => write!(f, "worker:{}", id.short()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "to")]
pub enum Recipient {
    To(Endpoint),
    /// Every subscribed endpoint except the sender.
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MessageKind {
    /// `seq` increases per sender and task; repeats of a pair are duplicates.
    Progress { task: Option<TaskId>, seq: u64 },
    ShutdownRequest { attempt: u32 },
    ShutdownResponse {
        approve: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub sender: Endpoint,
    pub recipient: Recipient,
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Build a message, enforcing the summary and content limits.
    pub fn new(
        kind: MessageKind,
        sender: Endpoint,
        recipient: Recipient,
        summary: &str,
        content: &str,
    ) -> Result<Self> {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(Error::MessageRejected("summary is required".to_string()));
        }
        if summary.chars().count() > MAX_SUMMARY_CHARS {
            return Err(Error::MessageRejected(format!(
                "summary exceeds {} characters",
                MAX_SUMMARY_CHARS
            )));
        }
        if content.len() > MAX_CONTENT_BYTES {
            return Err(Error::MessageRejected(format!(
                "content is {} bytes; limit is {} (write bulk data to an artifact)",
                content.len(),
                MAX_CONTENT_BYTES
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            sender,
            recipient,
            summary: summary.to_string(),
            content: content.to_string(),
            sent_at: Utc::now(),
        })
    }
}

/// Drops redelivered messages.
///
/// Ids are remembered over a sliding window. Progress is tracked as the
/// highest `seq` per sender and task, which relies on per-sender FIFO
/// delivery; a task's entries go away with [`forget_task`](Self::forget_task).
#[derive(Debug, Default)]
pub struct Deduplicator {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    progress: HashMap<(Endpoint, Option<TaskId>), u64>,
}

impl Deduplicator {
    /// True the first time a message (or an equivalent progress report) is seen.
    pub fn is_new(&mut self, message: &Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        self.remember(message.id);
        match message.kind {
            MessageKind::Progress { task, seq } => match self.progress.entry((message.sender, task)) {
                Entry::Occupied(last) if *last.get() >= seq => false,
                Entry::Occupied(mut last) => {
                    last.insert(seq);
                    true
                }
                Entry::Vacant(slot) => {
                    slot.insert(seq);
                    true
                }
            },
            _ => true,
        }
    }

    /// Drop progress state for a finished task. A rerun counts from zero again.
    pub fn forget_task(&mut self, task: TaskId) {
        self.progress.retain(|(_, t), _| *t != Some(task));
    }

    fn remember(&mut self, id: Uuid) {
        if self.order.len() >= DEDUP_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id);
        self.order.push_back(id);
    }
}

/// Receiving side of a subscription.
pub struct Mailbox {
    endpoint: Endpoint,
    rx: mpsc::UnboundedReceiver<Message>,
    dedup: Deduplicator,
}

impl Mailbox {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Next new message, or `None` once the router dropped this mailbox.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let message = self.rx.recv().await?;
            if self.dedup.is_new(&message) {
                return Some(message);
            }
            clog_trace!("{} dropped duplicate {}", self.endpoint, message.id);
        }
    }

    pub fn forget_task(&mut self, task: TaskId) {
        self.dedup.forget_task(task);
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        while let Ok(message) = self.rx.try_recv() {
            if self.dedup.is_new(&message) {
                return Some(message);
            }
        }
        None
    }
}

#[derive(Default)]
struct RouterInner {
    mailboxes: HashMap<Endpoint, mpsc::UnboundedSender<Message>>,
    audit: Vec<Message>,
    closed: bool,
}

/// Shared message router. Clones refer to the same router.
#[derive(Clone, Default)]
pub struct MessageRouter {
    inner: Arc<Mutex<RouterInner>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an endpoint. A second subscription replaces the first.
    pub fn subscribe(&self, endpoint: Endpoint) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().mailboxes.insert(endpoint, tx);
        clog_debug!("MessageRouter: {} subscribed", endpoint);
        Mailbox {
            endpoint,
            rx,
            dedup: Deduplicator::default(),
        }
    }

    /// Subscribe and invoke `callback` for every new message on a background task.
    pub fn subscribe_with<F>(&self, endpoint: Endpoint, callback: F) -> JoinHandle<()>
    where
        F: Fn(Message) + Send + 'static,
    {
        let mut mailbox = self.subscribe(endpoint);
        tokio::spawn(async move {
            while let Some(message) = mailbox.recv().await {
                callback(message);
            }
        })
    }

    pub fn unsubscribe(&self, endpoint: Endpoint) {
        self.lock().mailboxes.remove(&endpoint);
    }

    /// Deliver a message and record it in the audit log.
    ///
    /// Returns how many mailboxes received it. A direct message to an
    /// endpoint without a mailbox is rejected.
    pub fn send(&self, message: Message) -> Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::ChannelClosed("message router"));
        }
        clog_trace!(
            "MessageRouter: {} -> {:?}: {}",
            message.sender,
            message.recipient,
            message.summary
        );

        let delivered = match message.recipient {
            Recipient::To(endpoint) => {
                let tx = inner.mailboxes.get(&endpoint).ok_or_else(|| {
                    Error::MessageRejected(format!("no mailbox for {}", endpoint))
                })?;
                if tx.send(message.clone()).is_err() {
                    inner.mailboxes.remove(&endpoint);
                    return Err(Error::MessageRejected(format!("{} stopped listening", endpoint)));
                }
                1
            }
            Recipient::Broadcast => {
                let mut gone = Vec::new();
                let mut count = 0;
                for (endpoint, tx) in &inner.mailboxes {
                    if *endpoint == message.sender {
                        continue;
                    }
                    if tx.send(message.clone()).is_ok() {
                        count += 1;
                    } else {
                        gone.push(*endpoint);
                    }
                }
                for endpoint in gone {
                    inner.mailboxes.remove(&endpoint);
                }
                count
            }
        };
        inner.audit.push(message);
        Ok(delivered)
    }

    /// Validate, then send.
    pub fn send_message(
        &self,
        kind: MessageKind,
        sender: Endpoint,
        recipient: Recipient,
        summary: &str,
        content: &str,
    ) -> Result<usize> {
        self.send(Message::new(kind, sender, recipient, summary, content)?)
    }

    pub fn audit_log(&self) -> Vec<Message> {
        self.lock().audit.clone()
    }

    /// Write the audit log as JSON lines.
    pub fn write_audit(&self, path: &Path) -> Result<usize> {
        let audit = self.audit_log();
        let mut out = String::new();
        for message in &audit {
            out.push_str(&serde_json::to_string(message)?);
            out.push('\n');
        }
        write_atomic(path, out.as_bytes())?;
        Ok(audit.len())
    }

    /// Drop every mailbox and refuse further sends.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.mailboxes.clear();
    }
}
