use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::TransportError;
use crate::types::{MessageId, UserId};

/// The outbound half of the chat surface.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, user: UserId, text: &str) -> Result<MessageId, TransportError>;

    async fn edit_text(
        &self,
        user: UserId,
        message: MessageId,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Deliver the file at `path` as an artifact named `file_name`.
    async fn send_file(
        &self,
        user: UserId,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<(), TransportError>;
}

/// One entry of a user's outbox.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Text {
        id: MessageId,
        text: String,
        edits: u32,
    },
    File {
        file_name: String,
        caption: String,
        contents: String,
    },
}

/// Transport that keeps every outbound message in memory, per user.
///
/// File artifacts are read at send time, so their contents survive the cleanup
/// that follows a run.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next_id: AtomicU64,
    outbox: Mutex<HashMap<UserId, Vec<Outbound>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, user: UserId) -> Vec<Outbound> {
        let outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.get(&user).cloned().unwrap_or_default()
    }

    /// Current text of every text message, in send order.
    pub fn texts(&self, user: UserId) -> Vec<String> {
        self.messages(user)
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Text { text, .. } => Some(text),
                Outbound::File { .. } => None,
            })
            .collect()
    }

    fn push(&self, user: UserId, message: Outbound) {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.entry(user).or_default().push(message);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&self, user: UserId, text: &str) -> Result<MessageId, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.push(
            user,
            Outbound::Text {
                id,
                text: text.to_string(),
                edits: 0,
            },
        );
        Ok(id)
    }

    async fn edit_text(
        &self,
        user: UserId,
        message: MessageId,
        new_text: &str,
    ) -> Result<(), TransportError> {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        let found = outbox.get_mut(&user).and_then(|msgs| {
            msgs.iter_mut().find_map(|m| match m {
                Outbound::Text { id, text, edits } if *id == message => Some((text, edits)),
                _ => None,
            })
        });
        match found {
            Some((text, edits)) => {
                *text = new_text.to_string();
                *edits += 1;
                Ok(())
            }
            None => Err(TransportError(format!("message {message} not found"))),
        }
    }

    async fn send_file(
        &self,
        user: UserId,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<(), TransportError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TransportError(format!("cannot read {}: {e}", path.display())))?;
        self.push(
            user,
            Outbound::File {
                file_name: file_name.to_string(),
                caption: caption.to_string(),
                contents,
            },
        );
        Ok(())
    }
}
