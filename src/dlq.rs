//! Dead letter store for messages that exhaust delivery attempts
//!
//! The broker hands every message it gives up on to a `DeadLetterStore`.
//! Dead letters keep the sealed envelope, so an operator can inspect or
//! replay them without the store ever seeing plaintext.

use crate::broker::QueuedMessage;
use crate::error::Result;
use crate::types::now_millis;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A message the broker gave up on, with the reason
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The queued message as it stood after its last attempt
    pub message: QueuedMessage,

    /// Reason the message was dead-lettered
    pub reason: String,

    /// Unix timestamp in milliseconds when the message was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(message: QueuedMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }

    pub fn recipient(&self) -> &str {
        &self.message.envelope.recipient
    }
}

/// Destination for undeliverable messages
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Record a dead letter
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Remove and return every dead letter addressed to `recipient`, oldest first
    async fn take_for(&self, recipient: &str) -> Result<Vec<DeadLetter>>;
}

/// In-memory dead letter store with a capacity bound
///
/// Oldest letters are dropped once the capacity is exceeded.
pub struct MemoryDeadLetterStore {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    capacity: usize,
}

impl MemoryDeadLetterStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            capacity,
        }
    }
}

impl Default for MemoryDeadLetterStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            message_id = %letter.message.envelope.message_id,
            sender = %letter.message.envelope.sender,
            recipient = %letter.recipient(),
            attempts = letter.message.attempts,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.capacity > 0 && letters.len() > self.capacity {
            let excess = letters.len() - self.capacity;
            letters.drain(..excess);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }

    async fn take_for(&self, recipient: &str) -> Result<Vec<DeadLetter>> {
        let mut letters = self.letters.write().await;
        let (taken, kept): (Vec<_>, Vec<_>) = letters
            .drain(..)
            .partition(|l| l.recipient() == recipient);
        *letters = kept;
        Ok(taken)
    }
}

/// Whether a message has used up its delivery attempts
pub fn should_dead_letter(message: &QueuedMessage, max_attempts: u32) -> bool {
    max_attempts > 0 && message.attempts >= max_attempts
}
