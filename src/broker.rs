//! Priority message broker
//!
//! Agents never call each other. Every message is sealed by its sender and
//! handed to the broker, which:
//!
//! - authenticates the envelope signature before queueing (fail closed)
//! - drains four priority tiers strictly in order, FIFO within a tier
//! - retries failed deliveries with exponential backoff, then dead-letters
//! - applies the per-message delivery guarantee
//!
//! A single consumer drains the queues, either through [`MessageBroker::flush`]
//! or the background loop started with [`MessageBroker::start`].

use crate::config::BrokerConfig;
use crate::crypto::{verify_envelope, EncryptedEnvelope, KeyRegistry};
use crate::dlq::{should_dead_letter, DeadLetter, DeadLetterStore};
use crate::error::{Result, TripError};
use crate::transport::Transport;
use crate::types::{now_millis, DeliveryGuarantee, Priority};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Queued Message
// ============================================================================

/// A sealed envelope plus its delivery bookkeeping
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: EncryptedEnvelope,
    pub priority: Priority,
    pub guarantee: DeliveryGuarantee,
    /// Unix milliseconds when the message entered the broker
    pub enqueued_at: u64,
    /// Delivery attempts made so far
    pub attempts: u32,
    /// Backoff delays applied between attempts, in milliseconds
    pub backoff_history: Vec<u64>,
    /// Deadline for at-most-once offers, Unix milliseconds
    pub expires_at: Option<u64>,
    ready_at: Option<Instant>,
}

impl QueuedMessage {
    pub fn new(envelope: EncryptedEnvelope, priority: Priority, guarantee: DeliveryGuarantee) -> Self {
        Self {
            envelope,
            priority,
            guarantee,
            enqueued_at: now_millis(),
            attempts: 0,
            backoff_history: Vec::new(),
            expires_at: None,
            ready_at: None,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    fn dedupe_key(&self) -> (String, String) {
        (
            self.envelope.recipient.clone(),
            self.envelope.correlation_id.clone(),
        )
    }
}

// ============================================================================
// Events & Stats
// ============================================================================

/// Broker lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Delivered {
        message_id: String,
        recipient: String,
        attempts: u32,
    },
    Retrying {
        message_id: String,
        recipient: String,
        attempt: u32,
        delay_ms: u64,
    },
    DeadLettered {
        message_id: String,
        correlation_id: String,
        sender: String,
        recipient: String,
        attempts: u32,
        reason: String,
    },
    /// At-most-once message dropped after a failure or its deadline
    Discarded {
        message_id: String,
        recipient: String,
        reason: String,
    },
    /// Envelope failed authentication; never retried
    Rejected {
        message_id: String,
        sender: String,
        reason: String,
    },
    /// Exactly-once message already applied for this correlation id
    Duplicate {
        message_id: String,
        correlation_id: String,
    },
}

/// Point-in-time broker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub rejected: u64,
    pub duplicates: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// Queues
// ============================================================================

#[derive(Default)]
struct Queues {
    tiers: [VecDeque<QueuedMessage>; 4],
    /// Messages waiting out a retry backoff
    delayed: Vec<QueuedMessage>,
    /// (recipient, correlation id) pairs applied under exactly-once
    completed: HashSet<(String, String)>,
    /// Insertion order of `completed`, oldest first
    completed_order: VecDeque<(String, String)>,
}

impl Queues {
    /// Remember an applied key, forgetting the oldest beyond `capacity`
    fn mark_completed(&mut self, key: (String, String), capacity: usize) {
        if !self.completed.insert(key.clone()) {
            return;
        }
        self.completed_order.push_back(key);
        while capacity > 0 && self.completed_order.len() > capacity {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }

    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (mut due, waiting): (Vec<_>, Vec<_>) = self
            .delayed
            .drain(..)
            .partition(|m| m.ready_at.map_or(true, |at| at <= now));
        self.delayed = waiting;
        due.sort_by_key(|m| m.ready_at);
        for message in due {
            self.tiers[message.priority.index()].push_back(message);
        }
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    fn next_wake(&self) -> Option<Instant> {
        self.delayed.iter().filter_map(|m| m.ready_at).min()
    }

    fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum::<usize>() + self.delayed.len()
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Authenticating priority broker with retry, backoff, and dead-lettering
pub struct MessageBroker {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<KeyRegistry>,
    dead_letters: Arc<dyn DeadLetterStore>,
    queues: Mutex<Queues>,
    /// Held by whichever task is draining the queues
    consumer: tokio::sync::Mutex<()>,
    wake: Notify,
    running: AtomicBool,
    events: broadcast::Sender<BrokerEvent>,
    counters: Counters,
}

impl MessageBroker {
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<KeyRegistry>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            transport,
            registry,
            dead_letters,
            queues: Mutex::new(Queues::default()),
            consumer: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            events,
            counters: Counters::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
        }
    }

    /// Messages queued or waiting out a backoff
    pub fn pending(&self) -> usize {
        self.queues().len()
    }

    /// Authenticate and queue a sealed envelope
    ///
    /// Envelopes whose signature does not verify against the registered
    /// sender key are rejected and never queued. Re-enqueueing an
    /// exactly-once message that was already applied is a no-op.
    pub fn enqueue(
        &self,
        envelope: EncryptedEnvelope,
        priority: Priority,
        guarantee: DeliveryGuarantee,
    ) -> Result<()> {
        if let Err(err) = self.authenticate(&envelope) {
            bump(&self.counters.rejected);
            tracing::warn!(
                message_id = %envelope.message_id,
                sender = %envelope.sender,
                error = %err,
                "Envelope rejected at enqueue"
            );
            self.emit(BrokerEvent::Rejected {
                message_id: envelope.message_id,
                sender: envelope.sender,
                reason: err.to_string(),
            });
            return Err(err);
        }

        let mut message = QueuedMessage::new(envelope, priority, guarantee);
        if guarantee == DeliveryGuarantee::AtMostOnce {
            message.expires_at = Some(message.enqueued_at + self.config.quote_ttl_ms);
        }

        let duplicate = guarantee == DeliveryGuarantee::ExactlyOnce
            && self.queues().completed.contains(&message.dedupe_key());
        if duplicate {
            self.record_duplicate(&message);
            return Ok(());
        }

        tracing::trace!(
            message_id = %message.envelope.message_id,
            recipient = %message.envelope.recipient,
            priority = ?priority,
            "Message queued"
        );
        self.queues().tiers[priority.index()].push_back(message);
        bump(&self.counters.enqueued);
        self.wake.notify_one();
        Ok(())
    }

    /// Deliver everything queued, including pending retries
    ///
    /// Returns once the queues are empty, waiting out backoff delays as needed.
    pub async fn flush(&self) {
        let _consumer = self.consumer.lock().await;
        loop {
            match self.drain_ready().await {
                Some(wake) => tokio::time::sleep_until(wake).await,
                None if self.is_idle() => break,
                None => continue,
            }
        }
    }

    /// Spawn the background consumer loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let broker = Arc::clone(self);

        tokio::spawn(async move {
            tracing::debug!(transport = broker.transport.name(), "Broker consumer started");
            while broker.running.load(Ordering::SeqCst) {
                let wake = {
                    let _consumer = broker.consumer.lock().await;
                    broker.drain_ready().await
                };
                match wake {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {}
                            _ = broker.wake.notified() => {}
                        }
                    }
                    None => broker.wake.notified().await,
                }
            }
            tracing::debug!("Broker consumer stopped");
        })
    }

    /// Stop the background consumer after its current pass
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn authenticate(&self, envelope: &EncryptedEnvelope) -> Result<()> {
        let sender = self.registry.get(&envelope.sender)?;
        verify_envelope(envelope, &sender.verifying_key)
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle(&self) -> bool {
        self.queues().len() == 0
    }

    fn next_ready(&self) -> Option<QueuedMessage> {
        let mut queues = self.queues();
        queues.promote_due(Instant::now());
        queues.pop()
    }

    /// Deliver every ready message; returns when the next backoff expires
    async fn drain_ready(&self) -> Option<Instant> {
        while let Some(message) = self.next_ready() {
            self.dispatch(message).await;
        }
        self.queues().next_wake()
    }

    async fn dispatch(&self, mut message: QueuedMessage) {
        if message.guarantee == DeliveryGuarantee::AtMostOnce && message.is_expired(now_millis()) {
            self.discard(message, "offer expired before delivery".to_string());
            return;
        }

        let duplicate = message.guarantee == DeliveryGuarantee::ExactlyOnce
            && self.queues().completed.contains(&message.dedupe_key());
        if duplicate {
            self.record_duplicate(&message);
            return;
        }

        message.attempts += 1;
        let outcome = self.transport.deliver(&message.envelope).await;

        match outcome {
            Ok(()) => {
                if message.guarantee == DeliveryGuarantee::ExactlyOnce {
                    let capacity = self.config.dedupe_capacity;
                    self.queues().mark_completed(message.dedupe_key(), capacity);
                }
                bump(&self.counters.delivered);
                tracing::debug!(
                    message_id = %message.envelope.message_id,
                    recipient = %message.envelope.recipient,
                    attempts = message.attempts,
                    "Message delivered"
                );
                self.emit(BrokerEvent::Delivered {
                    message_id: message.envelope.message_id,
                    recipient: message.envelope.recipient,
                    attempts: message.attempts,
                });
            }
            Err(err) if err.is_security_fault() => {
                bump(&self.counters.rejected);
                tracing::warn!(
                    message_id = %message.envelope.message_id,
                    sender = %message.envelope.sender,
                    recipient = %message.envelope.recipient,
                    error = %err,
                    "Recipient rejected envelope"
                );
                self.emit(BrokerEvent::Rejected {
                    message_id: message.envelope.message_id,
                    sender: message.envelope.sender,
                    reason: err.to_string(),
                });
            }
            Err(err) if message.guarantee == DeliveryGuarantee::AtMostOnce => {
                self.discard(message, err.to_string());
            }
            Err(err) if should_dead_letter(&message, self.config.max_attempts) => {
                self.dead_letter(message, err).await;
            }
            Err(err) => {
                let delay = self.config.backoff_for(message.attempts);
                let delay_ms = delay.as_millis() as u64;
                message.backoff_history.push(delay_ms);
                message.ready_at = Some(Instant::now() + delay);
                bump(&self.counters.retried);
                tracing::debug!(
                    message_id = %message.envelope.message_id,
                    recipient = %message.envelope.recipient,
                    attempt = message.attempts,
                    delay_ms,
                    error = %err,
                    "Delivery failed, retrying"
                );
                self.emit(BrokerEvent::Retrying {
                    message_id: message.envelope.message_id.clone(),
                    recipient: message.envelope.recipient.clone(),
                    attempt: message.attempts,
                    delay_ms,
                });
                self.queues().delayed.push(message);
            }
        }
    }

    async fn dead_letter(&self, message: QueuedMessage, err: TripError) {
        let failure = TripError::DeliveryFailure {
            message_id: message.envelope.message_id.clone(),
            attempts: message.attempts,
            reason: err.to_string(),
        };
        let event = BrokerEvent::DeadLettered {
            message_id: message.envelope.message_id.clone(),
            correlation_id: message.envelope.correlation_id.clone(),
            sender: message.envelope.sender.clone(),
            recipient: message.envelope.recipient.clone(),
            attempts: message.attempts,
            reason: failure.to_string(),
        };

        bump(&self.counters.dead_lettered);
        if let Err(e) = self
            .dead_letters
            .handle(DeadLetter::new(message, failure.to_string()))
            .await
        {
            tracing::error!(error = %e, "Failed to store dead letter");
        }
        self.emit(event);
    }

    fn discard(&self, message: QueuedMessage, reason: String) {
        bump(&self.counters.discarded);
        tracing::debug!(
            message_id = %message.envelope.message_id,
            recipient = %message.envelope.recipient,
            reason = %reason,
            "At-most-once message discarded"
        );
        self.emit(BrokerEvent::Discarded {
            message_id: message.envelope.message_id,
            recipient: message.envelope.recipient,
            reason,
        });
    }

    fn record_duplicate(&self, message: &QueuedMessage) {
        bump(&self.counters.duplicates);
        tracing::debug!(
            message_id = %message.envelope.message_id,
            correlation_id = %message.envelope.correlation_id,
            "Exactly-once message already applied"
        );
        self.emit(BrokerEvent::Duplicate {
            message_id: message.envelope.message_id.clone(),
            correlation_id: message.envelope.correlation_id.clone(),
        });
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }
}
