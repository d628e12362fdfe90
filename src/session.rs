//! Per-agent messaging handle
//!
//! An [`AgentChannel`] binds one agent identity to the shared key registry,
//! broker, and directory. Agents address peers by [`AgentKind`]; the
//! directory resolves the kind to whichever generation is current, so a
//! restarted agent keeps receiving traffic without senders knowing.

use crate::broker::MessageBroker;
use crate::config::BrokerConfig;
use crate::crypto::{AgentIdentity, EncryptedEnvelope, KeyRegistry};
use crate::dlq::DeadLetterStore;
use crate::error::{Result, TripError};
use crate::transport::{EnvelopeHandler, LocalTransport};
use crate::types::{AgentKind, AgentMessage, DeliveryGuarantee, Priority};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Agent id for a kind and restart generation
///
/// Generation 1 is `"{kind}-agent"`; later generations append `.{n}`.
pub fn agent_id(kind: AgentKind, generation: u32) -> String {
    if generation <= 1 {
        format!("{}-agent", kind)
    } else {
        format!("{}-agent.{}", kind, generation)
    }
}

/// Current agent id per kind, plus the coordinator id
pub struct Directory {
    coordinator: String,
    agents: RwLock<HashMap<AgentKind, String>>,
}

impl Directory {
    pub fn new(coordinator: impl Into<String>) -> Self {
        Self {
            coordinator: coordinator.into(),
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &str {
        &self.coordinator
    }

    pub fn set(&self, kind: AgentKind, agent_id: impl Into<String>) {
        if let Ok(mut agents) = self.agents.write() {
            agents.insert(kind, agent_id.into());
        }
    }

    pub fn get(&self, kind: AgentKind) -> Result<String> {
        self.agents
            .read()
            .ok()
            .and_then(|agents| agents.get(&kind).cloned())
            .ok_or_else(|| TripError::NotFound(format!("no {} agent registered", kind)))
    }

    /// Kind of the agent currently serving under `agent_id`
    pub fn kind_of(&self, agent_id: &str) -> Option<AgentKind> {
        self.agents
            .read()
            .ok()?
            .iter()
            .find(|(_, id)| id.as_str() == agent_id)
            .map(|(kind, _)| *kind)
    }
}

/// Metadata of a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub message_id: String,
    pub sender: String,
    pub correlation_id: String,
}

impl Inbound {
    pub fn from_envelope(envelope: &EncryptedEnvelope) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            sender: envelope.sender.clone(),
            correlation_id: envelope.correlation_id.clone(),
        }
    }
}

/// Sealing and routing handle owned by one agent
pub struct AgentChannel {
    identity: AgentIdentity,
    registry: Arc<KeyRegistry>,
    broker: Arc<MessageBroker>,
    directory: Arc<Directory>,
}

impl AgentChannel {
    /// Bind an identity, publishing its public keys to the registry
    pub fn new(
        identity: AgentIdentity,
        registry: Arc<KeyRegistry>,
        broker: Arc<MessageBroker>,
        directory: Arc<Directory>,
    ) -> Result<Self> {
        registry.register(identity.public())?;
        Ok(Self {
            identity,
            registry,
            broker,
            directory,
        })
    }

    pub fn agent_id(&self) -> &str {
        self.identity.agent_id()
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Seal a message for `recipient` and hand it to the broker
    ///
    /// Returns the message id.
    pub fn send(
        &self,
        recipient: &str,
        correlation_id: &str,
        message: &AgentMessage,
        priority: Priority,
        guarantee: DeliveryGuarantee,
    ) -> Result<String> {
        let recipient = self.registry.get(recipient)?;
        let envelope = self.identity.seal(&recipient, correlation_id, message)?;
        let message_id = envelope.message_id.clone();
        tracing::trace!(
            from = %self.agent_id(),
            to = %recipient.agent_id,
            action = %message.action,
            message_id = %message_id,
            "Sending message"
        );
        self.broker.enqueue(envelope, priority, guarantee)?;
        Ok(message_id)
    }

    /// Send with the tier and guarantee of the message type
    pub fn post(&self, recipient: &str, correlation_id: &str, message: &AgentMessage) -> Result<String> {
        let (priority, guarantee) = message.delivery();
        self.send(recipient, correlation_id, message, priority, guarantee)
    }

    /// Post to the current agent of a kind
    pub fn post_to(&self, kind: AgentKind, correlation_id: &str, message: &AgentMessage) -> Result<String> {
        let recipient = self.directory.get(kind)?;
        self.post(&recipient, correlation_id, message)
    }

    /// Post to the coordinator
    pub fn post_to_coordinator(&self, correlation_id: &str, message: &AgentMessage) -> Result<String> {
        let coordinator = self.directory.coordinator().to_string();
        self.post(&coordinator, correlation_id, message)
    }

    /// Send to the current agent of a kind
    pub fn send_to(
        &self,
        kind: AgentKind,
        correlation_id: &str,
        message: &AgentMessage,
        priority: Priority,
        guarantee: DeliveryGuarantee,
    ) -> Result<String> {
        let recipient = self.directory.get(kind)?;
        self.send(&recipient, correlation_id, message, priority, guarantee)
    }

    /// Verify and decrypt without consuming the nonce
    pub fn inspect(&self, envelope: &EncryptedEnvelope) -> Result<AgentMessage> {
        self.identity.inspect(envelope, &self.registry)
    }

    /// Mark an inspected envelope as processed
    pub fn accept(&self, envelope: &EncryptedEnvelope) -> Result<()> {
        self.identity.accept(envelope)
    }
}

/// Registry, transport, broker, and directory for one planning run
pub struct Mesh {
    pub registry: Arc<KeyRegistry>,
    pub transport: Arc<LocalTransport>,
    pub broker: Arc<MessageBroker>,
    pub directory: Arc<Directory>,
}

impl Mesh {
    pub fn new(
        config: BrokerConfig,
        registry: Arc<KeyRegistry>,
        dead_letters: Arc<dyn DeadLetterStore>,
        coordinator: impl Into<String>,
    ) -> Self {
        let transport = Arc::new(LocalTransport::new());
        let broker = Arc::new(MessageBroker::new(
            config,
            transport.clone(),
            registry.clone(),
            dead_letters,
        ));
        Self {
            registry,
            transport,
            broker,
            directory: Arc::new(Directory::new(coordinator)),
        }
    }

    /// Generate a fresh identity for `agent_id` and bind it to this mesh
    pub fn channel(&self, agent_id: &str) -> Result<Arc<AgentChannel>> {
        Ok(Arc::new(AgentChannel::new(
            AgentIdentity::generate(agent_id),
            self.registry.clone(),
            self.broker.clone(),
            self.directory.clone(),
        )?))
    }

    /// Route deliveries for `agent_id` to `handler`
    pub fn attach(&self, agent_id: &str, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        self.transport.register(agent_id, handler)
    }

    pub fn detach(&self, agent_id: &str) {
        self.transport.unregister(agent_id);
    }
}
