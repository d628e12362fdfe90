//! Envelope delivery between the broker and agent endpoints
//!
//! The broker only ever hands sealed envelopes to a [`Transport`]. The
//! in-process [`LocalTransport`] routes each envelope to the endpoint
//! registered for its recipient; the endpoint opens and handles it inline,
//! so a handler error surfaces as a failed delivery attempt.

use crate::crypto::EncryptedEnvelope;
use crate::error::{Result, TripError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Moves sealed envelopes to their recipients
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope; an error counts as a failed attempt
    async fn deliver(&self, envelope: &EncryptedEnvelope) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &str;
}

/// Receiving side of an agent: opens and processes delivered envelopes
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn on_envelope(&self, envelope: EncryptedEnvelope) -> Result<()>;
}

/// In-process transport routing by recipient id
#[derive(Default)]
pub struct LocalTransport {
    endpoints: RwLock<HashMap<String, Arc<dyn EnvelopeHandler>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes for `agent_id` to `handler`, replacing any previous endpoint
    pub fn register(&self, agent_id: impl Into<String>, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        let agent_id = agent_id.into();
        let mut endpoints = self
            .endpoints
            .write()
            .map_err(|e| TripError::Config(format!("Failed to acquire endpoint lock: {}", e)))?;
        tracing::debug!(agent = %agent_id, "Endpoint registered");
        endpoints.insert(agent_id, handler);
        Ok(())
    }

    /// Stop routing to `agent_id`; later deliveries fail until re-registered
    pub fn unregister(&self, agent_id: &str) -> bool {
        self.endpoints
            .write()
            .map(|mut endpoints| endpoints.remove(agent_id).is_some())
            .unwrap_or(false)
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.endpoints
            .read()
            .map(|endpoints| endpoints.contains_key(agent_id))
            .unwrap_or(false)
    }

    fn endpoint(&self, agent_id: &str) -> Result<Arc<dyn EnvelopeHandler>> {
        let endpoints = self
            .endpoints
            .read()
            .map_err(|e| TripError::Config(format!("Failed to acquire endpoint lock: {}", e)))?;
        endpoints
            .get(agent_id)
            .cloned()
            .ok_or_else(|| TripError::NotFound(format!("no endpoint for '{}'", agent_id)))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn deliver(&self, envelope: &EncryptedEnvelope) -> Result<()> {
        let endpoint = self.endpoint(&envelope.recipient)?;
        endpoint.on_envelope(envelope.clone()).await
    }

    fn name(&self) -> &str {
        "local"
    }
}
