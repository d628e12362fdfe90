//! Agent identity and session encryption
//!
//! Every agent owns an Ed25519 signing key and an X25519 exchange key.
//! Envelopes are encrypted per message: an ephemeral X25519 agreement with
//! the recipient's exchange key is expanded through HKDF-SHA256 into an
//! AES-256-GCM key. The ephemeral public key prefixes the ciphertext.
//!
//! Receivers verify the sender's signature before anything else; a bad
//! signature fails closed and the payload is never decrypted.

use crate::error::{Result, TripError};
use crate::types::{now_millis, AgentMessage};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use x25519_dalek::{EphemeralSecret, PublicKey, ReusableSecret};

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

const EPHEMERAL_KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const KDF_INFO: &[u8] = b"a3s-trip envelope v1";

/// Signed and encrypted wire wrapper for one inter-agent message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Unique message identifier (msg-<uuid>)
    pub message_id: String,

    pub sender: String,

    pub recipient: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Groups a request with its responses; also the exactly-once dedupe key
    pub correlation_id: String,

    /// Base64-encoded ephemeral public key followed by AES-256-GCM ciphertext
    pub ciphertext: String,

    /// Base64-encoded 96-bit nonce
    pub nonce: String,

    /// Base64-encoded Ed25519 signature over every other field
    pub signature: String,
}

impl EncryptedEnvelope {
    /// Canonical bytes covered by the signature
    ///
    /// Fields are length-prefixed so no two envelopes share an encoding.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let timestamp = self.timestamp.to_be_bytes();
        let fields: [&[u8]; 7] = [
            self.message_id.as_bytes(),
            self.sender.as_bytes(),
            self.recipient.as_bytes(),
            &timestamp,
            self.correlation_id.as_bytes(),
            self.nonce.as_bytes(),
            self.ciphertext.as_bytes(),
        ];

        let mut out = Vec::with_capacity(fields.iter().map(|f| f.len() + 4).sum());
        for field in fields {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field);
        }
        out
    }
}

/// Public half of an agent identity, safe to share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    pub agent_id: String,
    pub verifying_key: VerifyingKey,
    pub exchange_key: PublicKey,
}

/// Private keys owned exclusively by one agent
pub struct AgentIdentity {
    agent_id: String,
    signing: SigningKey,
    exchange: ReusableSecret,
    /// Nonces this identity has sealed with
    issued: Mutex<HashSet<[u8; NONCE_LEN]>>,
    /// Nonces this identity has accepted
    accepted: Mutex<HashSet<[u8; NONCE_LEN]>>,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl AgentIdentity {
    /// Generate a fresh signing and exchange key pair
    pub fn generate(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            signing: SigningKey::generate(&mut OsRng),
            exchange: ReusableSecret::random_from_rng(OsRng),
            issued: Mutex::new(HashSet::new()),
            accepted: Mutex::new(HashSet::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            agent_id: self.agent_id.clone(),
            verifying_key: self.signing.verifying_key(),
            exchange_key: PublicKey::from(&self.exchange),
        }
    }

    /// Encrypt and sign a message for a recipient
    pub fn seal(
        &self,
        recipient: &PublicIdentity,
        correlation_id: impl Into<String>,
        message: &AgentMessage,
    ) -> Result<EncryptedEnvelope> {
        let plaintext = serde_json::to_vec(message)?;
        let (ciphertext, nonce) = encrypt(&plaintext, &recipient.exchange_key)?;
        self.record_issued(nonce)?;

        let mut envelope = EncryptedEnvelope {
            message_id: format!("msg-{}", uuid::Uuid::new_v4()),
            sender: self.agent_id.clone(),
            recipient: recipient.agent_id.clone(),
            timestamp: now_millis(),
            correlation_id: correlation_id.into(),
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            signature: String::new(),
        };
        let signature = sign(&envelope.signing_bytes(), &self.signing);
        envelope.signature = BASE64.encode(signature.to_bytes());
        Ok(envelope)
    }

    /// Verify, replay-check, and decrypt an envelope addressed to this identity
    ///
    /// The nonce is consumed; a second `open` of the same envelope fails
    /// with [`TripError::NonceReuse`].
    pub fn open(&self, envelope: &EncryptedEnvelope, registry: &KeyRegistry) -> Result<AgentMessage> {
        let message = self.inspect(envelope, registry)?;
        self.accept(envelope)?;
        Ok(message)
    }

    /// Verify and decrypt without consuming the nonce
    ///
    /// Endpoints that may fail while handling a message call [`accept`](Self::accept)
    /// only once handling succeeds, so a retried delivery of the same
    /// envelope is still accepted.
    pub fn inspect(&self, envelope: &EncryptedEnvelope, registry: &KeyRegistry) -> Result<AgentMessage> {
        if envelope.recipient != self.agent_id {
            return Err(TripError::Crypto(format!(
                "envelope for '{}' delivered to '{}'",
                envelope.recipient, self.agent_id
            )));
        }

        let sender = registry.get(&envelope.sender)?;
        verify_envelope(envelope, &sender.verifying_key)?;

        let nonce = decode_nonce(&envelope.nonce)?;
        if self.was_accepted(&nonce)? {
            return Err(TripError::NonceReuse(format!(
                "'{}' received nonce {} twice",
                self.agent_id, envelope.nonce
            )));
        }

        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| TripError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;
        let plaintext = decrypt(&ciphertext, &nonce, &self.exchange)?;
        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    /// Consume the envelope's nonce
    pub fn accept(&self, envelope: &EncryptedEnvelope) -> Result<()> {
        let nonce = decode_nonce(&envelope.nonce)?;
        self.record_accepted(nonce)
    }

    pub(crate) fn record_issued(&self, nonce: [u8; NONCE_LEN]) -> Result<()> {
        let mut issued = self
            .issued
            .lock()
            .map_err(|e| TripError::Crypto(format!("Failed to acquire nonce lock: {}", e)))?;
        if !issued.insert(nonce) {
            return Err(TripError::NonceReuse(format!(
                "'{}' generated nonce {} twice",
                self.agent_id,
                BASE64.encode(nonce)
            )));
        }
        Ok(())
    }

    fn was_accepted(&self, nonce: &[u8; NONCE_LEN]) -> Result<bool> {
        let accepted = self
            .accepted
            .lock()
            .map_err(|e| TripError::Crypto(format!("Failed to acquire nonce lock: {}", e)))?;
        Ok(accepted.contains(nonce))
    }

    fn record_accepted(&self, nonce: [u8; NONCE_LEN]) -> Result<()> {
        let mut accepted = self
            .accepted
            .lock()
            .map_err(|e| TripError::Crypto(format!("Failed to acquire nonce lock: {}", e)))?;
        if !accepted.insert(nonce) {
            return Err(TripError::NonceReuse(format!(
                "'{}' received nonce {} twice",
                self.agent_id,
                BASE64.encode(nonce)
            )));
        }
        Ok(())
    }
}

/// Append-only registry of agent public identities
///
/// Holds public values only. Safe for concurrent reads.
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<String, PublicIdentity>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a public identity
    ///
    /// Registering the same keys twice is a no-op; different keys under an
    /// existing id are rejected.
    pub fn register(&self, identity: PublicIdentity) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| TripError::Crypto(format!("Failed to acquire registry lock: {}", e)))?;

        if let Some(existing) = keys.get(&identity.agent_id) {
            if *existing == identity {
                return Ok(());
            }
            return Err(TripError::Crypto(format!(
                "agent '{}' is already registered with different keys",
                identity.agent_id
            )));
        }

        tracing::debug!(agent = %identity.agent_id, "Public identity registered");
        keys.insert(identity.agent_id.clone(), identity);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Result<PublicIdentity> {
        let keys = self
            .keys
            .read()
            .map_err(|e| TripError::Crypto(format!("Failed to acquire registry lock: {}", e)))?;
        keys.get(agent_id)
            .cloned()
            .ok_or_else(|| TripError::UnknownAgent(agent_id.to_string()))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(agent_id))
            .unwrap_or(false)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.keys
            .read()
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.keys.read().map(|keys| keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sign a payload
pub fn sign(payload: &[u8], key: &SigningKey) -> Signature {
    key.sign(payload)
}

/// Check a payload signature
pub fn verify(payload: &[u8], signature: &Signature, key: &VerifyingKey) -> bool {
    key.verify(payload, signature).is_ok()
}

/// Verify an envelope signature, failing closed
pub fn verify_envelope(envelope: &EncryptedEnvelope, key: &VerifyingKey) -> Result<()> {
    let invalid = |reason: String| TripError::SignatureInvalid {
        sender: envelope.sender.clone(),
        reason,
    };

    let bytes = BASE64
        .decode(&envelope.signature)
        .map_err(|e| invalid(format!("invalid base64 signature: {}", e)))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| invalid("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&bytes);

    if !verify(&envelope.signing_bytes(), &signature, key) {
        return Err(invalid("signature does not match sender key".to_string()));
    }
    Ok(())
}

/// Encrypt a payload for a recipient exchange key
///
/// Returns `(ephemeral_public || ciphertext, nonce)`.
pub fn encrypt(payload: &[u8], recipient: &PublicKey) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let cipher = derive_cipher(shared.as_bytes(), &ephemeral_public, recipient)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, payload)
        .map_err(|e| TripError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut ciphertext = Vec::with_capacity(EPHEMERAL_KEY_LEN + sealed.len());
    ciphertext.extend_from_slice(ephemeral_public.as_bytes());
    ciphertext.extend_from_slice(&sealed);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    Ok((ciphertext, nonce_bytes))
}

/// Decrypt a payload produced by [`encrypt`]
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    secret: &ReusableSecret,
) -> Result<Vec<u8>> {
    if ciphertext.len() < EPHEMERAL_KEY_LEN + TAG_LEN {
        return Err(TripError::Crypto("ciphertext too short".to_string()));
    }

    let (ephemeral, sealed) = ciphertext.split_at(EPHEMERAL_KEY_LEN);
    let mut ephemeral_bytes = [0u8; EPHEMERAL_KEY_LEN];
    ephemeral_bytes.copy_from_slice(ephemeral);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);

    let shared = secret.diffie_hellman(&ephemeral_public);
    let own_public = PublicKey::from(secret);
    let cipher = derive_cipher(shared.as_bytes(), &ephemeral_public, &own_public)?;

    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|e| TripError::Crypto(format!("Decryption failed: {}", e)))
}

fn derive_cipher(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<Aes256Gcm> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hk.expand(KDF_INFO, &mut key)
        .map_err(|e| TripError::Crypto(format!("Key derivation failed: {}", e)))?;

    Aes256Gcm::new_from_slice(&key)
        .map_err(|e| TripError::Crypto(format!("Invalid session key: {}", e)))
}

fn decode_nonce(encoded: &str) -> Result<[u8; NONCE_LEN]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| TripError::Crypto(format!("Invalid nonce encoding: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| TripError::Crypto(format!("nonce must be {} bytes", NONCE_LEN)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::actions;

    fn pair() -> (AgentIdentity, AgentIdentity, KeyRegistry) {
        let alice = AgentIdentity::generate("coordinator");
        let bob = AgentIdentity::generate("flight-agent");
        let registry = KeyRegistry::new();
        registry.register(alice.public()).unwrap();
        registry.register(bob.public()).unwrap();
        (alice, bob, registry)
    }

    fn sample_message() -> AgentMessage {
        AgentMessage::request(
            actions::CONSTRAINTS_BROADCAST,
            serde_json::json!({"destination": "LAS", "travelers": 1}),
        )
    }

    fn flip_bit(encoded: &str, byte: usize) -> String {
        let mut bytes = BASE64.decode(encoded).unwrap();
        bytes[byte] ^= 0x01;
        BASE64.encode(bytes)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let secret = ReusableSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let payload = b"round-trip LAS 2026-03-10";

        let (ciphertext, nonce) = encrypt(payload, &public).unwrap();
        assert_ne!(&ciphertext[EPHEMERAL_KEY_LEN..], payload.as_slice());
        assert_eq!(decrypt(&ciphertext, &nonce, &secret).unwrap(), payload);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let secret = ReusableSecret::random_from_rng(OsRng);
        let other = ReusableSecret::random_from_rng(OsRng);
        let (ciphertext, nonce) = encrypt(b"data", &PublicKey::from(&secret)).unwrap();
        assert!(decrypt(&ciphertext, &nonce, &other).is_err());
    }

    #[test]
    fn test_decrypt_detects_corruption() {
        let secret = ReusableSecret::random_from_rng(OsRng);
        let (mut ciphertext, nonce) = encrypt(b"data", &PublicKey::from(&secret)).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x80;
        assert!(decrypt(&ciphertext, &nonce, &secret).is_err());
        assert!(decrypt(&[0u8; 10], &nonce, &secret).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let signature = sign(b"payload", &key);
        assert!(verify(b"payload", &signature, &key.verifying_key()));
        assert!(!verify(b"payloaD", &signature, &key.verifying_key()));

        let other = SigningKey::generate(&mut OsRng);
        assert!(!verify(b"payload", &signature, &other.verifying_key()));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (alice, bob, registry) = pair();
        let message = sample_message();

        let envelope = alice.seal(&bob.public(), "run-1", &message).unwrap();
        assert!(envelope.message_id.starts_with("msg-"));
        assert_eq!(envelope.sender, "coordinator");
        assert_eq!(envelope.recipient, "flight-agent");
        assert_eq!(envelope.correlation_id, "run-1");

        let opened = bob.open(&envelope, &registry).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_corrupted_ciphertext_fails_signature() {
        let (alice, bob, registry) = pair();
        let mut envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        envelope.ciphertext = flip_bit(&envelope.ciphertext, 40);

        let err = bob.open(&envelope, &registry).unwrap_err();
        assert!(matches!(err, TripError::SignatureInvalid { .. }));
    }

    #[test]
    fn test_corrupted_signature_fails() {
        let (alice, bob, registry) = pair();
        let mut envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        envelope.signature = flip_bit(&envelope.signature, 7);

        let err = bob.open(&envelope, &registry).unwrap_err();
        assert!(matches!(err, TripError::SignatureInvalid { .. }));
    }

    #[test]
    fn test_tampered_header_fails_signature() {
        let (alice, bob, registry) = pair();
        let mut envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        envelope.correlation_id = "run-2".to_string();
        assert!(matches!(
            bob.open(&envelope, &registry),
            Err(TripError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn test_forged_sender_fails_signature() {
        let (alice, bob, registry) = pair();
        let mallory = AgentIdentity::generate("hotel-agent");
        registry.register(mallory.public()).unwrap();

        let mut envelope = mallory.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        envelope.sender = alice.agent_id().to_string();
        assert!(matches!(
            bob.open(&envelope, &registry),
            Err(TripError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let (_, bob, registry) = pair();
        let stranger = AgentIdentity::generate("stranger");
        let envelope = stranger.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        assert!(matches!(
            bob.open(&envelope, &registry),
            Err(TripError::UnknownAgent(_))
        ));
    }

    #[test]
    fn test_wrong_recipient_rejected() {
        let (alice, bob, registry) = pair();
        let envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        assert!(alice.open(&envelope, &registry).is_err());
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let (alice, bob, registry) = pair();
        let envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();

        bob.open(&envelope, &registry).unwrap();
        let err = bob.open(&envelope, &registry).unwrap_err();
        assert!(matches!(err, TripError::NonceReuse(_)));
    }

    #[test]
    fn test_inspect_defers_nonce_until_accept() {
        let (alice, bob, registry) = pair();
        let envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();

        bob.inspect(&envelope, &registry).unwrap();
        bob.inspect(&envelope, &registry).unwrap();
        bob.accept(&envelope).unwrap();
        assert!(matches!(
            bob.inspect(&envelope, &registry),
            Err(TripError::NonceReuse(_))
        ));
        assert!(matches!(bob.accept(&envelope), Err(TripError::NonceReuse(_))));
    }

    #[test]
    fn test_issued_nonce_collision_is_fatal() {
        let alice = AgentIdentity::generate("coordinator");
        alice.record_issued([7u8; NONCE_LEN]).unwrap();
        assert!(matches!(
            alice.record_issued([7u8; NONCE_LEN]),
            Err(TripError::NonceReuse(_))
        ));
    }

    #[test]
    fn test_each_seal_unique_nonce() {
        let (alice, bob, _) = pair();
        let e1 = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        let e2 = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        assert_ne!(e1.nonce, e2.nonce);
        assert_ne!(e1.ciphertext, e2.ciphertext);
        assert_ne!(e1.message_id, e2.message_id);
    }

    #[test]
    fn test_registry_append_only() {
        let registry = KeyRegistry::new();
        let agent = AgentIdentity::generate("budget-agent");
        registry.register(agent.public()).unwrap();
        registry.register(agent.public()).unwrap();
        assert_eq!(registry.len(), 1);

        let impostor = AgentIdentity::generate("budget-agent");
        assert!(registry.register(impostor.public()).is_err());
        assert_eq!(
            registry.get("budget-agent").unwrap().verifying_key,
            agent.public().verifying_key
        );
        assert!(matches!(registry.get("nobody"), Err(TripError::UnknownAgent(_))));
    }

    #[test]
    fn test_envelope_serialization_camel_case() {
        let (alice, bob, _) = pair();
        let envelope = alice.seal(&bob.public(), "run-1", &sample_message()).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json["messageId"].is_string());
        assert!(json["correlationId"].is_string());
        let parsed: EncryptedEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
    }
}
