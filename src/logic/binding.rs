//! Bound signatures: an Ed25519 signature tied to a counter, a timestamp and
//! the key generation that produced it.
//!
//! Wire layout (88 bytes):
//! `counter (u64 BE) ‖ timestamp_ms (u64 BE) ‖ key_generation_ms (u64 BE) ‖ signature (64)`

use ed25519_dalek::{Signature, Signer as _, SigningKey};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::KeyError;
use crate::model::{Ed25519PublicKey, Timestamp};

const BINDING_DOMAIN: &[u8] = b"sealkeep/bound-signature/v1";

/// Length of an encoded bound signature
pub const BOUND_SIGNATURE_LEN: usize = 24 + ed25519_dalek::SIGNATURE_LENGTH;

/// Anti-replay context sampled for every signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingContext {
    /// Value of the persisted monotonic signature counter
    pub counter: u64,
    /// When the signature was produced
    pub timestamp: Timestamp,
    /// Generation time of the signing key
    pub key_generation: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSignature {
    pub context: BindingContext,
    pub signature: Signature,
}

impl BoundSignature {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BOUND_SIGNATURE_LEN);
        out.extend_from_slice(&self.context.counter.to_be_bytes());
        out.extend_from_slice(&self.context.timestamp.to_be_bytes());
        out.extend_from_slice(&self.context.key_generation.to_be_bytes());
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    /// Parse the wire layout
    ///
    /// # Errors
    ///
    /// Returns `KeyError::MalformedSignature` if the length is wrong
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != BOUND_SIGNATURE_LEN {
            return Err(KeyError::MalformedSignature {
                expected: BOUND_SIGNATURE_LEN,
                actual: bytes.len(),
            });
        }
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            w
        };
        let mut sig = [0u8; ed25519_dalek::SIGNATURE_LENGTH];
        sig.copy_from_slice(&bytes[24..]);

        Ok(Self {
            context: BindingContext {
                counter: u64::from_be_bytes(word(0)),
                timestamp: Timestamp::from_be_bytes(word(1)),
                key_generation: Timestamp::from_be_bytes(word(2)),
            },
            signature: Signature::from_bytes(&sig),
        })
    }
}

/// Message actually signed: domain, context and a digest of the payload
pub fn binding_message(context: &BindingContext, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(BINDING_DOMAIN.len() + 24 + 32);
    msg.extend_from_slice(BINDING_DOMAIN);
    msg.extend_from_slice(&context.counter.to_be_bytes());
    msg.extend_from_slice(&context.timestamp.to_be_bytes());
    msg.extend_from_slice(&context.key_generation.to_be_bytes());
    msg.extend_from_slice(&Sha256::digest(payload));
    msg
}

pub fn sign_bound(
    signing_key: &SigningKey,
    context: BindingContext,
    payload: &[u8],
) -> BoundSignature {
    let signature = signing_key.sign(&binding_message(&context, payload));
    BoundSignature { context, signature }
}

/// Check the signature against a public key; no freshness check
pub fn verify_bound(public_key: &Ed25519PublicKey, payload: &[u8], bound: &BoundSignature) -> bool {
    let Ok(verifying_key) = public_key.to_verifying_key() else {
        return false;
    };
    verifying_key
        .verify_strict(&binding_message(&bound.context, payload), &bound.signature)
        .is_ok()
}

/// Whether the binding timestamp is inside `[now - window, now + skew]`
pub fn is_fresh(
    context: &BindingContext,
    now: Timestamp,
    validity_window: Duration,
    clock_skew: Duration,
) -> bool {
    if context.timestamp > now.saturating_add(clock_skew) {
        return false;
    }
    now.saturating_since(context.timestamp) <= validity_window
}
