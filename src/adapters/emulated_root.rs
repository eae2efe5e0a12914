//! In-process software root of trust
//!
//! Behaves like a small TPM: 24 SHA-256 measurement registers, sealing bound
//! to the boot registers and Ed25519-signed quotes. It offers no protection
//! against an attacker who can read process memory and is meant for
//! development and tests.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer as _, SigningKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{HardwareError, VaultError, VaultResult};
use crate::model::{Ed25519PublicKey, HashDigest, SecureBuffer};
use crate::ports::HardwareRoot;

/// Number of measurement registers
pub const REGISTER_COUNT: u32 = 24;

/// Registers whose values a sealed blob is bound to
const SEAL_POLICY_REGISTERS: std::ops::Range<u32> = 0..8;

const NONCE_LEN: usize = 12;
const SEAL_DOMAIN: &[u8] = b"sealkeep/emulated-seal/v1";
const QUOTE_DOMAIN: &[u8] = b"sealkeep/emulated-quote/v1";

pub struct EmulatedRoot {
    seal_key: Zeroizing<[u8; 32]>,
    attestation_key: SigningKey,
    registers: Mutex<[[u8; 32]; REGISTER_COUNT as usize]>,
}

impl EmulatedRoot {
    /// Fresh root with random keys
    pub fn new() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut seed[..]);
        Self::from_seed(&seed)
    }

    /// Deterministic root, so blobs sealed in one run unseal in the next
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let seal_key = Zeroizing::new(derive(b"seal", seed));
        let attestation_secret = Zeroizing::new(derive(b"attestation", seed));

        Self {
            seal_key,
            attestation_key: SigningKey::from_bytes(&attestation_secret),
            registers: Mutex::new([[0u8; 32]; REGISTER_COUNT as usize]),
        }
    }

    /// Public key that verifies this root's quotes
    pub fn attestation_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey::from(&self.attestation_key)
    }

    /// Check a quote produced by [`HardwareRoot::quote`]
    pub fn verify_quote(&self, data: &[u8], quote: &[u8]) -> bool {
        if quote.len() != 32 + ed25519_dalek::SIGNATURE_LENGTH {
            return false;
        }
        let (composite, sig) = quote.split_at(32);
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        self.attestation_key
            .verifying_key()
            .verify_strict(&quote_message(data, composite), &signature)
            .is_ok()
    }

    fn check_register(register: u32) -> VaultResult<usize> {
        if register >= REGISTER_COUNT {
            return Err(VaultError::Hardware(HardwareError::Register {
                register,
                reason: format!("only {REGISTER_COUNT} registers exist"),
            }));
        }
        Ok(register as usize)
    }

    /// Additional data binding a blob to the seal-policy registers
    fn policy_aad(&self) -> Vec<u8> {
        let registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut aad = SEAL_DOMAIN.to_vec();
        for index in SEAL_POLICY_REGISTERS {
            aad.extend_from_slice(&registers[index as usize]);
        }
        aad
    }

    fn register_composite(&self) -> [u8; 32] {
        let registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut hasher = Sha256::new();
        for value in registers.iter() {
            hasher.update(value);
        }
        hasher.finalize().into()
    }
}

impl Default for EmulatedRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EmulatedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedRoot")
            .field("attestation_key", &self.attestation_key())
            .finish_non_exhaustive()
    }
}

fn derive(label: &[u8], seed: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sealkeep/emulated-root/");
    hasher.update(label);
    hasher.update(seed);
    hasher.finalize().into()
}

fn quote_message(data: &[u8], composite: &[u8]) -> Vec<u8> {
    let mut msg = QUOTE_DOMAIN.to_vec();
    msg.extend_from_slice(&Sha256::digest(data));
    msg.extend_from_slice(composite);
    msg
}

impl HardwareRoot for EmulatedRoot {
    fn name(&self) -> &str {
        "emulated"
    }

    fn seal(&self, data: &[u8]) -> VaultResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.seal_key[..]).map_err(|e| {
            HardwareError::Seal {
                reason: e.to_string(),
            }
        })?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let aad = self.policy_aad();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: data, aad: &aad })
            .map_err(|_| HardwareError::Seal {
                reason: "encryption failed".to_string(),
            })?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        debug!("Sealed {} bytes", data.len());
        Ok(blob)
    }

    fn unseal(&self, blob: &[u8]) -> VaultResult<SecureBuffer> {
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Hardware(HardwareError::Unseal {
                reason: format!("blob too short: {} bytes", blob.len()),
            }));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.seal_key[..]).map_err(|e| {
            HardwareError::Unseal {
                reason: e.to_string(),
            }
        })?;
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let aad = self.policy_aad();
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| HardwareError::Unseal {
                    reason: "authentication failed or platform state changed".to_string(),
                })?,
        );
        Ok(SecureBuffer::from_slice(&plaintext))
    }

    fn quote(&self, data: &[u8]) -> VaultResult<Vec<u8>> {
        let composite = self.register_composite();
        let signature = self.attestation_key.sign(&quote_message(data, &composite));

        let mut quote = Vec::with_capacity(32 + ed25519_dalek::SIGNATURE_LENGTH);
        quote.extend_from_slice(&composite);
        quote.extend_from_slice(&signature.to_bytes());
        Ok(quote)
    }

    fn extend(&self, register: u32, digest: &HashDigest) -> VaultResult<()> {
        let index = Self::check_register(register)?;
        let mut registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);

        let mut hasher = Sha256::new();
        hasher.update(registers[index]);
        hasher.update(digest.as_bytes());
        registers[index] = hasher.finalize().into();
        debug!("Extended register {}", register);
        Ok(())
    }

    fn read_register(&self, register: u32) -> VaultResult<HashDigest> {
        let index = Self::check_register(register)?;
        let registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(HashDigest::new(registers[index]))
    }
}
