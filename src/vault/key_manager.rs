//! Key lifecycle: generation, sealing, rotation, signing and verification
//!
//! The manager owns the only copy of the active key material. The private
//! key exists in clear only inside a [`SecureBuffer`] for the duration of a
//! single sign operation (and once at load time to check it against the
//! stored public key).

use ed25519_dalek::SigningKey;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::adapters::{EntropyPool, HardwareCapability};
use crate::config::KeyPolicy;
use crate::error::{KeyError, StorageError, VaultError, VaultResult};
use crate::logic::binding::{is_fresh, sign_bound, verify_bound};
use crate::logic::{BindingContext, BoundSignature, MetadataCipher, IV_LEN, SEED_LEN};
use crate::model::{
    Algorithm, ArchivedKey, Ed25519PublicKey, KeyDescriptor, KeyMaterial, KeyMetadata,
    SealedBlob, SecureBuffer, Timestamp, METADATA_VERSION,
};
use crate::ports::{ChainSigner, Clock, KeyRecord, KeyStore};

/// Leading byte of the metadata seed record
const SEED_HARDWARE_SEALED: u8 = 0x01;
const SEED_PLAIN: u8 = 0x00;

struct RetiredKey {
    material: KeyMaterial,
    retired_at: Timestamp,
}

#[derive(Default)]
struct KeyState {
    active: Option<KeyMaterial>,
    retired: Vec<RetiredKey>,
    metadata_cipher: Option<MetadataCipher>,
    counter: u64,
    archive: Vec<ArchivedKey>,
    loaded: bool,
    wiped: bool,
}

impl KeyState {
    fn latest_generation(&self) -> Option<Timestamp> {
        let active = self.active.as_ref().map(KeyMaterial::generation_time);
        let archived = self.archive.iter().map(|k| k.generation_time).max();
        active.max(archived)
    }
}

pub struct KeyLifecycleManager {
    store: Arc<dyn KeyStore>,
    entropy: EntropyPool,
    hardware: Arc<HardwareCapability>,
    clock: Arc<dyn Clock>,
    policy: KeyPolicy,
    state: Mutex<KeyState>,
}

impl KeyLifecycleManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        entropy: EntropyPool,
        hardware: Arc<HardwareCapability>,
        clock: Arc<dyn Clock>,
        policy: KeyPolicy,
    ) -> Self {
        Self {
            store,
            entropy,
            hardware,
            clock,
            policy,
            state: Mutex::new(KeyState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptor of the active key, if one is loaded
    pub fn active(&self) -> Option<KeyDescriptor> {
        self.state().active.as_ref().map(KeyMaterial::descriptor)
    }

    /// Every public key ever generated, oldest first
    pub fn archive(&self) -> Vec<ArchivedKey> {
        let mut state = self.state();
        if !state.loaded {
            if let Err(e) = self.load_persistent_state(&mut state) {
                warn!("Public key archive unavailable: {}", e);
            }
        }
        state.archive.clone()
    }

    /// Generate a new key generation and make it active
    ///
    /// The previous active key, if any, is retired.
    pub fn generate_keypair(&self) -> VaultResult<KeyDescriptor> {
        let mut state = self.state();
        self.ensure_usable(&mut state)?;
        self.generate_locked(&mut state)
    }

    /// Load the persisted key, generating or rotating as needed
    pub fn load_or_rotate(&self) -> VaultResult<KeyDescriptor> {
        let mut state = self.state();
        self.ensure_usable(&mut state)?;

        let Some(metadata) = self.read_metadata(&mut state)? else {
            info!("No persisted signing key, generating one");
            return self.generate_locked(&mut state);
        };

        let material = self.load_material(&metadata)?;
        let archived = state
            .archive
            .iter()
            .any(|k| k.generation_time == material.generation_time && k.public_key == material.public_key);
        let due = self.is_due(&material);
        let descriptor = material.descriptor();
        state.active = Some(material);

        if !archived {
            warn!("Persisted key is missing from the public key archive, rotating");
            return self.generate_locked(&mut state);
        }
        if due {
            info!(
                "Signing key from {} is past its rotation interval, rotating",
                descriptor.generation_time
            );
            return self.generate_locked(&mut state);
        }

        info!(
            "Loaded signing key {} from {}",
            descriptor.public_key.to_hex(),
            descriptor.generation_time
        );
        Ok(descriptor)
    }

    /// Explicit rotation
    pub fn rotate(&self) -> VaultResult<KeyDescriptor> {
        self.generate_keypair()
    }

    /// Rotate if the active key is older than the rotation interval
    pub fn rotate_if_due(&self) -> VaultResult<Option<KeyDescriptor>> {
        let mut state = self.state();
        self.ensure_usable(&mut state)?;
        let due = match state.active.as_ref() {
            Some(material) => self.is_due(material),
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.generate_locked(&mut state).map(Some)
    }

    /// Drop retired keys whose grace period has elapsed
    ///
    /// Returns how many were erased.
    pub fn prune_retired(&self) -> usize {
        let now = self.clock.now();
        let grace = self.policy.grace_period();
        let mut state = self.state();

        let before = state.retired.len();
        state
            .retired
            .retain(|r| now.saturating_since(r.retired_at) <= grace);
        let pruned = before - state.retired.len();
        if pruned > 0 {
            debug!("Erased {} retired key(s)", pruned);
        }
        pruned
    }

    /// Zeroize every key held in memory; later signs fail with `Wiped`
    pub fn wipe(&self) {
        let mut state = self.state();
        state.active = None;
        state.retired.clear();
        state.metadata_cipher = None;
        state.wiped = true;
        warn!("In-memory key material wiped");
    }

    pub fn is_wiped(&self) -> bool {
        self.state().wiped
    }

    /// Produce an 88-byte bound signature over `payload`
    pub fn sign(&self, payload: &[u8]) -> VaultResult<Vec<u8>> {
        let mut state = self.state();
        if state.wiped {
            return Err(KeyError::Wiped.into());
        }
        let Some(active) = state.active.as_ref() else {
            return Err(signing("no active key"));
        };
        let key_generation = active.generation_time;
        let sealed = active.sealed_private_key.clone();
        let protected = active.hardware_protected;

        // The counter value is consumed before use so it is never reissued,
        // even if signing fails afterwards.
        let counter = state.counter + 1;
        self.store
            .write_atomic(KeyRecord::SignatureCounter, &counter.to_be_bytes())
            .map_err(|e| signing(&format!("cannot persist signature counter: {e}")))?;
        state.counter = counter;

        let context = BindingContext {
            counter,
            timestamp: self.clock.now().max(key_generation),
            key_generation,
        };

        let secret = self
            .hardware
            .unseal(&sealed, protected)
            .map_err(|e| signing(&format!("cannot unseal private key: {e}")))?;
        let signing_key = signing_key_from(&secret).map_err(|_| signing("unsealed key has wrong length"))?;
        let bound = sign_bound(&signing_key, context, payload);

        debug!("Signed {} bytes with counter {}", payload.len(), counter);
        Ok(bound.to_bytes())
    }

    /// Check a bound signature against the active or a retired key
    ///
    /// # Errors
    ///
    /// Returns `KeyError::MalformedSignature` if `signature` does not have
    /// the bound-signature layout. Every other failure is `Ok(false)`.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> VaultResult<bool> {
        let bound = BoundSignature::from_bytes(signature)?;
        let now = self.clock.now();

        if !is_fresh(
            &bound.context,
            now,
            self.policy.validity_window(),
            self.policy.clock_skew(),
        ) {
            debug!(
                "Signature from {} is outside the validity window",
                bound.context.timestamp
            );
            return Ok(false);
        }

        let Some(public_key) = self.verifying_key_for(bound.context.key_generation, now) else {
            debug!(
                "No usable key for generation {}",
                bound.context.key_generation
            );
            return Ok(false);
        };

        Ok(verify_bound(&public_key, payload, &bound))
    }

    fn verifying_key_for(&self, generation: Timestamp, now: Timestamp) -> Option<Ed25519PublicKey> {
        let mut state = self.state();
        if let Some(active) = state.active.as_ref().filter(|m| m.generation_time == generation) {
            return Some(active.public_key);
        }
        let grace = self.policy.grace_period();
        let retired = state
            .retired
            .iter()
            .find(|r| r.material.generation_time == generation)
            .filter(|r| now.saturating_since(r.retired_at) <= grace)
            .map(|r| r.material.public_key);
        if retired.is_some() {
            return retired;
        }

        if !state.loaded {
            if let Err(e) = self.load_persistent_state(&mut state) {
                debug!("Public key archive unavailable for verification: {}", e);
                return None;
            }
        }
        archived_key_in_grace(&state.archive, generation, now, grace)
    }

    fn ensure_usable(&self, state: &mut KeyState) -> VaultResult<()> {
        if state.wiped {
            return Err(KeyError::Wiped.into());
        }
        if !state.loaded {
            self.load_persistent_state(state)?;
        }
        Ok(())
    }

    fn is_due(&self, material: &KeyMaterial) -> bool {
        self.clock.now().saturating_since(material.generation_time) > self.policy.rotation_interval()
    }

    /// Counter and archive, which outlive individual key generations
    fn load_persistent_state(&self, state: &mut KeyState) -> VaultResult<()> {
        state.counter = match self.read_record(KeyRecord::SignatureCounter)? {
            None => 0,
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    load_error(&format!("signature counter has {} bytes", bytes.len()))
                })?;
                u64::from_be_bytes(bytes)
            }
        };

        state.archive = match self.read_record(KeyRecord::PublicKeyArchive)? {
            None => Vec::new(),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| load_error(&format!("public key archive: {e}")))?,
        };

        state.loaded = true;
        Ok(())
    }

    fn read_record(&self, record: KeyRecord) -> VaultResult<Option<Vec<u8>>> {
        self.store.read(record).map_err(|e| match e {
            VaultError::Storage(e) => load_error(&e.to_string()),
            other => other,
        })
    }

    fn read_metadata(&self, state: &mut KeyState) -> VaultResult<Option<KeyMetadata>> {
        let Some(record) = self.read_record(KeyRecord::Metadata)? else {
            return Ok(None);
        };
        let cipher = self.load_cipher(state)?;
        let plaintext = cipher.open(&record)?;
        let metadata: KeyMetadata = serde_json::from_slice(&plaintext)
            .map_err(|e| load_error(&format!("metadata does not parse: {e}")))?;

        if metadata.version != METADATA_VERSION {
            return Err(load_error(&format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }
        Ok(Some(metadata))
    }

    fn load_cipher<'a>(&self, state: &'a mut KeyState) -> VaultResult<&'a MetadataCipher> {
        if state.metadata_cipher.is_none() {
            let record = self
                .read_record(KeyRecord::MetadataSeed)?
                .ok_or_else(|| load_error("metadata exists but its key seed is missing"))?;
            let seed = self.unseal_seed(&record)?;
            state.metadata_cipher = Some(MetadataCipher::derive(
                &seed,
                self.policy.metadata_kdf_iterations,
            ));
        }
        state
            .metadata_cipher
            .as_ref()
            .ok_or_else(|| load_error("metadata key unavailable"))
    }

    fn unseal_seed(&self, record: &[u8]) -> VaultResult<SecureBuffer> {
        let (flag, blob) = record
            .split_first()
            .ok_or_else(|| load_error("metadata key seed is empty"))?;
        let protected = match *flag {
            SEED_HARDWARE_SEALED => true,
            SEED_PLAIN => false,
            other => return Err(load_error(&format!("unknown seed protection {other:#04x}"))),
        };
        let seed = self
            .hardware
            .unseal(&SealedBlob::new(blob.to_vec()), protected)
            .map_err(|e| load_error(&format!("cannot unseal metadata key seed: {e}")))?;
        if seed.len() != SEED_LEN {
            return Err(load_error("metadata key seed has wrong length"));
        }
        Ok(seed)
    }

    /// Create and persist the metadata key seed on first use
    fn create_cipher<'a>(&self, state: &'a mut KeyState) -> VaultResult<&'a MetadataCipher> {
        if state.metadata_cipher.is_none() {
            let existing = self.read_record(KeyRecord::MetadataSeed)?;
            let seed = match existing {
                Some(record) => self.unseal_seed(&record)?,
                None => {
                    let seed = self.entropy.get_random(SEED_LEN)?;
                    let (blob, protected) = self.hardware.seal(&seed)?;
                    let flag = if protected { SEED_HARDWARE_SEALED } else { SEED_PLAIN };

                    let mut record = Vec::with_capacity(1 + blob.len());
                    record.push(flag);
                    record.extend_from_slice(blob.as_bytes());
                    self.store.write_atomic(KeyRecord::MetadataSeed, &record)?;
                    zeroize::Zeroize::zeroize(&mut record);
                    seed
                }
            };
            state.metadata_cipher = Some(MetadataCipher::derive(
                &seed,
                self.policy.metadata_kdf_iterations,
            ));
        }
        state
            .metadata_cipher
            .as_ref()
            .ok_or_else(|| generation("metadata key unavailable"))
    }

    fn load_material(&self, metadata: &KeyMetadata) -> VaultResult<KeyMaterial> {
        let public = self
            .read_record(KeyRecord::PublicKey)?
            .ok_or_else(|| load_error("public key file is missing"))?;
        let public_key = Ed25519PublicKey::from_slice(&public)
            .map_err(|e| load_error(&format!("public key: {e}")))?;

        let sealed = self
            .read_record(KeyRecord::SealedPrivateKey)?
            .ok_or_else(|| load_error("sealed private key file is missing"))?;
        if sealed.is_empty() {
            return Err(load_error("sealed private key file is empty"));
        }
        let expected = metadata.algorithm.private_key_len();
        if !metadata.hardware_protected && sealed.len() != expected {
            return Err(load_error(&format!(
                "unprotected private key must be {} bytes, got {}",
                expected,
                sealed.len()
            )));
        }
        let sealed = SealedBlob::new(sealed);

        let secret = self
            .hardware
            .unseal(&sealed, metadata.hardware_protected)
            .map_err(|e| load_error(&format!("cannot unseal private key: {e}")))?;
        let signing_key = signing_key_from(&secret)?;
        if Ed25519PublicKey::from(&signing_key) != public_key {
            return Err(load_error("sealed private key does not match the public key"));
        }

        Ok(KeyMaterial {
            public_key,
            sealed_private_key: sealed,
            algorithm: metadata.algorithm,
            generation_time: metadata.generation_time,
            hardware_protected: metadata.hardware_protected,
        })
    }

    fn generate_locked(&self, state: &mut KeyState) -> VaultResult<KeyDescriptor> {
        let now = self.clock.now();
        let generation_time = match state.latest_generation() {
            Some(previous) => now.max(previous.next()),
            None => now,
        };
        let algorithm = Algorithm::default_signing();

        let secret = self.entropy.get_random(algorithm.private_key_len())?;
        if is_weak_secret(secret.as_slice()) {
            return Err(generation("entropy produced a degenerate secret"));
        }
        let signing_key = signing_key_from(&secret)?;
        if signing_key.verifying_key().is_weak() {
            return Err(generation("derived public key is a weak point"));
        }
        let public_key = Ed25519PublicKey::from(&signing_key);
        drop(signing_key);

        let (sealed, hardware_protected) = self.hardware.seal(&secret)?;
        drop(secret);
        if !hardware_protected {
            warn!("Signing key {} is not hardware protected", public_key.to_hex());
        }

        let material = KeyMaterial {
            public_key,
            sealed_private_key: sealed,
            algorithm,
            generation_time,
            hardware_protected,
        };
        self.persist(state, &material)?;

        if let Some(previous) = state.active.replace(material) {
            debug!("Retiring key generation {}", previous.generation_time);
            state.retired.push(RetiredKey {
                material: previous,
                retired_at: now,
            });
        }

        let descriptor = KeyMaterial::descriptor(
            state
                .active
                .as_ref()
                .ok_or_else(|| generation("active key vanished"))?,
        );
        info!(
            "Generated signing key {} at {}",
            descriptor.public_key.to_hex(),
            descriptor.generation_time
        );
        Ok(descriptor)
    }

    /// Public key, sealed key and archive first; metadata last as the commit
    fn persist(&self, state: &mut KeyState, material: &KeyMaterial) -> VaultResult<()> {
        let mut iv = [0u8; IV_LEN];
        self.entropy.fill(&mut iv)?;
        let metadata = serde_json::to_vec(&material.metadata())
            .map_err(|e| generation(&format!("metadata encoding: {e}")))?;
        let record = self.create_cipher(state)?.seal(&iv, &metadata)?;

        self.store
            .write_atomic(KeyRecord::PublicKey, material.public_key.as_bytes())?;
        self.store.write_atomic(
            KeyRecord::SealedPrivateKey,
            material.sealed_private_key.as_bytes(),
        )?;

        let mut archive = state.archive.clone();
        archive.push(ArchivedKey {
            generation_time: material.generation_time,
            algorithm: material.algorithm,
            public_key: material.public_key,
        });
        let encoded = serde_json::to_vec_pretty(&archive).map_err(|e| {
            VaultError::Storage(StorageError::InvalidRecord {
                record: KeyRecord::PublicKeyArchive.file_name().to_string(),
                reason: e.to_string(),
            })
        })?;
        self.store
            .write_atomic(KeyRecord::PublicKeyArchive, &encoded)?;
        state.archive = archive;

        self.store.write_atomic(KeyRecord::Metadata, &record)?;
        Ok(())
    }
}

impl ChainSigner for KeyLifecycleManager {
    fn sign_digest(&self, digest: &[u8]) -> VaultResult<Vec<u8>> {
        self.sign(digest)
    }
}

impl std::fmt::Debug for KeyLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLifecycleManager")
            .field("active", &self.active())
            .field("hardware", &self.hardware)
            .finish_non_exhaustive()
    }
}

fn signing_key_from(secret: &SecureBuffer) -> VaultResult<SigningKey> {
    let bytes = secret
        .as_array::<{ ed25519_dalek::SECRET_KEY_LENGTH }>()
        .ok_or_else(|| load_error(&format!("private key has {} bytes", secret.len())))?;
    Ok(SigningKey::from_bytes(bytes))
}

/// Public key of an archived generation still inside its grace period
///
/// A generation counts as retired from the moment its successor was
/// generated. The latest archived generation has no successor and is only
/// usable as the active key.
fn archived_key_in_grace(
    archive: &[ArchivedKey],
    generation: Timestamp,
    now: Timestamp,
    grace: std::time::Duration,
) -> Option<Ed25519PublicKey> {
    let key = archive.iter().find(|k| k.generation_time == generation)?;
    let retired_at = archive
        .iter()
        .map(|k| k.generation_time)
        .filter(|t| *t > generation)
        .min()?;
    (now.saturating_since(retired_at) <= grace).then_some(key.public_key)
}

/// All bytes equal means the entropy source is stuck
fn is_weak_secret(secret: &[u8]) -> bool {
    secret.windows(2).all(|w| w[0] == w[1])
}

fn load_error(reason: &str) -> VaultError {
    VaultError::Key(KeyError::Load {
        reason: reason.to_string(),
    })
}

fn generation(reason: &str) -> VaultError {
    VaultError::Key(KeyError::Generation {
        reason: reason.to_string(),
    })
}

fn signing(reason: &str) -> VaultError {
    VaultError::Key(KeyError::Signing {
        reason: reason.to_string(),
    })
}
