//! Principal credentials and the user-secrets collaborator.
//!
//! Two distinct concerns live here:
//!
//! - [`PrincipalSecrets`]: the client-id + secret-hash pair stored in the
//!   persistence backend's dedicated secrets slice and referenced from a
//!   principal's `client_id` internal property. Only hashes are stored;
//!   plaintext secrets appear solely in the result of a generate or rotate
//!   call.
//! - [`UserSecretsManager`]: the external secrets store consumed when
//!   persisting user-supplied credentials (e.g. connection bearer tokens).
//!   Only [`UserSecretReference`] crosses the boundary; the plaintext is
//!   never written into an entity.

use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::RwLock;
use uuid::Uuid;

use serde::{Deserialize, Serialize};
use strata_core::{Error, Result};

use crate::entity::Entity;

/// Hex-encoded SHA-256 of a secret.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn random_secret() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// The stored credentials of a principal.
///
/// The backend keeps `(client_id, main_secret_hash, secondary_secret_hash,
/// principal_id)`; the plaintext fields are populated only on the value
/// returned from a generate or rotate call and are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalSecrets {
    /// Id of the owning principal entity.
    pub principal_id: i64,
    /// The principal's OAuth client id.
    pub client_id: String,
    /// Hash of the currently-active main secret.
    pub main_secret_hash: String,
    /// Hash of the previous secret, still accepted until the next rotation.
    pub secondary_secret_hash: String,
    /// Plaintext main secret; only present on generate/rotate results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_secret: Option<String>,
    /// Plaintext secondary secret; only present on generate results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_secret: Option<String>,
}

impl PrincipalSecrets {
    /// Generates fresh credentials for a principal.
    ///
    /// Both the main and secondary secrets are independently usable; the
    /// plaintexts are returned exactly once, here.
    #[must_use]
    pub fn generate(principal_id: i64) -> Self {
        let main_secret = random_secret();
        let secondary_secret = random_secret();
        Self {
            principal_id,
            client_id: Uuid::new_v4().simple().to_string(),
            main_secret_hash: hash_secret(&main_secret),
            secondary_secret_hash: hash_secret(&secondary_secret),
            main_secret: Some(main_secret),
            secondary_secret: Some(secondary_secret),
        }
    }

    /// Rotates the credentials.
    ///
    /// A new main secret is generated and its plaintext exposed on the
    /// result. Without `reset`, the caller-supplied `old_main_secret_hash`
    /// stays valid as the secondary secret so in-flight clients keep
    /// working; with `reset`, both slots are replaced and every previous
    /// secret stops validating.
    pub fn rotate(&mut self, reset: bool, old_main_secret_hash: &str) {
        let main_secret = random_secret();
        self.main_secret_hash = hash_secret(&main_secret);
        self.main_secret = Some(main_secret);
        self.secondary_secret = None;
        self.secondary_secret_hash = if reset {
            hash_secret(&random_secret())
        } else {
            old_main_secret_hash.to_string()
        };
    }

    /// True when the plaintext matches the main or secondary secret.
    #[must_use]
    pub fn matches(&self, secret: &str) -> bool {
        let hash = hash_secret(secret);
        hash == self.main_secret_hash || hash == self.secondary_secret_hash
    }

    /// Returns a copy with the plaintext fields stripped, the only form
    /// the backend may store.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            main_secret: None,
            secondary_secret: None,
            ..self.clone()
        }
    }
}

/// An opaque reference to a secret held by a [`UserSecretsManager`].
///
/// The URN has the form `urn:polaris-secret:<scheme>:<entity-id>:<ordinal>`.
/// The reference payload carries whatever the manager implementation needs
/// to recover and integrity-check the secret; it never contains the
/// plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSecretReference {
    /// The secret's URN.
    pub urn: String,
    /// Implementation-owned recovery payload.
    pub reference_payload: BTreeMap<String, String>,
}

impl UserSecretReference {
    /// The `<scheme>` component of the URN, if well-formed.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.urn.split(':').nth(2)
    }
}

/// External secrets store consumed by the metastore manager.
pub trait UserSecretsManager: Send + Sync {
    /// Stores a secret on behalf of `for_entity` and returns the reference
    /// to persist in its place.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying store rejects the write.
    fn write_secret(&self, secret: &str, for_entity: &Entity) -> Result<UserSecretReference>;

    /// Recovers a secret; `None` when it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored ciphertext fails its integrity
    /// check.
    fn read_secret(&self, reference: &UserSecretReference) -> Result<Option<String>>;

    /// Deletes a secret; deleting an absent secret is a no-op.
    fn delete_secret(&self, reference: &UserSecretReference);
}

const IN_MEMORY_SCHEME: &str = "unsafe-in-memory";
const CIPHERTEXT_HASH_KEY: &str = "ciphertext-hash";
const ENCRYPTION_KEY_KEY: &str = "encryption-key";

/// In-memory [`UserSecretsManager`] for tests and development.
///
/// Secrets are XOR-encrypted with a one-time keystream whose seed lives in
/// the reference payload, so recovering a secret requires both the stored
/// ciphertext and the reference. The payload also carries a hash of the
/// base64 ciphertext to detect corruption between write and read; a
/// production backend should use a cryptographic MAC instead.
#[derive(Debug, Default)]
pub struct InMemoryUserSecretsManager {
    store: RwLock<BTreeMap<String, String>>,
}

impl InMemoryUserSecretsManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrupts the stored ciphertext under `urn`. Test hook.
    pub fn corrupt(&self, urn: &str) {
        if let Ok(mut store) = self.store.write() {
            if let Some(ciphertext) = store.get_mut(urn) {
                ciphertext.push('x');
            }
        }
    }
}

/// Expands a seed into `len` keystream bytes via chained SHA-256 blocks.
fn keystream(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

impl UserSecretsManager for InMemoryUserSecretsManager {
    fn write_secret(&self, secret: &str, for_entity: &Entity) -> Result<UserSecretReference> {
        let seed = Uuid::new_v4();
        let pad = keystream(seed.as_bytes(), secret.len());
        let ciphertext: Vec<u8> = secret
            .as_bytes()
            .iter()
            .zip(&pad)
            .map(|(byte, key)| byte ^ key)
            .collect();
        let ciphertext_b64 = base64::engine::general_purpose::STANDARD.encode(&ciphertext);

        let mut store = self
            .store
            .write()
            .map_err(|_| Error::internal("secret store lock poisoned"))?;

        // Ordinals disambiguate multiple secrets for the same entity.
        let mut urn = String::new();
        for ordinal in 0.. {
            urn = format!(
                "urn:polaris-secret:{IN_MEMORY_SCHEME}:{}:{ordinal}",
                for_entity.id
            );
            if !store.contains_key(&urn) {
                break;
            }
        }
        store.insert(urn.clone(), ciphertext_b64.clone());
        drop(store);

        let mut reference_payload = BTreeMap::new();
        reference_payload.insert(
            CIPHERTEXT_HASH_KEY.to_string(),
            hex_encode(&Sha256::digest(ciphertext_b64.as_bytes())),
        );
        reference_payload.insert(
            ENCRYPTION_KEY_KEY.to_string(),
            base64::engine::general_purpose::STANDARD.encode(seed.as_bytes()),
        );

        Ok(UserSecretReference {
            urn,
            reference_payload,
        })
    }

    fn read_secret(&self, reference: &UserSecretReference) -> Result<Option<String>> {
        let store = self
            .store
            .read()
            .map_err(|_| Error::internal("secret store lock poisoned"))?;
        let Some(ciphertext_b64) = store.get(&reference.urn).cloned() else {
            return Ok(None);
        };
        drop(store);

        let expected_hash = reference
            .reference_payload
            .get(CIPHERTEXT_HASH_KEY)
            .ok_or_else(|| Error::InvalidInput("secret reference lacks ciphertext hash".into()))?;
        let actual_hash = hex_encode(&Sha256::digest(ciphertext_b64.as_bytes()));
        if &actual_hash != expected_hash {
            return Err(Error::store(format!(
                "ciphertext hash mismatch for {}: expected {expected_hash} got {actual_hash}",
                reference.urn
            )));
        }

        let seed_b64 = reference
            .reference_payload
            .get(ENCRYPTION_KEY_KEY)
            .ok_or_else(|| Error::InvalidInput("secret reference lacks encryption key".into()))?;
        let seed = base64::engine::general_purpose::STANDARD
            .decode(seed_b64)
            .map_err(Error::serialization)?;
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&ciphertext_b64)
            .map_err(Error::serialization)?;

        let pad = keystream(&seed, ciphertext.len());
        let plaintext: Vec<u8> = ciphertext
            .iter()
            .zip(&pad)
            .map(|(byte, key)| byte ^ key)
            .collect();
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(Error::serialization)
    }

    fn delete_secret(&self, reference: &UserSecretReference) {
        if let Ok(mut store) = self.store.write() {
            store.remove(&reference.urn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntitySubType, EntityType, NULL_ID, ROOT_ENTITY_ID};

    fn principal() -> Entity {
        Entity::new(
            NULL_ID,
            42,
            EntityType::Principal,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            "etl-service",
        )
    }

    #[test]
    fn generated_secrets_validate_and_redact() {
        let secrets = PrincipalSecrets::generate(42);
        let main = secrets.main_secret.clone().unwrap();
        let secondary = secrets.secondary_secret.clone().unwrap();
        assert!(secrets.matches(&main));
        assert!(secrets.matches(&secondary));
        assert!(!secrets.matches("wrong"));

        let stored = secrets.redacted();
        assert!(stored.main_secret.is_none());
        assert!(stored.secondary_secret.is_none());
        assert_eq!(stored.main_secret_hash, secrets.main_secret_hash);
    }

    #[test]
    fn rotation_keeps_old_secret_as_secondary() {
        let mut secrets = PrincipalSecrets::generate(42);
        let old_main = secrets.main_secret.clone().unwrap();
        let old_hash = secrets.main_secret_hash.clone();

        secrets.rotate(false, &old_hash);
        let new_main = secrets.main_secret.clone().unwrap();
        assert_ne!(new_main, old_main);
        assert!(secrets.matches(&new_main));
        assert!(secrets.matches(&old_main));
    }

    #[test]
    fn reset_rotation_invalidates_everything_prior() {
        let mut secrets = PrincipalSecrets::generate(42);
        let old_main = secrets.main_secret.clone().unwrap();
        let old_hash = secrets.main_secret_hash.clone();

        secrets.rotate(true, &old_hash);
        assert!(!secrets.matches(&old_main));
        assert!(secrets.matches(secrets.main_secret.as_ref().unwrap()));
    }

    #[test]
    fn secret_round_trip() {
        let manager = InMemoryUserSecretsManager::new();
        let reference = manager
            .write_secret("bearer-token-123", &principal())
            .unwrap();
        assert_eq!(reference.scheme(), Some("unsafe-in-memory"));
        assert!(reference.urn.starts_with("urn:polaris-secret:unsafe-in-memory:42:"));

        let recovered = manager.read_secret(&reference).unwrap();
        assert_eq!(recovered.as_deref(), Some("bearer-token-123"));
    }

    #[test]
    fn ordinals_distinguish_secrets_of_one_entity() {
        let manager = InMemoryUserSecretsManager::new();
        let first = manager.write_secret("one", &principal()).unwrap();
        let second = manager.write_secret("two", &principal()).unwrap();
        assert_ne!(first.urn, second.urn);
        assert_eq!(manager.read_secret(&first).unwrap().as_deref(), Some("one"));
        assert_eq!(manager.read_secret(&second).unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn corrupted_ciphertext_fails_integrity_check() {
        let manager = InMemoryUserSecretsManager::new();
        let reference = manager.write_secret("payload", &principal()).unwrap();
        manager.corrupt(&reference.urn);
        assert!(manager.read_secret(&reference).is_err());
    }

    #[test]
    fn deleted_secret_reads_as_absent() {
        let manager = InMemoryUserSecretsManager::new();
        let reference = manager.write_secret("payload", &principal()).unwrap();
        manager.delete_secret(&reference);
        assert_eq!(manager.read_secret(&reference).unwrap(), None);
    }
}
