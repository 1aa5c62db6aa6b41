//! Node identity — Ed25519 keys, derived addresses and the crypto envelope.
//!
//! An [`Address`] is the lowercase hex of the last 20 bytes of
//! `SHA-256(public key)`, so any node can re-derive it from an advertised
//! public key and compare it against the claimed address.
//!
//! Encryption to an identity uses an ephemeral X25519 exchange against the
//! Montgomery form of its Ed25519 key, followed by AES-256-GCM. The layout is
//! `ephemeral_public(32) || nonce(12) || ciphertext`.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{NetworkError, Result};

/// Number of hash bytes kept in an address.
pub const ADDRESS_LEN: usize = 20;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_DOMAIN: &[u8] = b"murmur-envelope-v1";

/// A fixed-width peer address derived from a public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Derive the address for the given raw public key bytes.
    pub fn derive(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(hex::encode(&digest[digest.len() - ADDRESS_LEN..]))
    }

    /// Parse and validate an address string.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == ADDRESS_LEN * 2
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(NetworkError::Protocol(format!("Invalid address: {s:?}")))
        }
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The public half of an identity, as exposed by [`Identity::dump`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityInfo {
    pub address: Address,
    pub public_key: String,
}

/// A local (with private key) or remote (public key only) identity.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    verifying_key: VerifyingKey,
    signing_key: Option<SigningKey>,
}

impl Identity {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let seed = Zeroizing::new(rand::random::<[u8; KEY_LEN]>());
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Import a serialized private key (the 32 seed bytes).
    pub fn load(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(NetworkError::Crypto(format!(
                "Invalid private key length: expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut seed = Zeroizing::new([0u8; KEY_LEN]);
        seed.copy_from_slice(bytes);
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// Build a remote identity from an advertised base64 public key.
    pub fn from_public_key(public_key: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(public_key)
            .map_err(|e| NetworkError::Crypto(format!("Invalid public key encoding: {e}")))?;
        let bytes: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetworkError::Crypto("Invalid public key length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| NetworkError::Crypto(format!("Invalid public key: {e}")))?;

        Ok(Self {
            address: Address::derive(verifying_key.as_bytes()),
            verifying_key,
            signing_key: None,
        })
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            address: Address::derive(verifying_key.as_bytes()),
            verifying_key,
            signing_key: Some(signing_key),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Base64 form of the public key, as advertised on the wire.
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.verifying_key.as_bytes())
    }

    pub fn has_private_key(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Serialized private key for persistence. `None` for remote identities.
    pub fn private_key_bytes(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.signing_key
            .as_ref()
            .map(|key| Zeroizing::new(key.to_bytes().to_vec()))
    }

    /// Sign `message` with the private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let key = self.signing_key()?;
        Ok(key.sign(message).to_bytes().to_vec())
    }

    /// Verify a signature made by this identity. Malformed input yields `false`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying_key.verify(message, &signature).is_ok()
    }

    /// Encrypt `plaintext` so that only this identity can read it.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let recipient = self.x25519_public();
        let ephemeral = StaticSecret::from(rand::random::<[u8; KEY_LEN]>());
        let ephemeral_public = X25519PublicKey::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(NetworkError::Crypto("Degenerate key exchange".into()));
        }
        let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| NetworkError::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a ciphertext produced by [`Identity::encrypt`] for this identity.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self.signing_key()?;
        if data.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(NetworkError::Crypto("Ciphertext too short".into()));
        }

        let (ephemeral_bytes, rest) = data.split_at(KEY_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let ephemeral_bytes: [u8; KEY_LEN] = ephemeral_bytes
            .try_into()
            .map_err(|_| NetworkError::Crypto("Invalid ephemeral key".into()))?;

        let secret = StaticSecret::from(signing_key.to_scalar_bytes());
        let shared = secret.diffie_hellman(&X25519PublicKey::from(ephemeral_bytes));
        if !shared.was_contributory() {
            return Err(NetworkError::Crypto("Degenerate key exchange".into()));
        }
        let key = derive_key(
            shared.as_bytes(),
            &ephemeral_bytes,
            self.x25519_public().as_bytes(),
        );

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| NetworkError::Crypto(format!("Decryption failed: {e}")))
    }

    /// The public part of the identity. Never includes the private key.
    pub fn dump(&self) -> IdentityInfo {
        IdentityInfo {
            address: self.address.clone(),
            public_key: self.public_key(),
        }
    }

    fn signing_key(&self) -> Result<&SigningKey> {
        self.signing_key
            .as_ref()
            .ok_or_else(|| NetworkError::Crypto("Identity has no private key".into()))
    }

    fn x25519_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.verifying_key.to_montgomery().to_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("private", &self.signing_key.is_some())
            .finish()
    }
}

fn derive_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    Zeroizing::new(hasher.finalize().to_vec())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_deterministic() {
        let identity = Identity::generate();
        let bytes = identity.private_key_bytes().unwrap();

        let reloaded = Identity::load(&bytes).unwrap();
        assert_eq!(reloaded.address(), identity.address());
        assert_eq!(reloaded.public_key(), identity.public_key());
    }

    #[test]
    fn test_address_format() {
        let identity = Identity::generate();
        let address = identity.address().as_str();
        assert_eq!(address.len(), ADDRESS_LEN * 2);
        assert!(Address::parse(address).is_ok());
        assert!(Address::parse("not-an-address").is_err());
        assert!(Address::parse(&address.to_uppercase()).is_err());
    }

    #[test]
    fn test_remote_identity_rederives_address() {
        let local = Identity::generate();
        let remote = Identity::from_public_key(&local.public_key()).unwrap();
        assert_eq!(remote.address(), local.address());
        assert!(!remote.has_private_key());
        assert!(remote.private_key_bytes().is_none());
    }

    #[test]
    fn test_load_rejects_bad_length() {
        assert!(matches!(
            Identity::load(&[1, 2, 3]),
            Err(NetworkError::Crypto(_))
        ));
    }

    #[test]
    fn test_from_public_key_rejects_garbage() {
        assert!(Identity::from_public_key("%%%").is_err());
        assert!(Identity::from_public_key(&STANDARD.encode([7u8; 5])).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let alice = Identity::generate();
        let alice_pub = Identity::from_public_key(&alice.public_key()).unwrap();
        let message = b"it's a secret to everybody";

        let signature = alice.sign(message).unwrap();
        assert!(alice_pub.verify(message, &signature));
    }

    #[test]
    fn test_verify_rejects_bit_flips() {
        let alice = Identity::generate();
        let message = b"hello swarm".to_vec();
        let signature = alice.sign(&message).unwrap();

        for i in 0..message.len() {
            let mut tampered = message.clone();
            tampered[i] ^= 0x01;
            assert!(!alice.verify(&tampered, &signature));
        }
        for i in 0..signature.len() {
            let mut tampered = signature.clone();
            tampered[i] ^= 0x80;
            assert!(!alice.verify(&message, &tampered));
        }
    }

    #[test]
    fn test_verify_malformed_signature_is_false() {
        let alice = Identity::generate();
        assert!(!alice.verify(b"data", &[]));
        assert!(!alice.verify(b"data", &[0u8; 12]));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let bob = Identity::generate();
        let bob_pub = Identity::from_public_key(&bob.public_key()).unwrap();
        let message = serde_json::json!({"message": "IT’S A SECRET TO EVERYBODY."}).to_string();

        let ciphertext = bob_pub.encrypt(message.as_bytes()).unwrap();
        let plaintext = bob.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, message.as_bytes());
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let bob = Identity::generate();
        let a = bob.encrypt(b"same").unwrap();
        let b = bob.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_recipient_fails() {
        let bob = Identity::generate();
        let eve = Identity::generate();
        let ciphertext = bob.encrypt(b"for bob only").unwrap();
        assert!(matches!(
            eve.decrypt(&ciphertext),
            Err(NetworkError::Crypto(_))
        ));
    }

    #[test]
    fn test_decrypt_corrupt_ciphertext_fails() {
        let bob = Identity::generate();
        let mut ciphertext = bob.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(bob.decrypt(&ciphertext).is_err());
        assert!(bob.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_public_only_cannot_sign_or_decrypt() {
        let bob = Identity::generate();
        let bob_pub = Identity::from_public_key(&bob.public_key()).unwrap();
        let ciphertext = bob_pub.encrypt(b"x").unwrap();
        assert!(bob_pub.sign(b"x").is_err());
        assert!(bob_pub.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_dump_exposes_only_public_parts() {
        let identity = Identity::generate();
        let json = serde_json::to_value(identity.dump()).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["address"], identity.address().as_str());
        assert_eq!(object["publicKey"], identity.public_key());
    }
}
