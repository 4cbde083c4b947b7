//! Signing keys using Ed25519

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use skein_core::{Event, PublicKey, Signature, UnsignedEvent};

/// Author keypair
#[derive(Clone)]
pub struct Keys {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Keys {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Create keys from existing secret key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from_bytes(signing_key.verifying_key().to_bytes());
        Keys {
            signing_key,
            public_key,
        }
    }

    /// Get the secret key bytes
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Compute the id of `unsigned` and sign it.
    ///
    /// The event's `pubkey` is overwritten with this keypair's key.
    pub fn sign_event(&self, mut unsigned: UnsignedEvent) -> Event {
        unsigned.pubkey = self.public_key;
        let id = unsigned.id();
        let signature = self.signing_key.sign(id.as_bytes());
        unsigned.into_event(id, Signature::from_bytes(signature.to_bytes()))
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{Kind, Timestamp};

    #[test]
    fn test_key_generation() {
        let k1 = Keys::generate();
        let k2 = Keys::generate();
        assert_ne!(k1.public_key(), k2.public_key());
    }

    #[test]
    fn test_keys_roundtrip() {
        let keys = Keys::generate();
        let restored = Keys::from_bytes(&keys.secret_key_bytes());
        assert_eq!(keys.public_key(), restored.public_key());
    }

    #[test]
    fn test_sign_sets_author_and_id() {
        let keys = Keys::generate();
        let unsigned = UnsignedEvent::new(PublicKey::from_bytes([0; 32]), Timestamp(42), Kind::TEXT_NOTE, "hi");
        let event = keys.sign_event(unsigned);

        assert_eq!(event.pubkey, keys.public_key());
        assert!(event.has_valid_id());
    }
}
