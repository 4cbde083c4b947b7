//! Event verification
//!
//! An event is authentic when its id matches its body and the signature
//! over the id verifies against the author key.

use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

use skein_core::{Event, SkeinError, SkeinResult};

/// Verify id integrity and signature of a received event
pub fn verify_event(event: &Event) -> SkeinResult<()> {
    if !event.has_valid_id() {
        return Err(SkeinError::InvalidId(event.id));
    }

    let key = VerifyingKey::from_bytes(event.pubkey.as_bytes())
        .map_err(|_| SkeinError::InvalidSignature(event.id))?;
    let sig = DalekSignature::from_bytes(event.sig.as_bytes());

    key.verify(event.id.as_bytes(), &sig)
        .map_err(|_| SkeinError::InvalidSignature(event.id))
}

/// Boolean form of [`verify_event`], logging the reason for rejection
pub fn is_authentic(event: &Event) -> bool {
    match verify_event(event) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(event = ?event.id, "dropping unverifiable event: {}", e);
            false
        }
    }
}
