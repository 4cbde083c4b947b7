//! Event fixtures
//!
//! Authors are derived from a one-byte seed so tests can refer to "author 1"
//! and get the same key every run.

use skein_core::{Event, EventId, Kind, RelayUrl, Signature, Timestamp, UnsignedEvent};
use skein_crypto::Keys;

/// Deterministic author keys
pub fn author(seed: u8) -> Keys {
    Keys::from_bytes(&[seed; 32])
}

/// Test relay address `wss://<name>.test`
pub fn relay(name: &str) -> RelayUrl {
    RelayUrl::parse(&format!("wss://{}.test", name)).expect("fixture relay url")
}

/// `count` relays named `r0`, `r1`, ...
pub fn relays(count: usize) -> Vec<RelayUrl> {
    (0..count).map(|n| relay(&format!("r{}", n))).collect()
}

pub fn note(keys: &Keys, created_at: u64, content: &str) -> Event {
    keys.sign_event(UnsignedEvent::new(
        keys.public_key(),
        Timestamp(created_at),
        Kind::TEXT_NOTE,
        content,
    ))
}

/// Notes at the given times, each with distinct content
pub fn timeline(keys: &Keys, times: impl IntoIterator<Item = u64>) -> Vec<Event> {
    times
        .into_iter()
        .map(|t| note(keys, t, &format!("note at {}", t)))
        .collect()
}

pub fn profile(keys: &Keys, created_at: u64, name: &str) -> Event {
    keys.sign_event(UnsignedEvent::new(
        keys.public_key(),
        Timestamp(created_at),
        Kind::METADATA,
        format!("{{\"name\":\"{}\"}}", name),
    ))
}

pub fn reaction(keys: &Keys, target: EventId, created_at: u64) -> Event {
    keys.sign_event(
        UnsignedEvent::new(keys.public_key(), Timestamp(created_at), Kind::REACTION, "+")
            .tag(["e", target.to_hex().as_str()]),
    )
}

pub fn community(keys: &Keys, identifier: &str, name: &str, created_at: u64) -> Event {
    keys.sign_event(
        UnsignedEvent::new(keys.public_key(), Timestamp(created_at), Kind::COMMUNITY, "")
            .tag(["d", identifier])
            .tag(["name", name]),
    )
}

/// Same event with a signature that does not verify
pub fn forged(event: &Event) -> Event {
    let mut forged = event.clone();
    forged.sig = Signature::from_bytes([0xAB; 64]);
    forged
}
