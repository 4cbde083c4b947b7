//! Skein Feed Demo
//!
//! Wires an in-memory relay set to a live feed:
//! - Seeds three relays with overlapping history
//! - Registers a capped feed and prints its snapshot
//! - Publishes new notes and prints them as they arrive live
//! - Pages back through older history

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::info;

use skein_core::{Event, Filter, Kind, RelayUrl, Timestamp, UnsignedEvent};
use skein_crypto::Keys;
use skein_runtime::{init_tracing, FeedRequest, FeedView, LogFormat, Skein, SkeinConfig};
use skein_transport::MemoryRelayPool;

const FEED_LIMIT: usize = 5;

fn note(keys: &Keys, created_at: u64, content: String) -> Event {
    keys.sign_event(UnsignedEvent::new(
        keys.public_key(),
        Timestamp(created_at),
        Kind::TEXT_NOTE,
        content,
    ))
}

fn print_events(title: &str, events: &[Event]) {
    println!("   {} ({} events)", title, events.len());
    for event in events {
        println!("     [{}] {}: {}", event.created_at, &event.pubkey.to_hex()[..8], event.content);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::Pretty);

    println!("=== Skein Feed Demo ===\n");

    // 1. Relays with overlapping history
    println!("1. Seeding relays...");
    let relays: Vec<RelayUrl> = ["wss://alpha.demo", "wss://beta.demo", "wss://gamma.demo"]
        .iter()
        .map(|r| RelayUrl::parse(r))
        .collect::<Result<_, _>>()?;
    let pool = MemoryRelayPool::with_relays(&relays);

    let authors: Vec<Keys> = (0..3).map(|_| Keys::generate()).collect();
    let mut rng = rand::thread_rng();
    let base = Timestamp::now().as_secs() - 3600;
    for i in 0..20u64 {
        let keys = &authors[rng.gen_range(0..authors.len())];
        let event = note(keys, base + i * 60, format!("history #{}", i));
        // Each note lands on one or two relays
        for relay in relays.iter().filter(|_| rng.gen_bool(0.6)) {
            pool.insert(relay, event.clone());
        }
        pool.insert(&relays[(i as usize) % relays.len()], event);
    }
    for relay in &relays {
        println!("   {} holds {} notes", relay, pool.stored(relay).len());
    }

    // 2. Start the service
    println!("\n2. Starting skein...");
    let mut config = SkeinConfig::from_env()?;
    config.default_relays = relays.clone();
    let skein = Skein::start(config, Arc::new(pool.clone()))?;
    println!("   Backend: {:?}", skein.backend_kind());

    // 3. Feed with a live listener
    println!("\n3. Registering feed (limit {})...", FEED_LIMIT);
    let filters = vec![Filter::new().kind(Kind::TEXT_NOTE)];
    let feed = FeedRequest::new(filters.clone(), FEED_LIMIT).named("demo-home");
    let _live = skein.register_feed(feed.clone(), |event: &Event| {
        println!("   live: [{}] {}", event.created_at, event.content);
    });

    let snapshot = skein.request_snapshot(feed.clone()).await;
    print_events("Snapshot", &snapshot);

    // 4. Publish new notes
    println!("\n4. Publishing...");
    for i in 0..3 {
        let event = note(&authors[0], Timestamp::now().as_secs() + i, format!("fresh #{}", i));
        let accepted = skein.publish(&event, None).await;
        info!(event = %event.id, accepted, "published");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    print_events("Snapshot after publish", &skein.request_snapshot(feed).await);

    // 5. Page back beyond the live buffer
    println!("\n5. Paging back...");
    let mut view = FeedView::from_events(snapshot);
    for page in 1..=3 {
        let added = skein.fetch_older(filters.clone(), None, &mut view, FEED_LIMIT).await;
        println!("   page {}: {} new, {} held", page, added, view.len());
    }
    if let Some(oldest) = view.oldest() {
        println!("   oldest held: [{}] {}", oldest.created_at, oldest.content);
    }

    // 6. Stats
    let stats = skein.stats().await?;
    println!("\n6. Stats");
    println!("   requests created:    {}", stats.requests_created);
    println!("   requests dispatched: {}", stats.requests_dispatched);
    println!("   shared joins:        {}", stats.shared_joins);
    println!("   events received:     {}", stats.events_received);

    skein.shutdown();
    println!("\n=== Demo Complete ===");
    Ok(())
}
