//! Two editors in one room
//!
//! Starts an in-process relay, opens two sessions on the same room, edits
//! the shared text from both sides and places a call between them using
//! the in-memory media backend.
//!
//! Run with: cargo run --example two_editors

use std::sync::Arc;
use std::time::Duration;

use huddle_core::{CursorPosition, RoomId, RoomManager};
use huddle_mesh::{MediaConstraints, MemoryConnector, MemoryDevices, PeerId};
use huddle_session::{CollabSession, SessionConfig};
use huddle_transport::{Credential, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Huddle Two Editors Example\n");

    let (addr, _relay) = RelayServer::new(Arc::new(RoomManager::new()))
        .bind("127.0.0.1:0".parse()?)
        .await?;
    let config = SessionConfig::new(format!("ws://{}/collab", addr));
    let room = RoomId::new("notes:standup")?;

    let alice = open(&config, &room, "alice", "Alice")?;
    let bob = open(&config, &room, "bob", "Bob")?;
    wait_until(|| alice.connection().is_open() && bob.connection().is_open()).await;

    println!("=== Editing ===\n");
    alice.apply_local_change("Agenda:\n")?;
    wait_until(|| bob.text() == "Agenda:\n").await;

    bob.apply_local_change("Agenda:\n- release notes\n")?;
    alice.broadcast_cursor(CursorPosition::new(1, 0))?;
    wait_until(|| alice.text() == bob.text() && alice.text().contains("release")).await;

    println!("Alice sees:\n{}", alice.text());
    println!("Bob sees:\n{}", bob.text());
    for participant in bob.participants() {
        println!("Bob's roster: {} ({}) cursor {:?}", participant.display_name, participant.id, participant.cursor);
    }

    println!("\n=== Calling ===\n");
    alice.join_call(MediaConstraints::default()).await?;
    bob.join_call(MediaConstraints::default()).await?;
    wait_until(|| bob.mesh().link_state(&PeerId::new("alice")).map_or(false, |s| s.is_live())).await;

    for link in bob.mesh().links() {
        println!("Bob -> {}: {} (initiator: {})", link.peer_id, link.state, link.initiator);
    }
    println!("Alice microphone on: {}", alice.toggle_microphone()?);

    alice.close();
    bob.close();
    println!("\nDone.");
    Ok(())
}

fn open(
    config: &SessionConfig,
    room: &RoomId,
    id: &str,
    name: &str,
) -> Result<CollabSession, Box<dyn std::error::Error>> {
    Ok(CollabSession::open(
        config.clone(),
        room.clone(),
        Credential::new(id, name),
        Arc::new(MemoryDevices::new()),
        Arc::new(MemoryConnector::new()),
    )?)
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
