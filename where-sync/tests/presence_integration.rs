//! Integration tests for heartbeat-driven presence.
//!
//! Two engines exchange Ping/Pong over a `SignalHub` while a shared
//! `ManualClock` moves time forward, checking liveness thresholds and
//! the effect of staleness on signal recipients.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;
use where_sync::{
    Backend, Coord, EngineConfig, Hash, HubTransport, Inbox, Location, LocationMeta, ManualClock,
    MarkerConfig, MemoryBackend, PresenceStatus, ReconciliationEngine, SignalEnvelope, SignalHub,
    Space, SpaceMeta,
};

async fn pair() -> (
    (ReconciliationEngine, Inbox),
    (ReconciliationEngine, Inbox),
    ManualClock,
    Arc<SignalHub>,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = SignalHub::new(64);
    let ledger = MemoryBackend::new(Uuid::new_v4());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());

    let mut make = Vec::new();
    for _ in 0..2 {
        let backend = ledger.as_agent(Uuid::new_v4());
        let inbox = hub.join(backend.agent()).await;
        let engine = ReconciliationEngine::new(
            Arc::new(backend),
            Arc::new(HubTransport::new(hub.clone())),
            Arc::new(clock.clone()),
            EngineConfig::default(),
        )
        .unwrap();
        make.push((engine, inbox));
    }
    let b = make.pop().unwrap();
    let a = make.pop().unwrap();
    a.0.add_known_peer(b.0.me());
    b.0.add_known_peer(a.0.me());
    (a, b, clock, hub)
}

// ─── Heartbeats ─────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_pong_marks_both_alive() {
    let ((a, mut inbox_a), (b, mut inbox_b), _clock, _hub) = pair().await;
    assert_eq!(a.presence_status(&b.me()), PresenceStatus::Stale);

    a.heartbeat(None).await;
    assert_eq!(b.pump(&mut inbox_b).await, 1);
    assert_eq!(b.presence_status(&a.me()), PresenceStatus::Alive);

    // The Pong is absorbed without a reply.
    assert_eq!(a.pump(&mut inbox_a).await, 1);
    assert_eq!(a.presence_status(&b.me()), PresenceStatus::Alive);
    assert_eq!(b.pump(&mut inbox_b).await, 0);
}

#[tokio::test]
async fn test_thresholds_follow_clock() {
    let ((a, mut inbox_a), (b, mut inbox_b), clock, _hub) = pair().await;
    b.heartbeat(None).await;
    a.pump(&mut inbox_a).await;
    b.pump(&mut inbox_b).await;

    let peer = b.me();
    clock.advance_secs(29);
    assert_eq!(a.presence_status(&peer), PresenceStatus::Alive);
    clock.advance_secs(1);
    assert_eq!(a.presence_status(&peer), PresenceStatus::Warning);
    clock.advance_secs(269);
    assert_eq!(a.presence_status(&peer), PresenceStatus::Warning);
    clock.advance_secs(1);
    assert_eq!(a.presence_status(&peer), PresenceStatus::Stale);

    // Self is always alive.
    assert_eq!(a.presence_status(&a.me()), PresenceStatus::Alive);
}

#[tokio::test]
async fn test_any_signal_refreshes_presence() {
    let ((a, mut inbox_a), (b, _inbox_b), clock, hub) = pair().await;
    clock.advance_secs(1000);
    let junk_space = Hash::digest(b"elsewhere");
    let env = SignalEnvelope::delete_here(junk_space, b.me(), junk_space, junk_space);
    hub.deliver(Arc::new(env.encode().unwrap()), &[a.me()]).await;
    a.pump(&mut inbox_a).await;
    assert_eq!(a.presence_status(&b.me()), PresenceStatus::Alive);
}

// ─── Recipients ─────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_peers_miss_location_signals() {
    let ((a, mut inbox_a), (b, mut inbox_b), clock, _hub) = pair().await;
    a.heartbeat(None).await;
    b.pump(&mut inbox_b).await;
    a.pump(&mut inbox_a).await;
    assert_eq!(a.current_others(), vec![b.me()]);

    let space = Space {
        name: "Lobby".into(),
        origin_template: Hash::digest(b"t"),
        surface: "{}".into(),
        marker: MarkerConfig::default(),
        meta: SpaceMeta::default(),
    };
    let space_id = a.create_space(space).await.unwrap();
    b.pump(&mut inbox_b).await;
    a.pump(&mut inbox_a).await;

    clock.advance_secs(300);
    assert!(a.current_others().is_empty());
    // Entity creation still reaches every known peer.
    assert_eq!(a.known_peers(), vec![b.me()]);

    let session_id = a.resolve_session_for_new_placement(space_id).await.unwrap();
    let skipped_before = a.bus().stats().skipped;
    a.add_location(
        space_id,
        session_id,
        Location {
            coord: Coord::new(1.0, 2.0),
            session_id,
            meta: LocationMeta::default(),
        },
    )
    .await
    .unwrap();
    assert_eq!(a.bus().stats().skipped, skipped_before + 1);
    assert_eq!(b.pump(&mut inbox_b).await, 0);
}

#[tokio::test]
async fn test_ping_peers_addresses_only_given_peers() {
    let ((a, _inbox_a), (b, mut inbox_b), _clock, hub) = pair().await;
    let outsider = Uuid::new_v4();
    let mut inbox_outsider = hub.join(outsider).await;

    a.ping_peers(None, &[outsider]).await;
    assert_eq!(b.pump(&mut inbox_b).await, 0);
    let ping = SignalEnvelope::decode(&inbox_outsider.recv().await.unwrap()).unwrap();
    assert_eq!(ping.from, a.me());

    // Pinging only ourselves is skipped.
    let sent = a.bus().stats().sent;
    a.ping_peers(None, &[a.me()]).await;
    assert_eq!(a.bus().stats().sent, sent);
}
