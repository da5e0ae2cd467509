use std::time::Duration;

use plex_tokio::{memory_pair, Event, Events, MethodTable, SessionBuilder, SessionConfig};
use tokio::time::{timeout_at, Instant};

/// Count heartbeat and death events until `deadline`; no heartbeat may follow a death.
async fn tally(events: &mut Events, deadline: Instant) -> (usize, usize) {
    let (mut beats, mut deaths) = (0, 0);
    while let Ok(Some(event)) = timeout_at(deadline, events.recv()).await {
        match event {
            Event::Heartbeat { .. } => {
                assert_eq!(deaths, 0, "heartbeat after death");
                beats += 1;
            }
            Event::Death => deaths += 1,
            _ => {}
        }
    }
    (beats, deaths)
}

#[tokio::test(start_paused = true)]
async fn peer_playing_dead_is_declared_dead_once() {
    let (a, b) = memory_pair(64 * 1024);
    let (client, mut events) = SessionBuilder::new(MethodTable::new())
        .config(SessionConfig::default().with_heartbeat(500, 2.5))
        .connect(a);
    let (server, _server_events) = SessionBuilder::new(MethodTable::new()).connect(b);
    server.remote_methods().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(server.play_dead().await);
    assert!(server.is_playing_dead());

    let (beats, deaths) = tally(&mut events, Instant::now() + Duration::from_secs(5)).await;
    assert!(beats >= 1);
    assert_eq!(deaths, 1);
    assert!(client.is_dead());
    // Death is reported, not acted on: the transport stays up.
    assert!(!client.is_closed());
    assert!(!server.is_closed());

    let (_, later) = tally(&mut events, Instant::now() + Duration::from_secs(5)).await;
    assert_eq!(later, 0);
}

#[tokio::test(start_paused = true)]
async fn answering_peer_stays_alive() {
    let (a, b) = memory_pair(64 * 1024);
    let (client, mut events) = SessionBuilder::new(MethodTable::new())
        .config(SessionConfig::default().with_heartbeat(200, 1.0))
        .connect(a);
    let (_server, _server_events) = SessionBuilder::new(MethodTable::new()).connect(b);

    let (beats, deaths) = tally(&mut events, Instant::now() + Duration::from_secs(3)).await;
    assert!(beats >= 10);
    assert_eq!(deaths, 0);
    assert!(!client.is_dead());
}

#[tokio::test(start_paused = true)]
async fn probes_are_ignored_when_answering_is_disabled() {
    let (a, b) = memory_pair(64 * 1024);
    let (client, mut events) = SessionBuilder::new(MethodTable::new())
        .config(SessionConfig::default().with_heartbeat(100, 0.5))
        .connect(a);
    let mut mute = SessionConfig::default();
    mute.respond_to_heartbeat = false;
    let (_server, _server_events) = SessionBuilder::new(MethodTable::new())
        .config(mute)
        .connect(b);

    let (beats, deaths) = tally(&mut events, Instant::now() + Duration::from_secs(1)).await;
    assert_eq!((beats, deaths), (0, 1));
    assert!(client.is_dead());
}
