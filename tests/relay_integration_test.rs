// End-to-end tests: a real relay with real client sessions over loopback TCP.
// Run with: cargo test --test relay_integration_test

use std::time::Duration;

use chatrelay::{RelayConfig, RelayEvent, RelayServer, Session, SessionError, SessionEvent, Slot};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(3);

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Channel closed")
}

/// Identify `name` and return its `name#token` label and slot from the
/// relay's online notification.
async fn join(
    session: &mut Session,
    name: &str,
    events: &mut UnboundedReceiver<RelayEvent>,
) -> (String, Slot) {
    session.identify(name).await.unwrap();
    let (label, slot) = match recv(events).await {
        RelayEvent::Text { message, slot } => (
            message
                .strip_suffix(" is now online!")
                .expect("online notification")
                .to_string(),
            slot,
        ),
        other => panic!("Expected Text, got: {other:?}"),
    };
    assert!(matches!(recv(events).await, RelayEvent::Presence { .. }));
    (label, slot)
}

#[tokio::test]
async fn test_two_users_chat_and_third_is_refused() {
    let (relay, mut events) = RelayServer::start(&RelayConfig::new("127.0.0.1", 0)).await.unwrap();
    let address = relay.local_addr().to_string();

    let mut alice = Session::connect(&address).await.unwrap();
    let (alice_label, alice_slot) = join(&mut alice, "alice", &mut events).await;
    let mut bob = Session::connect(&address).await.unwrap();
    let mut bob_inbox = bob.spawn_receiver().unwrap();
    let (bob_label, bob_slot) = join(&mut bob, "bob", &mut events).await;
    assert_ne!(alice_slot, bob_slot);

    // No slot left: the relay hangs up before the handshake.
    let mut carol = Session::connect(&address).await.unwrap();
    let mut carol_inbox = carol.spawn_receiver().unwrap();
    assert_eq!(recv(&mut carol_inbox).await, SessionEvent::Closed);
    assert!(!carol.is_online());
    assert!(matches!(
        carol.identify("carol").await,
        Err(SessionError::SlotsExhausted)
    ));

    // Without a receiver the name write is accepted locally, and the
    // refusal surfaces on a following send.
    let mut erin = Session::connect(&address).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    erin.identify("erin").await.unwrap();
    let mut outcome = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Err(e) = erin.send_message("x").await {
            outcome = Some(e);
            break;
        }
    }
    assert!(matches!(outcome, Some(SessionError::Offline)), "{outcome:?}");
    assert!(!erin.is_online());

    alice.send_message("hi").await.unwrap();
    assert_eq!(
        recv(&mut events).await,
        RelayEvent::Text {
            message: "from alice: hi".to_string(),
            slot: alice_slot,
        }
    );
    assert_eq!(
        recv(&mut bob_inbox).await,
        SessionEvent::Message {
            name: "alice".to_string(),
            body: "hi".to_string(),
        }
    );
    assert_eq!(relay.message_count(), 1);

    bob.go_offline().await.unwrap();
    assert_eq!(
        recv(&mut events).await,
        RelayEvent::Text {
            message: format!("{bob_label} went offline"),
            slot: bob_slot,
        }
    );
    assert_eq!(
        recv(&mut events).await,
        RelayEvent::Presence {
            users: vec![alice_label.clone()],
        }
    );
    assert_eq!(recv(&mut bob_inbox).await, SessionEvent::Closed);

    // Bob's slot is free again.
    let mut dave = Session::connect(&address).await.unwrap();
    let (dave_label, dave_slot) = join(&mut dave, "dave", &mut events).await;
    assert_eq!(dave_slot, bob_slot);
    assert!(dave_label.starts_with("dave#"));

    relay.shutdown();
    assert_eq!(relay.join().await, 1);
}

#[tokio::test]
async fn test_duplicate_names_are_disambiguated() {
    let (relay, mut events) = RelayServer::start(&RelayConfig::new("127.0.0.1", 0)).await.unwrap();
    let address = relay.local_addr().to_string();

    let mut first = Session::connect(&address).await.unwrap();
    let (first_label, _) = join(&mut first, "sam", &mut events).await;
    let mut second = Session::connect(&address).await.unwrap();
    second.identify("sam").await.unwrap();
    let _ = recv(&mut events).await;

    match recv(&mut events).await {
        RelayEvent::Presence { users } => {
            assert_eq!(users.len(), 2);
            assert_eq!(users[0], first_label);
            assert_ne!(users[0], users[1]);
            assert!(users.iter().all(|u| u.starts_with("sam#")));
        }
        other => panic!("Expected Presence, got: {other:?}"),
    }

    relay.shutdown();
    relay.join().await;
}

#[tokio::test]
async fn test_shutdown_ends_client_sessions() {
    let (relay, mut events) = RelayServer::start(&RelayConfig::new("127.0.0.1", 0)).await.unwrap();
    let address = relay.local_addr().to_string();

    let mut alice = Session::connect(&address).await.unwrap();
    let mut inbox = alice.spawn_receiver().unwrap();
    join(&mut alice, "alice", &mut events).await;

    relay.shutdown();
    relay.join().await;

    assert_eq!(recv(&mut inbox).await, SessionEvent::Closed);
    assert!(!alice.is_online());
    assert!(matches!(
        Session::connect(&address).await,
        Err(SessionError::Connect { .. })
    ));
}
