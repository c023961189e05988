use serde_json::json;
use tether_core::{
    Delivery, Direction, HandshakePayload, OverwritePolicy, SessionId, SessionRegistry,
    SessionStore, StoreConfig, StoreError,
};

fn payload(sdp: &str) -> HandshakePayload {
    HandshakePayload::from_value(&json!({ "type": "offer", "sdp": sdp })).unwrap()
}

fn session(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

#[test_timeout::timeout]
fn never_written_ids_are_not_found() {
    let registry = SessionRegistry::default();
    for direction in Direction::ALL {
        for raw in ["a", "sess1", "zzzzzzzzzz"] {
            assert!(matches!(
                registry.store(direction).get(&session(raw), 0),
                Err(StoreError::NotFound { .. })
            ));
        }
    }
}

#[test_timeout::timeout]
fn first_read_delivers_version_one_then_no_update() {
    let store = SessionStore::new(Direction::Offer, StoreConfig::default());
    store.put(session("sess1"), payload("p"));

    assert_eq!(
        store.get(&session("sess1"), 0).unwrap(),
        Delivery::Payload {
            payload: payload("p"),
            version: 1
        }
    );
    assert_eq!(store.get(&session("sess1"), 1).unwrap(), Delivery::NoUpdate);
}

#[test_timeout::timeout]
fn overwrite_after_delivery_is_not_redelivered_by_default() {
    let store = SessionStore::new(Direction::Offer, StoreConfig::default());
    store.put(session("s"), payload("p1"));
    store.get(&session("s"), 0).unwrap();

    store.put(session("s"), payload("p2"));
    assert_eq!(store.get(&session("s"), 1).unwrap(), Delivery::NoUpdate);

    // A fresh client still sees the latest payload.
    assert_eq!(
        store.get(&session("s"), 0).unwrap(),
        Delivery::Payload {
            payload: payload("p2"),
            version: 1
        }
    );
}

#[test_timeout::timeout]
fn redeliver_policy_hands_out_overwrites_at_a_higher_version() {
    let config = StoreConfig {
        overwrite_policy: OverwritePolicy::Redeliver,
        ..StoreConfig::default()
    };
    let store = SessionStore::new(Direction::Answer, config);
    store.put(session("s"), payload("p1"));
    store.get(&session("s"), 0).unwrap();

    store.put(session("s"), payload("p2"));
    assert_eq!(
        store.get(&session("s"), 1).unwrap(),
        Delivery::Payload {
            payload: payload("p2"),
            version: 2
        }
    );
    assert_eq!(store.get(&session("s"), 2).unwrap(), Delivery::NoUpdate);
}

#[test_timeout::timeout]
fn repeated_identical_puts_never_lower_the_version() {
    let store = SessionStore::new(Direction::Offer, StoreConfig::default());
    store.put(session("s"), payload("p"));
    store.get(&session("s"), 0).unwrap();

    for _ in 0..10 {
        store.put(session("s"), payload("p"));
        assert_eq!(store.delivered_version(&session("s")), Some(1));
    }
}

#[test_timeout::timeout]
fn polling_at_the_current_version_never_redelivers() {
    let store = SessionStore::new(Direction::Offer, StoreConfig::default());
    store.put(session("s"), payload("p"));
    store.get(&session("s"), 0).unwrap();

    for _ in 0..100 {
        assert_eq!(store.get(&session("s"), 1).unwrap(), Delivery::NoUpdate);
    }
    assert_eq!(store.delivered_version(&session("s")), Some(1));
}

#[test_timeout::timeout]
fn directions_are_independent() {
    let registry = SessionRegistry::default();
    registry
        .store(Direction::Offer)
        .put(session("sess1"), payload("OFFER_A"));

    assert!(registry
        .store(Direction::Answer)
        .get(&session("sess1"), 0)
        .is_err());
    assert!(registry
        .store(Direction::Offer)
        .get(&session("sess1"), 0)
        .is_ok());
}

#[test_timeout::timeout]
fn concurrent_first_reads_agree_on_version_one() {
    use std::sync::Arc;

    let store = Arc::new(SessionStore::new(Direction::Offer, StoreConfig::default()));
    store.put(session("race"), payload("p"));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.get(&session("race"), 0).unwrap())
        })
        .collect();

    for handle in handles {
        match handle.join().unwrap() {
            Delivery::Payload { version, .. } => assert_eq!(version, 1),
            Delivery::NoUpdate => panic!("version 0 clients must always be served"),
        }
    }
    assert_eq!(store.delivered_version(&session("race")), Some(1));
}
