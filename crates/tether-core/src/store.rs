use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

use crate::id::SessionId;
use crate::payload::HandshakePayload;
use crate::version::{DeliveryVersion, OverwritePolicy};
use crate::wire::Direction;

const DEFAULT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Time since the last write after which a record is treated as gone.
    pub ttl: Duration,
    pub overwrite_policy: OverwritePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            overwrite_policy: OverwritePolicy::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no {direction} record for session {session}")]
    NotFound {
        direction: Direction,
        session: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Payload {
        payload: HandshakePayload,
        version: u64,
    },
    NoUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    payload: HandshakePayload,
    version: DeliveryVersion,
    updated_at: Instant,
}

impl SessionRecord {
    fn new(payload: HandshakePayload, now: Instant) -> Self {
        Self {
            payload,
            version: DeliveryVersion::default(),
            updated_at: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.updated_at) >= ttl
    }
}

/// Pending handshake payloads for one direction, keyed by session id.
///
/// Reads and writes of a single key are serialized by the map's shard lock, so
/// the check-and-bump on the delivered version is atomic per session.
#[derive(Debug)]
pub struct SessionStore {
    direction: Direction,
    records: DashMap<SessionId, SessionRecord>,
    config: StoreConfig,
}

impl SessionStore {
    pub fn new(direction: Direction, config: StoreConfig) -> Self {
        Self {
            direction,
            records: DashMap::new(),
            config,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn put(&self, session: SessionId, payload: HandshakePayload) -> PutOutcome {
        self.put_at(session, payload, Instant::now())
    }

    pub fn put_at(&self, session: SessionId, payload: HandshakePayload, now: Instant) -> PutOutcome {
        let ttl = self.config.ttl;
        let outcome = match self.records.entry(session.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now, ttl) {
                    entry.insert(SessionRecord::new(payload, now));
                    PutOutcome::Created
                } else {
                    let record = entry.get_mut();
                    let changed = record.payload != payload;
                    record
                        .version
                        .note_overwrite(self.config.overwrite_policy, changed);
                    record.payload = payload;
                    record.updated_at = now;
                    if changed {
                        PutOutcome::Replaced
                    } else {
                        PutOutcome::Unchanged
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(SessionRecord::new(payload, now));
                PutOutcome::Created
            }
        };
        debug!(
            direction = %self.direction,
            %session,
            ?outcome,
            "stored handshake payload"
        );
        outcome
    }

    pub fn get(&self, session: &SessionId, known_version: u64) -> Result<Delivery, StoreError> {
        self.get_at(session, known_version, Instant::now())
    }

    pub fn get_at(
        &self,
        session: &SessionId,
        known_version: u64,
        now: Instant,
    ) -> Result<Delivery, StoreError> {
        let ttl = self.config.ttl;
        let Some(mut record) = self.records.get_mut(session) else {
            trace!(direction = %self.direction, %session, "no record yet");
            return Err(self.not_found(session));
        };

        if record.is_expired(now, ttl) {
            drop(record);
            self.records
                .remove_if(session, |_, record| record.is_expired(now, ttl));
            debug!(direction = %self.direction, %session, "record expired on read");
            return Err(self.not_found(session));
        }

        if !record.version.should_deliver(known_version) {
            trace!(
                direction = %self.direction,
                %session,
                known_version,
                delivered = record.version.current(),
                "client already holds latest version"
            );
            return Ok(Delivery::NoUpdate);
        }

        let version = record.version.deliver();
        debug!(
            direction = %self.direction,
            %session,
            known_version,
            version,
            "delivering handshake payload"
        );
        Ok(Delivery::Payload {
            payload: record.payload.clone(),
            version,
        })
    }

    /// Delivered version of a live record, without delivering anything.
    pub fn delivered_version(&self, session: &SessionId) -> Option<u64> {
        self.records
            .get(session)
            .map(|record| record.version.current())
    }

    /// Evict every record whose TTL elapsed by `now`; returns how many were dropped.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let mut purged = 0usize;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now, ttl);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn not_found(&self, session: &SessionId) -> StoreError {
        StoreError::NotFound {
            direction: self.direction,
            session: session.clone(),
        }
    }
}

/// The relay's two stores, one per direction.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    offer: SessionStore,
    answer: SessionStore,
}

impl SessionRegistry {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                offer: SessionStore::new(Direction::Offer, config.clone()),
                answer: SessionStore::new(Direction::Answer, config),
            }),
        }
    }

    pub fn store(&self, direction: Direction) -> &SessionStore {
        match direction {
            Direction::Offer => &self.inner.offer,
            Direction::Answer => &self.inner.answer,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(tag: &str) -> HandshakePayload {
        HandshakePayload::from_value(&json!({ "type": "offer", "sdp": tag })).unwrap()
    }

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test_timeout::timeout]
    fn unknown_sessions_are_not_found() {
        let store = SessionStore::new(Direction::Offer, StoreConfig::default());
        let err = store.get(&id("never"), 0).unwrap_err();
        assert_eq!(
            err,
            StoreError::NotFound {
                direction: Direction::Offer,
                session: id("never"),
            }
        );
    }

    #[test_timeout::timeout]
    fn put_reports_what_happened() {
        let store = SessionStore::new(Direction::Offer, StoreConfig::default());
        assert_eq!(store.put(id("s"), payload("a")), PutOutcome::Created);
        assert_eq!(store.put(id("s"), payload("a")), PutOutcome::Unchanged);
        assert_eq!(store.put(id("s"), payload("b")), PutOutcome::Replaced);
        assert_eq!(store.len(), 1);
    }

    #[test_timeout::timeout]
    fn expired_records_read_as_missing_and_are_dropped() {
        let config = StoreConfig {
            ttl: Duration::from_secs(5),
            ..StoreConfig::default()
        };
        let store = SessionStore::new(Direction::Answer, config);
        let start = Instant::now();
        store.put_at(id("s"), payload("a"), start);

        let later = start + Duration::from_secs(6);
        assert!(store.get_at(&id("s"), 0, later).is_err());
        assert!(store.is_empty());
    }

    #[test_timeout::timeout]
    fn writes_refresh_the_ttl_and_expired_writes_start_over() {
        let config = StoreConfig {
            ttl: Duration::from_secs(5),
            ..StoreConfig::default()
        };
        let store = SessionStore::new(Direction::Offer, config);
        let start = Instant::now();
        store.put_at(id("s"), payload("a"), start);
        store.get_at(&id("s"), 0, start).unwrap();

        let refreshed = start + Duration::from_secs(4);
        assert_eq!(store.put_at(id("s"), payload("a"), refreshed), PutOutcome::Unchanged);
        assert!(store
            .get_at(&id("s"), 1, start + Duration::from_secs(8))
            .is_ok());

        let much_later = start + Duration::from_secs(30);
        assert_eq!(store.put_at(id("s"), payload("b"), much_later), PutOutcome::Created);
        assert_eq!(store.delivered_version(&id("s")), Some(0));
    }

    #[test_timeout::timeout]
    fn purge_only_touches_its_own_direction() {
        let config = StoreConfig {
            ttl: Duration::from_secs(1),
            ..StoreConfig::default()
        };
        let registry = SessionRegistry::new(config);
        let start = Instant::now();
        registry
            .store(Direction::Offer)
            .put_at(id("a"), payload("a"), start);
        registry
            .store(Direction::Answer)
            .put_at(id("a"), payload("b"), start);
        registry
            .store(Direction::Answer)
            .put_at(id("b"), payload("c"), start + Duration::from_secs(10));

        let later = start + Duration::from_secs(2);
        assert_eq!(registry.store(Direction::Answer).purge_expired(later), 1);
        assert_eq!(registry.store(Direction::Answer).len(), 1);
        assert_eq!(registry.store(Direction::Offer).len(), 1);
        assert_eq!(registry.store(Direction::Offer).purge_expired(later), 1);
        assert!(registry.store(Direction::Offer).is_empty());
    }
}
