//! The directory of every room on this host: lookup by code, the ordered
//! public listing, and the periodic sweep that terminates idle rooms.

use crate::room::Broker;
use crate::state::unix_now;
use protocol::TIMEOUT_CODE;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Maps room codes to broker handles and keeps the insertion-ordered list of
/// public codes. One lock covers both structures so they can never disagree.
pub struct BrokerStore<B> {
    inner: Mutex<Directory<B>>,
}

struct Directory<B> {
    brokers: HashMap<String, B>,
    codes: Vec<String>,
}

impl<B: Broker + Clone> BrokerStore<B> {
    /// Creates the store and spawns its sweeper, which purges expired rooms
    /// every `sweep_period`.
    pub fn new(sweep_period: Duration) -> Arc<BrokerStore<B>> {
        let store = Arc::new(BrokerStore {
            inner: Mutex::new(Directory { brokers: HashMap::new(), codes: Vec::new() }),
        });

        let sweeper = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_period);
            // the first tick of an interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweeper.purge_expired(unix_now()).await;
            }
        });

        store
    }

    /// Looks a room up; expired rooms are invisible even before the sweeper
    /// removes them.
    pub async fn get(&self, code: &str) -> Option<B> {
        let dir = self.inner.lock().await;
        dir.brokers
            .get(code)
            .filter(|broker| !broker.is_expired(unix_now()))
            .cloned()
    }

    pub async fn set(&self, code: String, broker: B) {
        let mut dir = self.inner.lock().await;
        if broker.is_public() {
            dir.codes.push(code.clone());
        }
        dir.brokers.insert(code, broker);
    }

    /// A contiguous window of the public directory, oldest rooms first.
    pub async fn codes(&self, offset: usize, limit: usize) -> Vec<String> {
        let dir = self.inner.lock().await;
        if offset >= dir.codes.len() {
            return Vec::new();
        }
        let upper = offset.saturating_add(limit).min(dir.codes.len());
        dir.codes[offset..upper].to_vec()
    }

    /// Removes every expired room from both structures, then signals each one
    /// to stop. The stop dispatch happens after the lock is released so a
    /// busy room can never stall the directory.
    pub async fn purge_expired(&self, now_unix: i64) {
        let expired = {
            let mut dir = self.inner.lock().await;
            let codes: Vec<String> = dir
                .brokers
                .iter()
                .filter(|(_, broker)| broker.is_expired(now_unix))
                .map(|(code, _)| code.clone())
                .collect();

            let mut removed = Vec::with_capacity(codes.len());
            for code in &codes {
                if let Some(broker) = dir.brokers.remove(code) {
                    removed.push((code.clone(), broker));
                }
            }
            dir.codes.retain(|code| !codes.contains(code));
            removed
        };

        for (code, broker) in expired {
            tracing::info!(code = %code, "terminating expired room");
            broker.stop(TIMEOUT_CODE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone)]
    struct StubBroker {
        expired: bool,
        public: bool,
        stop_code: Arc<StdMutex<Option<u8>>>,
    }

    impl StubBroker {
        fn new(expired: bool, public: bool) -> StubBroker {
            StubBroker { expired, public, stop_code: Arc::new(StdMutex::new(None)) }
        }
    }

    impl Broker for StubBroker {
        fn stop(&self, code: u8) {
            *self.stop_code.lock().unwrap() = Some(code);
        }

        fn is_expired(&self, _now_unix: i64) -> bool {
            self.expired
        }

        fn is_public(&self) -> bool {
            self.public
        }
    }

    #[tokio::test]
    async fn stored_rooms_are_found_and_strangers_are_not() {
        let store = BrokerStore::new(Duration::from_secs(60));
        for code in ["123", "123", "456", "789"] {
            store.set(code.to_owned(), StubBroker::new(false, true)).await;
        }

        for (code, expected) in [("123", true), ("456", true), ("789", true), ("555", false)] {
            assert_eq!(store.get(code).await.is_some(), expected, "code {code}");
        }
    }

    #[tokio::test]
    async fn expired_rooms_are_hidden_from_lookup() {
        let store = BrokerStore::new(Duration::from_secs(60));
        store.set("dead".to_owned(), StubBroker::new(true, true)).await;
        assert!(store.get("dead").await.is_none());
    }

    #[tokio::test]
    async fn listing_contains_only_public_codes_in_insertion_order() {
        let store = BrokerStore::new(Duration::from_secs(60));
        store.set("A".to_owned(), StubBroker::new(false, true)).await;
        store.set("B".to_owned(), StubBroker::new(false, false)).await;
        store.set("C".to_owned(), StubBroker::new(false, true)).await;
        store.set("D".to_owned(), StubBroker::new(false, true)).await;

        assert_eq!(store.codes(0, 10).await, vec!["A", "C", "D"]);
        assert_eq!(store.codes(1, 1).await, vec!["C"]);
        assert_eq!(store.codes(0, 2).await, vec!["A", "C"]);
        assert!(store.codes(5, 10).await.is_empty());
    }

    #[tokio::test]
    async fn purge_stops_and_delists_expired_rooms_in_order() {
        let store = BrokerStore::new(Duration::from_secs(60));
        let doomed1 = StubBroker::new(true, true);
        let doomed2 = StubBroker::new(true, true);
        let survivor = StubBroker::new(false, true);
        store.set("123".to_owned(), doomed1.clone()).await;
        store.set("999".to_owned(), survivor.clone()).await;
        store.set("456".to_owned(), doomed2.clone()).await;

        store.purge_expired(unix_now()).await;

        assert_eq!(store.codes(0, 10).await, vec!["999"]);
        assert!(store.get("123").await.is_none());
        assert_eq!(*doomed1.stop_code.lock().unwrap(), Some(TIMEOUT_CODE));
        assert_eq!(*doomed2.stop_code.lock().unwrap(), Some(TIMEOUT_CODE));
        assert_eq!(*survivor.stop_code.lock().unwrap(), None);
    }
}
