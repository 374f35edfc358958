//! In-flight de-duplication of card fetches.
//!
//! # Invariants
//! - At most one underlying fetch runs per key at any time.
//! - A key is released when its fetch settles, whether it succeeded or not.

use crate::error::CoreResult;
use crate::model::card::CardId;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Fetch = Shared<BoxFuture<'static, CoreResult<Option<Value>>>>;

/// Identity of one fetch: who asks, for which card, expanding which verbs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadKey {
    pub session: CardId,
    pub id: CardId,
    verbs: Vec<String>,
}

impl LoadKey {
    pub fn new(session: CardId, id: CardId, verbs: &[&str]) -> Self {
        let mut verbs = verbs.iter().map(|verb| verb.to_string()).collect::<Vec<_>>();
        verbs.sort();
        verbs.dedup();
        Self { session, id, verbs }
    }

    /// Link verbs in sorted order.
    pub fn verbs(&self) -> &[String] {
        &self.verbs
    }
}

/// Shares one in-flight fetch between every concurrent caller of a key.
#[derive(Default)]
pub struct CardLoader {
    in_flight: Arc<Mutex<HashMap<LoadKey, Fetch>>>,
}

impl CardLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Awaits the fetch already running for `key`, or starts `fetch`.
    pub async fn load<F>(&self, key: LoadKey, fetch: F) -> CoreResult<Option<Value>>
    where
        F: Future<Output = CoreResult<Option<Value>>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&key) {
                Some(running) => running.clone(),
                None => {
                    let registry = Arc::clone(&self.in_flight);
                    let release = key.clone();
                    let shared = async move {
                        let result = fetch.await;
                        lock(&registry).remove(&release);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// Number of keys with a fetch still running.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

fn lock(map: &Mutex<HashMap<LoadKey, Fetch>>) -> MutexGuard<'_, HashMap<LoadKey, Fetch>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{CardLoader, LoadKey};
    use crate::error::CoreError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn key_ignores_verb_order() {
        let session = Uuid::new_v4();
        let id = Uuid::new_v4();
        assert_eq!(
            LoadKey::new(session, id, &["b", "a", "a"]),
            LoadKey::new(session, id, &["a", "b"])
        );
        assert_ne!(
            LoadKey::new(session, id, &["a"]),
            LoadKey::new(Uuid::new_v4(), id, &["a"])
        );
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_fetch() {
        let loader = Arc::new(CardLoader::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = LoadKey::new(Uuid::new_v4(), Uuid::new_v4(), &["has member"]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let loader = Arc::clone(&loader);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                loader
                    .load(key, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(json!({ "slug": "card-1" })))
                    })
                    .await
            }));
        }
        for handle in handles {
            let card = handle.await.unwrap().unwrap();
            assert_eq!(card, Some(json!({ "slug": "card-1" })));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_releases_key() {
        let loader = CardLoader::new();
        let key = LoadKey::new(Uuid::new_v4(), Uuid::new_v4(), &[]);

        let failed = loader
            .load(key.clone(), async { Err(CoreError::NoElement("card".to_string())) })
            .await;
        assert!(matches!(failed, Err(CoreError::NoElement(_))));
        assert_eq!(loader.in_flight(), 0);

        let retried = loader.load(key, async { Ok(None) }).await.unwrap();
        assert_eq!(retried, None);
    }
}
