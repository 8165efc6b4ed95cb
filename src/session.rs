//! Session Manager
//!
//! Obtains and caches the per-node lease every registration in this
//! layer is attached to. Sessions are discovered by name before being
//! created, so a restarted process that reconnects before its old
//! lease expires picks the lease back up instead of duplicating it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::membership::service_check_id;
use crate::node::NodeAddress;
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::{CoordinationStore, SessionBehavior, SessionId, SessionSpec};

/// The store's own cluster health check, bound into every session so a
/// partitioned agent invalidates its leases
const CLUSTER_HEALTH_CHECK: &str = "serfHealth";

/// Per-node lease cache and creation path
pub struct SessionManager {
    store: Arc<dyn CoordinationStore>,
    service_name: String,
    session_ttl: Duration,
    retry: RetryPolicy,
    /// Read-mostly cache: node -> live session id
    cache: RwLock<HashMap<NodeAddress, SessionId>>,
    /// Single-flight guard for the creation path
    create_lock: Mutex<()>,
}

impl SessionManager {
    /// Create a session manager over the given store
    pub fn new(store: Arc<dyn CoordinationStore>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            service_name: config.cluster.service_name.clone(),
            session_ttl: config.session_ttl(),
            retry: config.retry_policy(),
            cache: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Return the session for `node`, creating or discovering one if
    /// none is cached.
    ///
    /// The fast path is a cache read with no store round-trip. The slow
    /// path is single-flight: one creation at a time per manager, with
    /// a second cache check under the lock so concurrent first-use for
    /// the same node produces exactly one lease.
    pub async fn ensure_session(
        &self,
        node: &NodeAddress,
        search_existing: bool,
        cancel: &CancellationToken,
    ) -> Result<SessionId> {
        if let Some(id) = self.cache.read().await.get(node) {
            return Ok(id.clone());
        }

        let _guard = self.create_lock.lock().await;

        // Another caller may have populated the cache while we waited
        if let Some(id) = self.cache.read().await.get(node) {
            return Ok(id.clone());
        }

        let session = if search_existing {
            match self.find_existing(node, cancel).await? {
                Some(id) => {
                    tracing::debug!("Recovered surviving session {} for {}", id, node);
                    id
                }
                None => self.create(node, cancel).await?,
            }
        } else {
            self.create(node, cancel).await?
        };

        let mut cache = self.cache.write().await;
        let entry = cache.entry(*node).or_insert_with(|| session.clone());
        Ok(entry.clone())
    }

    /// Cached session for `node`, if any
    pub async fn cached(&self, node: &NodeAddress) -> Option<SessionId> {
        self.cache.read().await.get(node).cloned()
    }

    /// Drop `node` from the cache (its session is gone or being destroyed)
    pub async fn forget(&self, node: &NodeAddress) {
        self.cache.write().await.remove(node);
    }

    /// Search live sessions for one named after `node`
    async fn find_existing(
        &self,
        node: &NodeAddress,
        cancel: &CancellationToken,
    ) -> Result<Option<SessionId>> {
        let name = node.to_string();
        let sessions = retry_transient("session list", &self.retry, cancel, || {
            self.store.list_sessions()
        })
        .await?;

        Ok(sessions
            .into_iter()
            .find(|session| session.name == name)
            .map(|session| session.id))
    }

    /// Create a fresh lease for `node`
    async fn create(&self, node: &NodeAddress, cancel: &CancellationToken) -> Result<SessionId> {
        let spec = SessionSpec {
            name: node.to_string(),
            ttl: self.session_ttl,
            lock_delay: Duration::ZERO,
            behavior: SessionBehavior::Delete,
            checks: vec![
                service_check_id(&self.service_name, node),
                CLUSTER_HEALTH_CHECK.to_string(),
            ],
        };

        let result = retry_transient("session create", &self.retry, cancel, || {
            self.store.create_session(spec.clone())
        })
        .await;

        match result {
            Ok(id) => {
                tracing::info!("Created session {} for {}", id, node);
                Ok(id)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(Error::SessionCreation { node, reason }) => {
                Err(Error::SessionCreation { node, reason })
            }
            Err(e) => Err(Error::SessionCreation {
                node: node.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::store::MemoryStore;

    fn test_config() -> CoordinationConfig {
        CoordinationConfig::from_toml("[cluster]\nname = \"test\"").unwrap()
    }

    fn node(port: u16) -> NodeAddress {
        NodeAddress::new(format!("10.0.0.1:{}", port).parse().unwrap(), 1)
    }

    #[tokio::test]
    async fn test_cached_session_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(store.clone(), &test_config());
        let cancel = CancellationToken::new();

        let first = manager.ensure_session(&node(7654), false, &cancel).await.unwrap();
        let second = manager.ensure_session(&node(7654), false, &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.counters().await.create_session, 1);
    }

    #[tokio::test]
    async fn test_search_recovers_surviving_session() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let target = node(7654);

        // A lease created by a previous incarnation of this process
        let surviving = store
            .create_session(SessionSpec {
                name: target.to_string(),
                ttl: Duration::from_secs(10),
                lock_delay: Duration::ZERO,
                behavior: SessionBehavior::Delete,
                checks: Vec::new(),
            })
            .await
            .unwrap();

        let manager = SessionManager::new(store.clone(), &test_config());
        let found = manager.ensure_session(&target, true, &cancel).await.unwrap();

        assert_eq!(found, surviving);
        assert_eq!(store.counters().await.create_session, 1);
    }

    #[tokio::test]
    async fn test_search_disabled_creates_fresh() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let target = node(7654);

        let surviving = store
            .create_session(SessionSpec {
                name: target.to_string(),
                ttl: Duration::from_secs(10),
                lock_delay: Duration::ZERO,
                behavior: SessionBehavior::Delete,
                checks: Vec::new(),
            })
            .await
            .unwrap();

        let manager = SessionManager::new(store.clone(), &test_config());
        let created = manager.ensure_session(&target, false, &cancel).await.unwrap();

        assert_ne!(created, surviving);
        assert_eq!(store.counters().await.create_session, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_lease() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(SessionManager::new(store.clone(), &test_config()));
        let cancel = CancellationToken::new();
        let target = node(7654);

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let c1 = cancel.clone();
        let c2 = cancel.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { m1.ensure_session(&target, false, &c1).await }),
            tokio::spawn(async move { m2.ensure_session(&target, false, &c2).await }),
        );

        assert_eq!(first.unwrap().unwrap(), second.unwrap().unwrap());
        assert_eq!(store.counters().await.create_session, 1);
    }

    #[tokio::test]
    async fn test_forget_evicts_cache() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(store.clone(), &test_config());
        let cancel = CancellationToken::new();
        let target = node(7654);

        manager.ensure_session(&target, false, &cancel).await.unwrap();
        assert!(manager.cached(&target).await.is_some());

        manager.forget(&target).await;
        assert!(manager.cached(&target).await.is_none());

        manager.ensure_session(&target, false, &cancel).await.unwrap();
        assert_eq!(store.counters().await.create_session, 2);
    }

    #[tokio::test]
    async fn test_transient_create_faults_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(store.clone(), &test_config());
        let cancel = CancellationToken::new();

        store.fail_next_ops(2).await;
        let id = manager.ensure_session(&node(7654), false, &cancel).await.unwrap();
        assert!(manager.cached(&node(7654)).await.is_some());
        assert_eq!(manager.cached(&node(7654)).await.unwrap(), id);
    }
}
