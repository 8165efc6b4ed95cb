//! In-Memory Coordination Store
//!
//! In-process implementation of the store contract used by the test
//! suite: lock acquisition with zero lock-delay, session invalidation
//! cascade, deterministic fault injection, and per-operation call
//! counters so tests can assert which store calls a component issued.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::{
    CheckStatus, CoordinationStore, KvPair, ServiceRecord, ServiceRegistration, SessionBehavior,
    SessionId, SessionInfo, SessionSpec, TxnOp,
};

/// Per-operation call counts, snapshotted via [`MemoryStore::counters`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub kv_get: u32,
    pub kv_put: u32,
    pub kv_acquire: u32,
    pub kv_delete: u32,
    pub kv_txn: u32,
    pub create_session: u32,
    pub list_sessions: u32,
    pub destroy_session: u32,
    pub register_service: u32,
    pub deregister_service: u32,
    pub query_service: u32,
    pub update_ttl_check: u32,
}

struct MemSession {
    name: String,
    behavior: SessionBehavior,
}

struct MemKv {
    value: Vec<u8>,
    session: Option<SessionId>,
}

struct MemService {
    registration: ServiceRegistration,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, MemSession>,
    kv: HashMap<String, MemKv>,
    services: HashMap<String, MemService>,
    checks: HashMap<String, CheckStatus>,
    counters: StoreCallCounts,
    fail_txn: bool,
    fail_next_ops: u32,
}

impl Inner {
    /// Returns Err(Timeout) while injected transient faults remain
    fn injected_fault(&mut self, operation: &str) -> Result<()> {
        if self.fail_next_ops > 0 {
            self.fail_next_ops -= 1;
            return Err(Error::Timeout(format!("injected fault: {}", operation)));
        }
        Ok(())
    }

    /// Remove a session and cascade per its invalidation behavior
    fn invalidate_session(&mut self, id: &SessionId) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };

        match session.behavior {
            SessionBehavior::Delete => {
                self.kv.retain(|_, pair| pair.session.as_ref() != Some(id));
            }
            SessionBehavior::Release => {
                for pair in self.kv.values_mut() {
                    if pair.session.as_ref() == Some(id) {
                        pair.session = None;
                    }
                }
            }
        }

        let orphaned: Vec<String> = self
            .services
            .iter()
            .filter(|(_, svc)| svc.registration.session.as_ref() == Some(id))
            .map(|(svc_id, _)| svc_id.clone())
            .collect();
        for svc_id in orphaned {
            if let Some(svc) = self.services.remove(&svc_id) {
                self.checks.remove(&svc.registration.check.check_id);
            }
        }

        true
    }
}

/// In-memory coordination store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the per-operation call counts
    pub async fn counters(&self) -> StoreCallCounts {
        self.inner.lock().await.counters.clone()
    }

    /// Force every subsequent transaction to roll back (return false)
    pub async fn set_txn_failure(&self, fail: bool) {
        self.inner.lock().await.fail_txn = fail;
    }

    /// Make the next `n` store calls fail with a transient timeout
    pub async fn fail_next_ops(&self, n: u32) {
        self.inner.lock().await.fail_next_ops = n;
    }

    /// Simulate TTL expiry of a session: same cascade as destruction,
    /// but driven by the store itself rather than a client call
    pub async fn expire_session(&self, id: &SessionId) -> bool {
        self.inner.lock().await.invalidate_session(id)
    }

    /// Current health of a check, if registered
    pub async fn check_status(&self, check_id: &str) -> Option<CheckStatus> {
        self.inner.lock().await.checks.get(check_id).copied()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        let mut inner = self.inner.lock().await;
        inner.counters.kv_get += 1;
        inner.injected_fault("kv get")?;

        Ok(inner.kv.get(key).map(|pair| KvPair {
            key: key.to_string(),
            value: pair.value.clone(),
            session: pair.session.clone(),
        }))
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.counters.kv_put += 1;
        inner.injected_fault("kv put")?;

        let session = inner.kv.get(key).and_then(|pair| pair.session.clone());
        inner.kv.insert(key.to_string(), MemKv { value, session });
        Ok(true)
    }

    async fn kv_acquire(&self, key: &str, value: Vec<u8>, session: &SessionId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.counters.kv_acquire += 1;
        inner.injected_fault("kv acquire")?;

        if !inner.sessions.contains_key(session) {
            return Err(Error::Store(format!("invalid session id: {}", session)));
        }

        match inner.kv.get_mut(key) {
            Some(pair) => match &pair.session {
                Some(holder) if holder != session => Ok(false),
                _ => {
                    pair.value = value;
                    pair.session = Some(session.clone());
                    Ok(true)
                }
            },
            None => {
                inner.kv.insert(
                    key.to_string(),
                    MemKv {
                        value,
                        session: Some(session.clone()),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.counters.kv_delete += 1;
        inner.injected_fault("kv delete")?;

        Ok(inner.kv.remove(key).is_some())
    }

    async fn kv_txn(&self, ops: &[TxnOp]) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.counters.kv_txn += 1;
        inner.injected_fault("kv txn")?;

        if inner.fail_txn {
            return Ok(false);
        }

        // Verify every op against current state before touching anything
        for op in ops {
            if let TxnOp::Unlock { key, session } = op {
                let holds = inner
                    .kv
                    .get(key)
                    .map(|pair| pair.session.as_ref() == Some(session))
                    .unwrap_or(false);
                if !holds {
                    return Ok(false);
                }
            }
        }

        for op in ops {
            match op {
                TxnOp::Unlock { key, .. } => {
                    if let Some(pair) = inner.kv.get_mut(key) {
                        pair.session = None;
                    }
                }
                TxnOp::Delete { key } => {
                    inner.kv.remove(key);
                }
            }
        }

        Ok(true)
    }

    async fn create_session(&self, spec: SessionSpec) -> Result<SessionId> {
        let mut inner = self.inner.lock().await;
        inner.counters.create_session += 1;
        inner.injected_fault("session create")?;

        let id = SessionId::from_raw(uuid::Uuid::new_v4().to_string());
        inner.sessions.insert(
            id.clone(),
            MemSession {
                name: spec.name,
                behavior: spec.behavior,
            },
        );
        Ok(id)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut inner = self.inner.lock().await;
        inner.counters.list_sessions += 1;
        inner.injected_fault("session list")?;

        Ok(inner
            .sessions
            .iter()
            .map(|(id, session)| SessionInfo {
                id: id.clone(),
                name: session.name.clone(),
            })
            .collect())
    }

    async fn destroy_session(&self, id: &SessionId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.counters.destroy_session += 1;
        inner.injected_fault("session destroy")?;

        Ok(inner.invalidate_session(id))
    }

    async fn register_service(&self, registration: ServiceRegistration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.counters.register_service += 1;
        inner.injected_fault("service register")?;

        // TTL checks start critical until the first renewal lands
        inner
            .checks
            .insert(registration.check.check_id.clone(), CheckStatus::Critical);
        inner
            .services
            .insert(registration.id.clone(), MemService { registration });
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.counters.deregister_service += 1;
        inner.injected_fault("service deregister")?;

        if let Some(svc) = inner.services.remove(service_id) {
            inner.checks.remove(&svc.registration.check.check_id);
        }
        Ok(())
    }

    async fn query_service(
        &self,
        name: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceRecord>> {
        let mut inner = self.inner.lock().await;
        inner.counters.query_service += 1;
        inner.injected_fault("service query")?;

        let mut records = Vec::new();
        for svc in inner.services.values() {
            let reg = &svc.registration;
            if reg.name != name {
                continue;
            }
            if let Some(tag) = tag {
                if !reg.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            if passing_only {
                let passing = inner
                    .checks
                    .get(&reg.check.check_id)
                    .map(|status| *status == CheckStatus::Pass)
                    .unwrap_or(false);
                if !passing {
                    continue;
                }
            }
            records.push(ServiceRecord {
                id: reg.id.clone(),
                address: reg.address.clone(),
                port: reg.port,
                tags: reg.tags.clone(),
                meta: reg.meta.clone(),
            });
        }
        Ok(records)
    }

    async fn update_ttl_check(
        &self,
        check_id: &str,
        status: CheckStatus,
        _output: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.counters.update_ttl_check += 1;
        inner.injected_fault("check update")?;

        match inner.checks.get_mut(check_id) {
            Some(current) => {
                *current = status;
                Ok(())
            }
            None => Err(Error::Store(format!("unknown check id: {}", check_id))),
        }
    }
}
