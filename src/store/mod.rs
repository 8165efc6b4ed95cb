//! Coordination Store Boundary
//!
//! The external KV + session + health-check substrate this layer
//! delegates to. `ConsulStore` talks to a real agent over HTTP;
//! `MemoryStore` implements the same contract in-process for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

mod consul;
mod memory;

pub use consul::ConsulStore;
pub use memory::{MemoryStore, StoreCallCounts};

/// Lease identifier issued by the coordination store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create from a raw store identifier
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the store does with a session's locked keys when the session
/// is invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBehavior {
    /// Delete every key the session holds
    Delete,
    /// Release the locks but keep the keys
    Release,
}

/// Parameters for creating a session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Session name; this layer uses the owning node's address string
    pub name: String,
    /// Lease TTL
    pub ttl: Duration,
    /// Delay before a released lock can be re-acquired
    pub lock_delay: Duration,
    /// Invalidation behavior
    pub behavior: SessionBehavior,
    /// Health check ids bound to the session
    pub checks: Vec<String>,
}

/// Summary of an existing session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
}

/// One stored key-value pair, with the session holding its lock (if any)
#[derive(Debug, Clone)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub session: Option<SessionId>,
}

/// One operation inside a multi-key transaction
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Release the lock held on `key` by `session`
    Unlock { key: String, session: SessionId },
    /// Delete `key`
    Delete { key: String },
}

/// Three-level health signal accepted by TTL checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Critical,
}

impl CheckStatus {
    /// Wire form expected by the store's check-update endpoint
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "passing",
            CheckStatus::Warn => "warning",
            CheckStatus::Critical => "critical",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

/// TTL health check attached to a service registration
#[derive(Debug, Clone)]
pub struct TtlCheck {
    /// Check identifier, also bound into the owner's session
    pub check_id: String,
    /// How often the owner must renew before the check goes critical
    pub ttl: Duration,
    /// How long a critical service lingers before the store
    /// deregisters it
    pub deregister_after: Duration,
}

/// Service registration carrying one membership record
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    /// Unique service instance id
    pub id: String,
    /// Catalog service name (shared by the whole cluster)
    pub name: String,
    /// Advertised address
    pub address: String,
    /// Advertised port
    pub port: u16,
    /// Query tags
    pub tags: Vec<String>,
    /// Opaque per-service metadata
    pub meta: HashMap<String, String>,
    /// TTL health check
    pub check: TtlCheck,
    /// Owning session; invalidating it removes the registration
    pub session: Option<SessionId>,
}

/// Service instance returned by a catalog query
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

/// Contract with the external coordination store.
///
/// Every method is one network round-trip and therefore a suspension
/// point; callers wrap these in the retry executor and pass their own
/// cancellation signal around the call.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key. `None` if the key does not exist.
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>>;

    /// Write a single key unconditionally. Returns store acknowledgement.
    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Lock-then-write: succeeds only if `key` is unlocked or already
    /// locked by `session`. Returns whether the lock was taken.
    async fn kv_acquire(&self, key: &str, value: Vec<u8>, session: &SessionId) -> Result<bool>;

    /// Delete a single key. Returns whether anything was deleted.
    async fn kv_delete(&self, key: &str) -> Result<bool>;

    /// Apply `ops` as one atomic unit. Returns false when the store
    /// rolled the transaction back without applying any of it.
    async fn kv_txn(&self, ops: &[TxnOp]) -> Result<bool>;

    /// Create a new session (lease)
    async fn create_session(&self, spec: SessionSpec) -> Result<SessionId>;

    /// List every live session
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;

    /// Destroy a session, cascading per its invalidation behavior.
    /// Returns whether the store acknowledged the destruction.
    async fn destroy_session(&self, id: &SessionId) -> Result<bool>;

    /// Register (or overwrite) a service instance
    async fn register_service(&self, registration: ServiceRegistration) -> Result<()>;

    /// Remove a service instance
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Query service instances by name, optionally filtered by tag and
    /// by passing-only health
    async fn query_service(
        &self,
        name: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceRecord>>;

    /// Update a TTL check with an explicit three-level status
    async fn update_ttl_check(&self, check_id: &str, status: CheckStatus, output: &str)
        -> Result<()>;
}
