//! Entity Ownership Directory
//!
//! Maps entity identifiers to their owning node. Each mapping is one
//! store key locked by the owner's session, so ownership is exactly as
//! durable as the owner's liveness signal: a crashed node's entities
//! become unowned the moment its lease lapses, with no reconciliation
//! pass.

use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::node::{EntityId, NodeAddress};
use crate::retry::{retry_transient, with_shutdown, RetryPolicy};
use crate::session::SessionManager;
use crate::store::{CoordinationStore, TxnOp};

/// The stored entity-to-node mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub entity: EntityId,
    pub node: NodeAddress,
}

/// Outcome of a registration attempt.
///
/// Contention and failed transfers are normal control flow the caller
/// must branch on; only faults surface through the error arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The mapping is in place, owned by the requested node
    Registered(OwnershipRecord),
    /// The key is locked by a different session; the caller picks
    /// another owner or retries
    Conflict,
    /// The {unlock, delete} transfer transaction did not fully apply;
    /// the old mapping remains authoritative
    TransferFailed,
}

impl RegisterOutcome {
    /// True when the requested node now owns the entity
    pub fn is_registered(&self) -> bool {
        matches!(self, RegisterOutcome::Registered(_))
    }
}

/// Entity ownership directory over the coordination store
pub struct OwnershipDirectory {
    store: Arc<dyn CoordinationStore>,
    sessions: Arc<SessionManager>,
    cluster_name: String,
    kv_prefix: String,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl OwnershipDirectory {
    /// Create a directory over the given store
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        sessions: Arc<SessionManager>,
        config: &CoordinationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            sessions,
            cluster_name: config.cluster.name.clone(),
            kv_prefix: config.cluster.kv_prefix.clone(),
            retry: config.retry_policy(),
            shutdown,
        }
    }

    fn entity_key(&self, entity: &EntityId) -> String {
        format!("{}/{}/directory/{}", self.kv_prefix, self.cluster_name, entity)
    }

    /// Place `entity` on `node`.
    ///
    /// Ensures the node's session (searching for a surviving one, since
    /// registration is the first thing to run after a topology change),
    /// then attempts the session-guarded acquire write. Idempotent for
    /// the same node re-registering the same entity.
    pub async fn register(
        &self,
        entity: &EntityId,
        node: &NodeAddress,
        cancel: &CancellationToken,
    ) -> Result<RegisterOutcome> {
        with_shutdown(&self.shutdown, self.register_inner(entity, node, cancel)).await
    }

    async fn register_inner(
        &self,
        entity: &EntityId,
        node: &NodeAddress,
        cancel: &CancellationToken,
    ) -> Result<RegisterOutcome> {
        let session = self.sessions.ensure_session(node, true, cancel).await?;
        let key = self.entity_key(entity);
        let value = serde_json::to_vec(node)?;

        let acquired = retry_transient("ownership acquire", &self.retry, cancel, || {
            self.store.kv_acquire(&key, value.clone(), &session)
        })
        .await?;

        if acquired {
            tracing::debug!("Registered {} on {}", entity, node);
            Ok(RegisterOutcome::Registered(OwnershipRecord {
                entity: entity.clone(),
                node: *node,
            }))
        } else {
            tracing::debug!("Ownership conflict for {}: key locked by another session", entity);
            Ok(RegisterOutcome::Conflict)
        }
    }

    /// Move `entity` from `previous` to `node`.
    ///
    /// A missing or identical previous owner degrades to a plain
    /// registration. Otherwise the previous mapping is released with an
    /// atomic {unlock, delete} transaction first; if that transaction
    /// does not fully apply, nothing is registered and the old mapping
    /// stays authoritative.
    pub async fn register_with_previous(
        &self,
        entity: &EntityId,
        node: &NodeAddress,
        previous: Option<&NodeAddress>,
        cancel: &CancellationToken,
    ) -> Result<RegisterOutcome> {
        let prev = match previous {
            None => return self.register(entity, node, cancel).await,
            Some(prev) if prev == node => return self.register(entity, node, cancel).await,
            Some(prev) => prev,
        };

        with_shutdown(&self.shutdown, async {
            let key = self.entity_key(entity);
            let current = retry_transient("ownership read", &self.retry, cancel, || {
                self.store.kv_get(&key)
            })
            .await?;

            let Some(current) = current else {
                // The old lease already lapsed and cascaded the key away
                tracing::debug!("Previous owner {} already released {}", prev, entity);
                return self.register_inner(entity, node, cancel).await;
            };

            let holder: NodeAddress =
                serde_json::from_slice(&current.value).map_err(|e| Error::Deserialization {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            if holder != *prev {
                tracing::warn!(
                    "Refusing transfer of {}: owned by {}, not by {}",
                    entity,
                    holder,
                    prev
                );
                return Ok(RegisterOutcome::TransferFailed);
            }

            let mut ops = Vec::new();
            if let Some(holder_session) = current.session {
                ops.push(TxnOp::Unlock {
                    key: key.clone(),
                    session: holder_session,
                });
            }
            ops.push(TxnOp::Delete { key: key.clone() });

            let applied = retry_transient("ownership transfer", &self.retry, cancel, || {
                self.store.kv_txn(&ops)
            })
            .await?;

            if !applied {
                tracing::warn!(
                    "Transfer transaction for {} rolled back; {} remains the owner",
                    entity,
                    prev
                );
                return Ok(RegisterOutcome::TransferFailed);
            }

            self.register_inner(entity, node, cancel).await
        })
        .await
    }

    /// Resolve the current owner of `entity`.
    ///
    /// `None` means the placement is unknown and the caller must
    /// re-resolve; it is not an error.
    pub async fn lookup(
        &self,
        entity: &EntityId,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnershipRecord>> {
        with_shutdown(&self.shutdown, async {
            let key = self.entity_key(entity);
            let pair = retry_transient("ownership lookup", &self.retry, cancel, || {
                self.store.kv_get(&key)
            })
            .await?;

            match pair {
                None => Ok(None),
                Some(pair) if pair.value.is_empty() => Ok(None),
                Some(pair) => {
                    let node: NodeAddress = serde_json::from_slice(&pair.value).map_err(|e| {
                        Error::Deserialization {
                            key,
                            reason: e.to_string(),
                        }
                    })?;
                    Ok(Some(OwnershipRecord {
                        entity: entity.clone(),
                        node,
                    }))
                }
            }
        })
        .await
    }

    /// Release `entity`'s mapping. Best-effort: a delete that finds
    /// nothing is logged, not failed.
    pub async fn unregister(&self, entity: &EntityId, cancel: &CancellationToken) -> Result<()> {
        with_shutdown(&self.shutdown, async {
            let key = self.entity_key(entity);
            let deleted = retry_transient("ownership release", &self.retry, cancel, || {
                self.store.kv_delete(&key)
            })
            .await?;

            if !deleted {
                tracing::debug!("No ownership record to release for {}", entity);
            }
            Ok(())
        })
        .await
    }

    /// Evict a set of departed nodes by destroying their sessions.
    ///
    /// The store's invalidation cascade removes every ownership record
    /// and membership entry those sessions held; this method never
    /// issues per-entity deletes. Matched nodes are also dropped from
    /// the local session cache.
    pub async fn unregister_nodes(
        &self,
        nodes: &[NodeAddress],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        with_shutdown(&self.shutdown, async {
            let names: HashSet<String> = nodes.iter().map(ToString::to_string).collect();
            let sessions = retry_transient("session list", &self.retry, cancel, || {
                self.store.list_sessions()
            })
            .await?;

            for session in sessions.iter().filter(|s| names.contains(&s.name)) {
                let destroyed = retry_transient("session destroy", &self.retry, cancel, || {
                    self.store.destroy_session(&session.id)
                })
                .await?;
                if destroyed {
                    tracing::info!(
                        "Destroyed session {} for departed node {}",
                        session.id,
                        session.name
                    );
                } else {
                    tracing::debug!("Session {} for {} was already gone", session.id, session.name);
                }
            }

            for node in nodes {
                self.sessions.forget(node).await;
            }
            Ok(())
        })
        .await
    }
}
