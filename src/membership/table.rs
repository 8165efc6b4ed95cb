//! Membership Table
//!
//! Publishes node records into the store's service catalog under the
//! node's own session, renews liveness through TTL checks, and keeps a
//! monotonically advancing table version in the KV tree.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::node::{NodeAddress, NodeStatus};
use crate::retry::{retry_transient, with_shutdown, RetryPolicy};
use crate::session::SessionManager;
use crate::store::{CoordinationStore, ServiceRegistration, TtlCheck};

use super::entry::{decode_record, encode_meta};
use super::health::translate_status;
use super::{service_check_id, service_id, MembershipEntry, TableVersion};

/// Fixed skew subtracted from "now" when a read reports a record's
/// last-alive instant. Reads assert freshness instead of echoing the
/// stored heartbeat time.
const ALIVE_READ_SKEW_SECS: i64 = 5;

fn fresh_alive_time() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(ALIVE_READ_SKEW_SECS)
}

/// Cluster membership table over the coordination store
pub struct MembershipTable {
    store: Arc<dyn CoordinationStore>,
    sessions: Arc<SessionManager>,
    cluster_name: String,
    service_name: String,
    kv_prefix: String,
    extended_tags: Vec<String>,
    session_ttl: Duration,
    destroy_timeout: Duration,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    /// Latest status the owning runtime pushed for each node
    observed: RwLock<HashMap<NodeAddress, NodeStatus>>,
}

impl MembershipTable {
    /// Create a membership table over the given store
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
            service_name: config.cluster.service_name.clone(),
            kv_prefix: config.cluster.kv_prefix.clone(),
            extended_tags: config.cluster.extended_tags.clone(),
            session_ttl: config.session_ttl(),
            destroy_timeout: config.destroy_timeout(),
            retry: config.retry_policy(),
            shutdown,
            observed: RwLock::new(HashMap::new()),
        }
    }

    fn version_key(&self) -> String {
        format!("{}/{}/version", self.kv_prefix, self.cluster_name)
    }

    /// Read one node's record.
    ///
    /// The table is authoritative for registered nodes, so zero matches
    /// is an error here, and more than one match means the catalog is
    /// corrupt.
    pub async fn read_one(
        &self,
        node: &NodeAddress,
        cancel: &CancellationToken,
    ) -> Result<MembershipEntry> {
        with_shutdown(&self.shutdown, async {
            let tag = node.to_string();
            let records = retry_transient("membership read", &self.retry, cancel, || {
                self.store
                    .query_service(&self.service_name, Some(tag.as_str()), false)
            })
            .await?;

            match records.as_slice() {
                [] => Err(Error::NotFound(tag)),
                [record] => {
                    let mut entry = decode_record(record)?;
                    entry.i_am_alive_time = fresh_alive_time();
                    Ok(entry)
                }
                many => Err(Error::AmbiguousResult {
                    node: tag,
                    count: many.len(),
                }),
            }
        })
        .await
    }

    /// Read the whole table, with the current version attached
    pub async fn read_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Vec<MembershipEntry>, TableVersion)> {
        with_shutdown(&self.shutdown, async {
            let records = retry_transient("membership read all", &self.retry, cancel, || {
                self.store
                    .query_service(&self.service_name, Some(self.cluster_name.as_str()), false)
            })
            .await?;

            let mut entries = Vec::with_capacity(records.len());
            for record in &records {
                let mut entry = decode_record(record)?;
                entry.i_am_alive_time = fresh_alive_time();
                entries.push(entry);
            }

            let version = self.read_version(cancel).await?;
            Ok((entries, version))
        })
        .await
    }

    /// Register (or overwrite) a node's record and advance the table
    /// version.
    ///
    /// `expected_version` is advisory: the bump is read-current,
    /// write-current+1, last-writer-wins across concurrent inserts.
    /// Emits a liveness update immediately so the fresh record starts
    /// passing.
    pub async fn insert_row(
        &self,
        entry: &MembershipEntry,
        expected_version: &TableVersion,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        with_shutdown(&self.shutdown, async {
            let session = self.sessions.ensure_session(&entry.node, true, cancel).await?;

            let mut tags = vec![self.cluster_name.clone(), entry.node.to_string()];
            tags.extend(self.extended_tags.iter().cloned());

            let registration = ServiceRegistration {
                id: service_id(&self.service_name, &entry.node),
                name: self.service_name.clone(),
                address: entry.node.endpoint.ip().to_string(),
                port: entry.node.endpoint.port(),
                tags,
                meta: encode_meta(entry)?,
                check: TtlCheck {
                    check_id: service_check_id(&self.service_name, &entry.node),
                    ttl: self.session_ttl,
                    deregister_after: self.destroy_timeout,
                },
                session: Some(session),
            };

            retry_transient("membership register", &self.retry, cancel, || {
                self.store.register_service(registration.clone())
            })
            .await?;

            let version = self.bump_version(cancel).await?;
            if expected_version.counter + 1 != version.counter {
                tracing::debug!(
                    "Concurrent membership writers advanced the version: expected {}, wrote {}",
                    expected_version,
                    version
                );
            }
            tracing::info!("Membership row for {} written at version {}", entry.node, version);

            self.update_i_am_alive(entry, cancel).await?;
            Ok(true)
        })
        .await
    }

    /// Status changes are just re-registrations
    pub async fn update_row(
        &self,
        entry: &MembershipEntry,
        expected_version: &TableVersion,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.insert_row(entry, expected_version, cancel).await
    }

    /// Renew the node's TTL check; the heartbeat. Must run more often
    /// than the session TTL to keep the record from going critical.
    pub async fn update_i_am_alive(
        &self,
        entry: &MembershipEntry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        with_shutdown(&self.shutdown, async {
            let local = self.observed.read().await.get(&entry.node).copied();
            let signal = translate_status(entry.status, local);
            let check_id = service_check_id(&self.service_name, &entry.node);
            let note = format!("{} at {}", entry.status, Utc::now().to_rfc3339());

            retry_transient("liveness update", &self.retry, cancel, || {
                self.store.update_ttl_check(&check_id, signal, &note)
            })
            .await
        })
        .await
    }

    /// Runtime push hook: record the locally observed status for a
    /// node, used to temper subsequent liveness updates
    pub async fn notify_status_change(&self, node: NodeAddress, status: NodeStatus) {
        tracing::info!("Status change for {}: {}", node, status);
        self.observed.write().await.insert(node, status);
    }

    /// Shutdown-time removal: destroy the node's lease (the store
    /// cascades every key it held) and drop its catalog record
    pub async fn deregister(&self, node: &NodeAddress, cancel: &CancellationToken) -> Result<()> {
        with_shutdown(&self.shutdown, async {
            if let Some(session) = self.sessions.cached(node).await {
                let destroyed = retry_transient("session destroy", &self.retry, cancel, || {
                    self.store.destroy_session(&session)
                })
                .await?;
                if !destroyed {
                    tracing::debug!("Session {} for {} was already gone", session, node);
                }
                self.sessions.forget(node).await;
            }

            let id = service_id(&self.service_name, node);
            retry_transient("membership deregister", &self.retry, cancel, || {
                self.store.deregister_service(&id)
            })
            .await
        })
        .await
    }

    /// Not supported by this backend; session expiry already performs
    /// equivalent cleanup
    pub async fn delete_all_entries(&self) -> Result<()> {
        Err(Error::Unsupported(
            "delete-all-entries: session expiry cleans this table up",
        ))
    }

    /// Not supported by this backend; session expiry already performs
    /// equivalent cleanup
    pub async fn cleanup_defunct_entries(&self, _before: DateTime<Utc>) -> Result<()> {
        Err(Error::Unsupported(
            "cleanup-defunct-entries: session expiry cleans this table up",
        ))
    }

    async fn read_version(&self, cancel: &CancellationToken) -> Result<TableVersion> {
        let key = self.version_key();
        let pair = retry_transient("version read", &self.retry, cancel, || {
            self.store.kv_get(&key)
        })
        .await?;

        match pair {
            None => Ok(TableVersion::initial()),
            Some(pair) => {
                serde_json::from_slice(&pair.value).map_err(|e| Error::Deserialization {
                    key,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn bump_version(&self, cancel: &CancellationToken) -> Result<TableVersion> {
        let current = self.read_version(cancel).await?;
        let next = current.next();

        let key = self.version_key();
        let value = serde_json::to_vec(&next)?;
        retry_transient("version write", &self.retry, cancel, || {
            self.store.kv_put(&key, value.clone())
        })
        .await?;

        Ok(next)
    }
}
