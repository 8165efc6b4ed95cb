//! Layer Wiring
//!
//! Owns the pieces shared by both halves of the layer: the store
//! client, the per-node session manager, and the shutdown token that
//! cancels any outstanding retry loop when the host tears down.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::directory::OwnershipDirectory;
use crate::error::Result;
use crate::membership::MembershipTable;
use crate::session::SessionManager;
use crate::store::{ConsulStore, CoordinationStore};

/// The assembled coordination layer, constructed once at startup and
/// handed to the owning runtime
pub struct Coordination {
    /// Cluster membership table
    pub membership: Arc<MembershipTable>,
    /// Entity ownership directory
    pub directory: Arc<OwnershipDirectory>,
    shutdown: CancellationToken,
}

impl Coordination {
    /// Connect to the configured store agent
    pub fn connect(config: &CoordinationConfig) -> Result<Self> {
        let store: Arc<dyn CoordinationStore> = Arc::new(ConsulStore::new(&config.store)?);
        Ok(Self::with_store(store, config))
    }

    /// Assemble the layer over an already-built store client.
    ///
    /// Both halves share one session manager, so a session discovered
    /// by the membership side is reused by the directory and vice
    /// versa.
    pub fn with_store(store: Arc<dyn CoordinationStore>, config: &CoordinationConfig) -> Self {
        let shutdown = CancellationToken::new();
        let sessions = Arc::new(SessionManager::new(store.clone(), config));

        let membership = Arc::new(MembershipTable::new(
            store.clone(),
            sessions.clone(),
            config,
            shutdown.clone(),
        ));
        let directory = Arc::new(OwnershipDirectory::new(
            store,
            sessions,
            config,
            shutdown.clone(),
        ));

        Self {
            membership,
            directory,
            shutdown,
        }
    }

    /// Cancel every outstanding operation and retry loop in the layer
    pub fn shutdown(&self) {
        tracing::info!("Coordination layer shutting down");
        self.shutdown.cancel();
    }
}
