//! Node and Entity Identity
//!
//! Identity types shared by the membership table and the ownership
//! directory. A `NodeAddress` pairs a network endpoint with a restart
//! generation so two incarnations of the same process never collide.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::Error;

/// Stable identity of one worker process in the cluster.
///
/// Immutable once created. The string form `ip:port@generation` is used
/// as the session name in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Cluster communication endpoint
    pub endpoint: SocketAddr,
    /// Restart generation, disambiguates incarnations at the same endpoint
    pub generation: u64,
}

impl NodeAddress {
    /// Create a new node address
    pub fn new(endpoint: SocketAddr, generation: u64) -> Self {
        Self { endpoint, generation }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.generation)
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, generation) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::Config(format!("Invalid node address '{}': missing generation", s)))?;

        let endpoint: SocketAddr = endpoint
            .parse()
            .map_err(|e| Error::Config(format!("Invalid node address '{}': {}", s, e)))?;

        let generation: u64 = generation
            .parse()
            .map_err(|e| Error::Config(format!("Invalid node generation in '{}': {}", s, e)))?;

        Ok(Self { endpoint, generation })
    }
}

/// Node lifecycle status published in the membership table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// No status reported yet
    None,
    /// Node object exists but has not started joining
    Created,
    /// Node is joining the cluster
    Joining,
    /// Node is active and serving
    Active,
    /// Node has begun a graceful shutdown
    ShuttingDown,
    /// Node is stopping its hosted workloads
    Stopping,
    /// Node is dead
    Dead,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::None => write!(f, "NONE"),
            NodeStatus::Created => write!(f, "CREATED"),
            NodeStatus::Joining => write!(f, "JOINING"),
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            NodeStatus::Stopping => write!(f, "STOPPING"),
            NodeStatus::Dead => write!(f, "DEAD"),
        }
    }
}

impl NodeStatus {
    /// True for the states a node passes through while tearing down
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            NodeStatus::ShuttingDown | NodeStatus::Stopping | NodeStatus::Dead
        )
    }
}

/// Opaque identifier of a unit of distributed state hosted by exactly
/// one node at a time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create from a raw identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
