//! Membership Records and Wire Schema
//!
//! One node's published record and its service-catalog encoding: a
//! single opaque payload field carrying the full entry, plus a fixed
//! set of scalar metadata fields that stay individually queryable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::node::{NodeAddress, NodeStatus};
use crate::store::ServiceRecord;

/// Wire schema generation for the metadata encoding below
const SCHEMA_VERSION: &str = "1";

/// Metadata field names
const META_SCHEMA_VERSION: &str = "schema-version";
const META_PAYLOAD: &str = "entry";
const META_GENERATION: &str = "generation";
const META_ADDRESS: &str = "address";
const META_PROXY_PORT: &str = "proxy-port";
const META_ZONES: &str = "zones";
const META_HOST_NAME: &str = "host-name";
const META_NODE_NAME: &str = "node-name";
const META_SUSPECT_TIMES: &str = "suspect-times";
const META_START_TIME: &str = "start-time";
const META_STATUS: &str = "status";

/// Catalog service id for a node's membership record
pub fn service_id(service_name: &str, node: &NodeAddress) -> String {
    format!("{}:{}", service_name, node)
}

/// Id of the TTL check attached to a node's membership record
pub fn service_check_id(service_name: &str, node: &NodeAddress) -> String {
    format!("service:{}", service_id(service_name, node))
}

/// One "unresponsive" observation filed against a node by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectObservation {
    /// The node that flagged the suspect
    pub by: NodeAddress,
    /// When it did so
    pub at: DateTime<Utc>,
}

/// One node's record in the membership table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// The node this record describes
    pub node: NodeAddress,
    /// Reported lifecycle status
    pub status: NodeStatus,
    /// When the node started
    pub start_time: DateTime<Utc>,
    /// Last liveness renewal known to this record
    pub i_am_alive_time: DateTime<Utc>,
    /// Peers that flagged this node unresponsive
    pub suspect_times: Vec<SuspectObservation>,
    /// Proxy endpoint port
    pub proxy_port: u16,
    /// Logical zone tags
    pub zones: Vec<String>,
    /// Host machine name
    pub host_name: String,
    /// Process (worker) name
    pub node_name: String,
}

impl MembershipEntry {
    /// Create a fresh record for a node that is about to join
    pub fn new(node: NodeAddress, host_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node,
            status: NodeStatus::None,
            start_time: now,
            i_am_alive_time: now,
            suspect_times: Vec::new(),
            proxy_port: 0,
            zones: Vec::new(),
            host_name: host_name.into(),
            node_name: node_name.into(),
        }
    }
}

/// Global generation of the membership set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVersion {
    /// Non-decreasing generation counter
    pub counter: u64,
    /// Opaque tag distinguishing writers at the same counter
    pub tag: String,
}

impl TableVersion {
    /// Version of an empty table
    pub fn initial() -> Self {
        Self {
            counter: 0,
            tag: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The version following this one
    pub fn next(&self) -> Self {
        Self {
            counter: self.counter + 1,
            tag: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl std::fmt::Display for TableVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.counter, self.tag)
    }
}

/// Encode an entry into the versioned metadata map
pub(crate) fn encode_meta(entry: &MembershipEntry) -> Result<HashMap<String, String>> {
    let mut meta = HashMap::new();
    meta.insert(META_SCHEMA_VERSION.to_string(), SCHEMA_VERSION.to_string());
    meta.insert(META_PAYLOAD.to_string(), serde_json::to_string(entry)?);
    meta.insert(META_GENERATION.to_string(), entry.node.generation.to_string());
    meta.insert(META_ADDRESS.to_string(), entry.node.endpoint.to_string());
    meta.insert(META_PROXY_PORT.to_string(), entry.proxy_port.to_string());
    meta.insert(META_ZONES.to_string(), entry.zones.join(","));
    meta.insert(META_HOST_NAME.to_string(), entry.host_name.clone());
    meta.insert(META_NODE_NAME.to_string(), entry.node_name.clone());
    meta.insert(
        META_SUSPECT_TIMES.to_string(),
        serde_json::to_string(&entry.suspect_times)?,
    );
    meta.insert(META_START_TIME.to_string(), entry.start_time.to_rfc3339());
    meta.insert(META_STATUS.to_string(), entry.status.to_string());
    Ok(meta)
}

/// Decode an entry from a catalog record.
///
/// A missing or unparseable payload is data corruption, surfaced as a
/// deserialization failure rather than coerced into a default entry.
pub(crate) fn decode_record(record: &ServiceRecord) -> Result<MembershipEntry> {
    let payload = record
        .meta
        .get(META_PAYLOAD)
        .ok_or_else(|| Error::Deserialization {
            key: record.id.clone(),
            reason: "missing entry payload field".to_string(),
        })?;

    serde_json::from_str(payload).map_err(|e| Error::Deserialization {
        key: record.id.clone(),
        reason: e.to_string(),
    })
}
