//! Consul Agent HTTP Client
//!
//! Implements the coordination-store contract against a Consul-style
//! agent API: `/v1/kv` with acquire semantics, `/v1/txn`,
//! `/v1/session`, `/v1/agent/service`, `/v1/agent/check/update`, and
//! `/v1/health/service`.

use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

use super::{
    CheckStatus, CoordinationStore, KvPair, ServiceRecord, ServiceRegistration, SessionBehavior,
    SessionId, SessionInfo, SessionSpec, TxnOp,
};

/// Meta key carrying the owning session on a service registration
const META_SESSION_KEY: &str = "wolfpack-session";

/// Coordination store backed by a Consul-style HTTP agent
pub struct ConsulStore {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulStore {
    /// Create a client for the configured agent endpoint
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.address.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-success response to the error taxonomy: server-side
    /// failures are retryable unavailability, everything else is a
    /// terminal rejection.
    async fn ensure_success(context: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(Error::StoreUnavailable(format!("{}: {} {}", context, status, body)))
        } else {
            Err(Error::Store(format!("{}: {} {}", context, status, body)))
        }
    }
}

/// KV entry as returned by `/v1/kv`
#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "Session")]
    session: Option<String>,
}

impl KvEntry {
    fn into_pair(self) -> Result<KvPair> {
        let value = match &self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::Deserialization {
                    key: self.key.clone(),
                    reason: format!("invalid base64 payload: {}", e),
                })?,
            None => Vec::new(),
        };

        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.map(SessionId::from_raw),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

/// Store wire form of a duration, e.g. `10s`
fn duration_str(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

fn behavior_str(behavior: SessionBehavior) -> &'static str {
    match behavior {
        SessionBehavior::Delete => "delete",
        SessionBehavior::Release => "release",
    }
}

fn txn_op_json(op: &TxnOp) -> serde_json::Value {
    match op {
        TxnOp::Unlock { key, session } => json!({
            "KV": {
                "Verb": "unlock",
                "Key": key,
                "Session": session.as_str(),
            }
        }),
        TxnOp::Delete { key } => json!({
            "KV": {
                "Verb": "delete",
                "Key": key,
            }
        }),
    }
}

#[async_trait::async_trait]
impl CoordinationStore for ConsulStore {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/kv/{}", key)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::ensure_success("kv get", response).await?;
        let mut entries: Vec<KvEntry> = response.json().await?;

        match entries.pop() {
            Some(entry) => Ok(Some(entry.into_pair()?)),
            None => Ok(None),
        }
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let response = self
            .client
            .put(self.url(&format!("/v1/kv/{}", key)))
            .body(value)
            .send()
            .await?;

        let response = Self::ensure_success("kv put", response).await?;
        Ok(response.json().await?)
    }

    async fn kv_acquire(&self, key: &str, value: Vec<u8>, session: &SessionId) -> Result<bool> {
        let response = self
            .client
            .put(self.url(&format!("/v1/kv/{}", key)))
            .query(&[("acquire", session.as_str())])
            .body(value)
            .send()
            .await?;

        let response = Self::ensure_success("kv acquire", response).await?;
        Ok(response.json().await?)
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/kv/{}", key)))
            .send()
            .await?;

        let response = Self::ensure_success("kv delete", response).await?;
        Ok(response.json().await?)
    }

    async fn kv_txn(&self, ops: &[TxnOp]) -> Result<bool> {
        let body: Vec<serde_json::Value> = ops.iter().map(txn_op_json).collect();
        let response = self
            .client
            .put(self.url("/v1/txn"))
            .json(&body)
            .send()
            .await?;

        // The agent rolls the transaction back and answers 409 when any
        // op fails; that is a refused transaction, not a fault.
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }

        Self::ensure_success("kv txn", response).await?;
        Ok(true)
    }

    async fn create_session(&self, spec: SessionSpec) -> Result<SessionId> {
        let name = spec.name.clone();
        let body = json!({
            "Name": spec.name,
            "TTL": duration_str(spec.ttl),
            "LockDelay": duration_str(spec.lock_delay),
            "Behavior": behavior_str(spec.behavior),
            "Checks": spec.checks,
        });

        let response = self
            .client
            .put(self.url("/v1/session/create"))
            .json(&body)
            .send()
            .await?;

        let response = match Self::ensure_success("session create", response).await {
            Ok(r) => r,
            Err(Error::Store(reason)) => {
                return Err(Error::SessionCreation { node: name, reason });
            }
            Err(e) => return Err(e),
        };

        let created: SessionCreated = response.json().await?;
        Ok(SessionId::from_raw(created.id))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let response = self
            .client
            .get(self.url("/v1/session/list"))
            .send()
            .await?;

        let response = Self::ensure_success("session list", response).await?;
        let entries: Vec<SessionEntry> = response.json().await?;

        Ok(entries
            .into_iter()
            .map(|entry| SessionInfo {
                id: SessionId::from_raw(entry.id),
                name: entry.name,
            })
            .collect())
    }

    async fn destroy_session(&self, id: &SessionId) -> Result<bool> {
        let response = self
            .client
            .put(self.url(&format!("/v1/session/destroy/{}", id)))
            .send()
            .await?;

        let response = Self::ensure_success("session destroy", response).await?;
        Ok(response.json().await?)
    }

    async fn register_service(&self, registration: ServiceRegistration) -> Result<()> {
        let mut meta = registration.meta.clone();
        if let Some(session) = &registration.session {
            meta.insert(META_SESSION_KEY.to_string(), session.as_str().to_string());
        }

        let body = json!({
            "ID": registration.id,
            "Name": registration.name,
            "Address": registration.address,
            "Port": registration.port,
            "Tags": registration.tags,
            "Meta": meta,
            "Check": {
                "CheckID": registration.check.check_id,
                "TTL": duration_str(registration.check.ttl),
                "DeregisterCriticalServiceAfter": duration_str(registration.check.deregister_after),
            },
        });

        let response = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .send()
            .await?;

        Self::ensure_success("service register", response).await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{}", service_id)))
            .send()
            .await?;

        Self::ensure_success("service deregister", response).await?;
        Ok(())
    }

    async fn query_service(
        &self,
        name: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceRecord>> {
        let mut request = self
            .client
            .get(self.url(&format!("/v1/health/service/{}", name)));

        if let Some(tag) = tag {
            request = request.query(&[("tag", tag)]);
        }
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }

        let response = request.send().await?;
        let response = Self::ensure_success("service query", response).await?;
        let entries: Vec<HealthEntry> = response.json().await?;

        Ok(entries
            .into_iter()
            .map(|entry| ServiceRecord {
                id: entry.service.id,
                address: entry.service.address,
                port: entry.service.port,
                tags: entry.service.tags,
                meta: entry.service.meta,
            })
            .collect())
    }

    async fn update_ttl_check(
        &self,
        check_id: &str,
        status: CheckStatus,
        output: &str,
    ) -> Result<()> {
        let body = json!({
            "Status": status.as_wire_str(),
            "Output": output,
        });

        let response = self
            .client
            .put(self.url(&format!("/v1/agent/check/update/{}", check_id)))
            .json(&body)
            .send()
            .await?;

        Self::ensure_success("check update", response).await?;
        Ok(())
    }
}
