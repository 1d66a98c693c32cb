//! Remote registry client.
//!
//! [`TrialRegistry`] is the seam the planner and executor talk through;
//! [`HttpRegistry`] implements it against an Eve-style REST API:
//!
//! - `GET    <trial_url>?where=<json>&projection=<json>` → `{"_items": [...]}`
//! - `POST   <trial_url>`                                → created document with `_id`
//! - `PUT    <trial_url>/<_id>` + `If-Match: <_etag>`     → 412 on a stale token
//! - `POST   <recompute_url>` with `{}`
//!
//! Every request carries the configured `Authorization` header and an
//! explicit connect/read/write timeout.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use trialsync_core::types::{is_closed_status, CLOSED_STATUS};
use trialsync_core::{ConcurrencyToken, NctId, RegistryId, SyncConfig};

use crate::error::ClientError;

/// A JSON trial document.
pub type Document = Map<String, Value>;

/// Fields the registry manages itself; they must not be echoed back on PUT.
pub const SERVER_MANAGED_FIELDS: [&str; 6] =
    ["_id", "_etag", "_summary", "_updated", "_created", "_links"];

/// Remote field holding the trial's local protocol identifiers.
pub const LOCAL_IDS_FIELD: &str = "local_protocol_ids";

// ---------------------------------------------------------------------------
// Remote document
// ---------------------------------------------------------------------------

/// A trial as stored in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrial {
    pub registry_id: RegistryId,
    pub concurrency_token: ConcurrencyToken,
    pub protocol_id: Option<u64>,
    pub protocol_no: Option<String>,
    pub nct_id: Option<String>,
    pub status: Option<String>,
    /// Full snapshot, used to build the close payload.
    pub document: Document,
}

impl RemoteTrial {
    /// Interpret a registry document. `_id` and `_etag` are mandatory.
    pub fn from_document(value: Value) -> Result<Self, ClientError> {
        let Value::Object(document) = value else {
            return Err(ClientError::Decode("trial document is not an object".into()));
        };
        let registry_id = string_field(&document, "_id")
            .ok_or_else(|| ClientError::Decode("trial document has no _id".into()))?;
        let concurrency_token = string_field(&document, "_etag").ok_or_else(|| {
            ClientError::Decode(format!("trial {registry_id} has no _etag"))
        })?;
        Ok(Self {
            registry_id: RegistryId(registry_id),
            concurrency_token: ConcurrencyToken(concurrency_token),
            protocol_id: document.get("protocol_id").and_then(as_u64),
            protocol_no: string_field(&document, "protocol_no"),
            nct_id: string_field(&document, "nct_id"),
            status: string_field(&document, "status"),
            document,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.status.as_deref().is_some_and(is_closed_status)
    }

    /// The snapshot with `status = closed` and server-managed fields removed.
    pub fn closed_payload(&self) -> Document {
        let mut payload = self.document.clone();
        strip_server_fields(&mut payload);
        payload.insert("status".into(), Value::String(CLOSED_STATUS.into()));
        payload
    }
}

/// Remove [`SERVER_MANAGED_FIELDS`] from a document.
pub fn strip_server_fields(document: &mut Document) {
    for field in SERVER_MANAGED_FIELDS {
        document.remove(field);
    }
}

fn string_field(document: &Document, key: &str) -> Option<String> {
    match document.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Lookups the engine performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialQuery {
    /// Match on `nct_id`.
    Nct(NctId),
    /// Match when any of the ids is in the remote local-protocol-id set.
    AnyLocalId(Vec<String>),
    /// Match on `protocol_no`.
    ProtocolNo(String),
}

impl TrialQuery {
    /// The `where` filter sent to the registry.
    pub fn filter(&self) -> Value {
        match self {
            TrialQuery::Nct(nct) => json!({ "nct_id": nct.as_str() }),
            TrialQuery::AnyLocalId(ids) => json!({ LOCAL_IDS_FIELD: { "$in": ids } }),
            TrialQuery::ProtocolNo(no) => json!({ "protocol_no": no }),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry seam
// ---------------------------------------------------------------------------

/// Operations against the remote trial registry.
pub trait TrialRegistry {
    /// All documents matching `query`, in registry order.
    fn find(&self, query: &TrialQuery) -> Result<Vec<RemoteTrial>, ClientError>;

    /// Create a document. Any 2xx is success; the server-assigned id is
    /// returned when the response carries one.
    fn create(&self, document: &Document) -> Result<Option<RegistryId>, ClientError>;

    /// Replace a document, conditional on `token` still being current.
    fn replace(
        &self,
        id: &RegistryId,
        token: &ConcurrencyToken,
        document: &Document,
    ) -> Result<(), ClientError>;

    /// Ask the registry to recompute its derived data.
    fn trigger_recompute(&self) -> Result<(), ClientError>;

    /// Every document, restricted to `fields`.
    fn project(&self, fields: &[&str]) -> Result<Vec<Value>, ClientError>;
}

/// First match for `query`, warning when the registry returned several.
pub fn find_first(
    registry: &dyn TrialRegistry,
    query: &TrialQuery,
) -> Result<Option<RemoteTrial>, ClientError> {
    let mut matches = registry.find(query)?;
    if matches.len() > 1 {
        tracing::warn!(
            filter = %query.filter(),
            count = matches.len(),
            "multiple registry matches, using the first"
        );
    }
    Ok(if matches.is_empty() {
        None
    } else {
        Some(matches.swap_remove(0))
    })
}

/// Highest `protocol_id` in the registry with its `protocol_no`.
pub fn max_protocol(
    registry: &dyn TrialRegistry,
) -> Result<Option<(u64, Option<String>)>, ClientError> {
    let items = registry.project(&["protocol_id", "protocol_no"])?;
    Ok(items
        .iter()
        .filter_map(|item| {
            let id = item.get("protocol_id").and_then(as_u64)?;
            let no = item
                .get("protocol_no")
                .and_then(Value::as_str)
                .map(str::to_owned);
            Some((id, no))
        })
        .max_by_key(|(id, _)| *id))
}

/// Every ClinicalTrials.gov id known to the registry, in registry order.
pub fn nct_ids(registry: &dyn TrialRegistry) -> Result<Vec<String>, ClientError> {
    let items = registry.project(&["nct_id"])?;
    Ok(items
        .iter()
        .filter_map(|item| item.get("nct_id").and_then(Value::as_str))
        .filter(|id| id.starts_with("NCT"))
        .map(str::to_owned)
        .collect())
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ItemsEnvelope {
    #[serde(rename = "_items", default)]
    items: Vec<Value>,
}

/// Blocking HTTP client for the registry.
pub struct HttpRegistry {
    agent: ureq::Agent,
    trial_url: String,
    recompute_url: String,
    authorization: String,
}

impl HttpRegistry {
    pub fn new(config: &SyncConfig) -> Self {
        let timeout = config.request_timeout();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            trial_url: config.trial_url(),
            recompute_url: config.recompute_url(),
            authorization: config.authorization(),
        }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        self.agent
            .request(method, url)
            .set("Authorization", &self.authorization)
            .set("Content-Type", "application/json")
    }

    fn get_items(&self, params: &[(&str, String)]) -> Result<Vec<Value>, ClientError> {
        let mut req = self.request("GET", &self.trial_url);
        for (key, value) in params {
            req = req.query(key, value);
        }
        let resp = req.call().map_err(|e| map_ureq_error(e, None))?;
        let envelope: ItemsEnvelope = resp
            .into_json()
            .map_err(|e| ClientError::Decode(format!("listing response: {e}")))?;
        Ok(envelope.items)
    }
}

impl TrialRegistry for HttpRegistry {
    fn find(&self, query: &TrialQuery) -> Result<Vec<RemoteTrial>, ClientError> {
        tracing::debug!(filter = %query.filter(), "registry lookup");
        self.get_items(&[("where", query.filter().to_string())])?
            .into_iter()
            .map(RemoteTrial::from_document)
            .collect()
    }

    fn create(&self, document: &Document) -> Result<Option<RegistryId>, ClientError> {
        tracing::debug!(url = %self.trial_url, "POST trial");
        let resp = self
            .request("POST", &self.trial_url)
            .send_json(Value::Object(document.clone()))
            .map_err(|e| map_ureq_error(e, None))?;
        let status = resp.status();
        // The document is stored once the status is 2xx, whatever the body says.
        let body = resp.into_string().unwrap_or_default();
        let id = serde_json::from_str::<Value>(&body).ok().and_then(|created| {
            created
                .get("_id")
                .and_then(Value::as_str)
                .map(RegistryId::from)
        });
        if id.is_none() {
            tracing::warn!(status, "create response carries no _id");
        }
        Ok(id)
    }

    fn replace(
        &self,
        id: &RegistryId,
        token: &ConcurrencyToken,
        document: &Document,
    ) -> Result<(), ClientError> {
        let url = format!("{}/{}", self.trial_url, id);
        tracing::debug!(url = %url, "PUT trial");
        self.request("PUT", &url)
            .set("If-Match", &token.0)
            .send_json(Value::Object(document.clone()))
            .map_err(|e| map_ureq_error(e, Some(id)))?;
        Ok(())
    }

    fn trigger_recompute(&self) -> Result<(), ClientError> {
        self.request("POST", &self.recompute_url)
            .send_json(json!({}))
            .map_err(|e| map_ureq_error(e, None))?;
        Ok(())
    }

    fn project(&self, fields: &[&str]) -> Result<Vec<Value>, ClientError> {
        let projection: Map<String, Value> = fields
            .iter()
            .map(|field| ((*field).to_owned(), json!(1)))
            .collect();
        self.get_items(&[("projection", Value::Object(projection).to_string())])
    }
}

fn map_ureq_error(err: ureq::Error, registry_id: Option<&RegistryId>) -> ClientError {
    match err {
        ureq::Error::Status(status, resp) => match registry_id {
            Some(id) if status == 412 => ClientError::Conflict {
                registry_id: id.to_string(),
                status,
            },
            _ => ClientError::Status {
                status,
                body: resp.into_string().unwrap_or_default(),
            },
        },
        ureq::Error::Transport(transport) => ClientError::Transport(transport.to_string()),
    }
}
