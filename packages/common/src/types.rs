use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status reported by the backend for a VPS session.
///
/// Unrecognized strings are kept verbatim in `Other` so a newer backend
/// never breaks list decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionStatus {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Failed,
    Expired,
    Deleted,
    Other(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Provisioning => "provisioning",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
            SessionStatus::Deleted => "deleted",
            SessionStatus::Other(raw) => raw.as_str(),
        }
    }

    /// `failed`, `expired` and `deleted` never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Failed | SessionStatus::Expired | SessionStatus::Deleted
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Provisioning)
    }
}

impl From<String> for SessionStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => SessionStatus::Pending,
            "provisioning" => SessionStatus::Provisioning,
            "ready" => SessionStatus::Ready,
            "failed" => SessionStatus::Failed,
            "expired" => SessionStatus::Expired,
            "deleted" => SessionStatus::Deleted,
            _ => SessionStatus::Other(raw),
        }
    }
}

impl From<&str> for SessionStatus {
    fn from(raw: &str) -> Self {
        SessionStatus::from(raw.to_string())
    }
}

impl From<SessionStatus> for String {
    fn from(status: SessionStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RDP connection details, only populated by the backend once a session is ready.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RdpBundle {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// The catalog entry a session was purchased from, as embedded in session payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price_coins: Option<i64>,
    #[serde(default)]
    pub provision_action: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    // Action codes arrive either as numbers or numeric strings.
    #[serde(default)]
    pub worker_action: Option<Value>,
    #[serde(default)]
    pub provision_action: Option<Value>,
    #[serde(default)]
    pub product: Option<ProductRef>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub worker_route: Option<String>,
    #[serde(default)]
    pub has_log: bool,
    #[serde(default)]
    pub log_url: Option<String>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub rdp: Option<RdpBundle>,
}

impl Session {
    pub fn new(id: impl Into<String>, status: SessionStatus) -> Self {
        Self {
            id: id.into(),
            status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price_coins: i64,
    #[serde(default)]
    pub provision_action: Option<Value>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl Product {
    /// Products without an explicit flag are listed by `/vps/products?active=true`
    /// and therefore treated as active.
    pub fn is_active(&self) -> bool {
        self.is_active.unwrap_or(true)
    }
}

/// Body of `POST /vps/sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub product_id: String,
    pub vm_type: String,
    pub idempotency_key: String,
}

/// Mutation responses come either bare or wrapped as `{"session": ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SessionEnvelope {
    Wrapped { session: Session },
    Bare(Session),
}

impl SessionEnvelope {
    pub fn into_session(self) -> Session {
        match self {
            SessionEnvelope::Wrapped { session } => session,
            SessionEnvelope::Bare(session) => session,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SessionList {
    Wrapped { sessions: Vec<Session> },
    Bare(Vec<Session>),
}

impl SessionList {
    pub fn into_sessions(self) -> Vec<Session> {
        match self {
            SessionList::Wrapped { sessions } => sessions,
            SessionList::Bare(sessions) => sessions,
        }
    }
}

/// One worker's capacity as reported by `GET /vps/availability`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapacity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    /// `-1` when the worker could not be asked.
    #[serde(default)]
    pub tokens_left: i64,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Capacity pre-check, either for one product or across the active catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub tokens_left: Option<i64>,
    #[serde(default)]
    pub workers: Vec<WorkerCapacity>,
    // Only present on the catalog-wide check.
    #[serde(default)]
    pub available_products: Option<Vec<String>>,
}

impl Availability {
    /// Whether `product_id` can be launched according to a catalog-wide check.
    pub fn product_available(&self, product_id: &str) -> bool {
        match &self.available_products {
            Some(ids) => ids.iter().any(|id| id == product_id),
            None => self.available,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub added: Option<i64>,
    #[serde(default)]
    pub balance: Option<i64>,
    #[serde(default)]
    pub gift_title: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub remaining: Option<i64>,
}

/// Error envelope returned by the backend on non-2xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<Value>,
}

impl ErrorBody {
    /// String details are returned verbatim; structured ones as compact JSON.
    pub fn detail_text(&self) -> Option<String> {
        match self.detail.as_ref()? {
            Value::Null => None,
            Value::String(text) if text.trim().is_empty() => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse))
    }

    // The backend emits isoformat(); naive values are taken as UTC.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }
}
