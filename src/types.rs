use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// --- Enums ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentType {
    Request,
    Assigned,
    Declined,
    AlreadyAssigned,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentResponseKind {
    Accept,
    Reject,
}

/// Who is on the other end of the session; the broker routes by these.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Customer,
    DeliveryAgent,
    Store,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Customer => "CUSTOMER",
            UserType::DeliveryAgent => "DELIVERY_AGENT",
            UserType::Store => "STORE",
        }
    }
}

// --- Session ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: String,
    pub user_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
}

impl SessionIdentity {
    pub fn delivery_agent(agent_id: impl Into<String>) -> Self {
        Self {
            user_id: agent_id.into(),
            user_type: UserType::DeliveryAgent,
            store_id: None,
        }
    }
}

// --- Inbound payloads ---

/// Order assignment event pushed to a delivery agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentMessage {
    pub order_id: u64,
    #[serde(rename = "type")]
    pub kind: AssignmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_agent_id: Option<u64>,
    /// Anything else the server attaches (addresses, amounts, timers...).
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdate {
    pub order_id: u64,
    pub status: String,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

// --- Outbound payloads ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResponse {
    pub order_id: u64,
    pub delivery_agent_id: u64,
    pub response: AssignmentResponseKind,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub order_id: u64,
    pub delivery_agent_id: u64,
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub order_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

// --- Token refresh ---

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(deserialize_with = "deserialize_expiry")]
    pub token_expiry: DateTime<Utc>,
}

/// `tokenExpiry` arrives either as epoch milliseconds or as an RFC 3339 string.
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expiry {
        Millis(i64),
        Text(String),
    }

    match Expiry::deserialize(deserializer)? {
        Expiry::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("expiry out of range: {}", ms))),
        Expiry::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}
