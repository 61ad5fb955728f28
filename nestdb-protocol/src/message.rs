//! JSON records exchanged between clients and the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Actions understood by the command dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    // Handshake
    Init,

    // Store reads and writes
    Set,
    Get,
    GetRange,
    GetAll,
    Count,
    Add,
    Concat,
    Remove,
    RemoveRange,
    RemoveAll,
    Pop,
    HasKey,

    // Expiry
    Expire,
    Unexpire,
    GetExpiry,

    // Scripts
    RegisterDeathQuery,
    Run,

    // Events
    Watch,
    WatchExclusive,
    Unwatch,
    IsWatching,
    Broadcast,
}

impl Action {
    /// Every action in the catalog.
    pub const ALL: [Action; 23] = [
        Action::Init,
        Action::Set,
        Action::Get,
        Action::GetRange,
        Action::GetAll,
        Action::Count,
        Action::Add,
        Action::Concat,
        Action::Remove,
        Action::RemoveRange,
        Action::RemoveAll,
        Action::Pop,
        Action::HasKey,
        Action::Expire,
        Action::Unexpire,
        Action::GetExpiry,
        Action::RegisterDeathQuery,
        Action::Run,
        Action::Watch,
        Action::WatchExclusive,
        Action::Unwatch,
        Action::IsWatching,
        Action::Broadcast,
    ];

    /// Looks up an action by its wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == name)
    }

    /// Returns the wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Init => "init",
            Action::Set => "set",
            Action::Get => "get",
            Action::GetRange => "getRange",
            Action::GetAll => "getAll",
            Action::Count => "count",
            Action::Add => "add",
            Action::Concat => "concat",
            Action::Remove => "remove",
            Action::RemoveRange => "removeRange",
            Action::RemoveAll => "removeAll",
            Action::Pop => "pop",
            Action::HasKey => "hasKey",
            Action::Expire => "expire",
            Action::Unexpire => "unexpire",
            Action::GetExpiry => "getExpiry",
            Action::RegisterDeathQuery => "registerDeathQuery",
            Action::Run => "run",
            Action::Watch => "watch",
            Action::WatchExclusive => "watchExclusive",
            Action::Unwatch => "unwatch",
            Action::IsWatching => "isWatching",
            Action::Broadcast => "broadcast",
        }
    }

    /// Returns whether the `noAck` flag suppresses the response for this action.
    pub fn honors_no_ack(&self) -> bool {
        matches!(
            self,
            Action::Remove | Action::RemoveRange | Action::RemoveAll | Action::Pop | Action::Run
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound command record: `{id, action, ...action-specific fields}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id, echoed on the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Action name. Kept as a string so unknown actions can still be gated.
    #[serde(default)]
    pub action: String,

    /// Remaining fields of the record.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(id: impl Into<Value>, action: Action) -> Self {
        Self {
            id: Some(id.into()),
            action: action.as_str().to_string(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns the parsed action, or `None` if it is not in the catalog.
    pub fn parsed_action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Returns the parameters as a JSON object value.
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Returns whether the client asked for no acknowledgement.
    pub fn no_ack(&self) -> bool {
        self.params
            .get("noAck")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Response record: `{id, type: "response", action, value?, event?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Record type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Action name as received.
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Event path echoed by the watch family and broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn new(id: Option<Value>, action: impl Into<String>) -> Self {
        Self {
            id,
            msg_type: "response".to_string(),
            action: action.into(),
            value: None,
            event: None,
            error: None,
        }
    }

    /// Builds a response correlated with `request`.
    pub fn to(request: &Request) -> Self {
        Self::new(request.id.clone(), request.action.clone())
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Sets the value only when one is present.
    pub fn with_optional_value(mut self, value: Option<Value>) -> Self {
        self.value = value;
        self
    }

    pub fn with_event(mut self, event: Option<Value>) -> Self {
        self.event = event;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Unsolicited event record pushed to subscribers: `{type: "event", event, value}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    /// Record type, always "event".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Event path as the broadcaster sent it.
    pub event: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl EventNotification {
    pub fn new(event: Value, value: Option<Value>) -> Self {
        Self {
            msg_type: "event".to_string(),
            event,
            value,
        }
    }
}

// ============================================================================
// Action-specific parameter types
// ============================================================================

/// Parameters for `init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Parameters for single-key reads (`get`, `count`, `hasKey`, `getExpiry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyParams {
    pub key: Value,
}

/// Parameters for `set`, `add` and `concat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub get_value: bool,
}

/// Parameters for `getRange` and `removeRange`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeParams {
    pub key: Value,
    #[serde(default)]
    pub from_index: Option<usize>,
    #[serde(default)]
    pub to_index: Option<usize>,
    #[serde(default)]
    pub get_value: bool,
}

/// Parameters for `remove` and `pop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveParams {
    pub key: Value,
    #[serde(default)]
    pub get_value: bool,
}

/// Parameters for `expire`. `value` is the time-to-live in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireParams {
    pub keys: Vec<Value>,
    pub value: u64,
}

/// Parameters for `unexpire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysParams {
    pub keys: Vec<Value>,
}

/// Parameters for `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    /// Script source.
    pub value: String,
    #[serde(default)]
    pub base_key: Option<Value>,
}

/// Parameters for `registerDeathQuery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeathQueryParams {
    /// Script source run when the connection closes.
    pub value: String,
}

/// Parameters for `watch`, `watchExclusive` and `isWatching`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchParams {
    pub event: Value,
}

/// Parameters for `unwatch`. Without an event every subscription is dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnwatchParams {
    #[serde(default)]
    pub event: Option<Value>,
}

/// Parameters for `broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastParams {
    pub event: Value,
    #[serde(default)]
    pub value: Option<Value>,
}
