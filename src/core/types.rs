use crate::core::errors::GremlinError;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Elements returned for one traversal, in arrival order
pub type Traversers = Vec<Value>;

/// URL and headers produced by signing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl SignedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Correlation token between a submitted traversal and its response frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Status block of a server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub code: u16,
    pub message: Option<String>,
}

/// Decoded server message
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    /// Absent when the server could not attribute the message to a request
    pub request_id: Option<String>,
    pub status: Option<ResponseStatus>,
    pub data: Vec<Value>,
}

/// Server status codes with dedicated handling
pub mod status {
    pub const SUCCESS: u16 = 200;
    pub const NO_CONTENT: u16 = 204;
    pub const PARTIAL_CONTENT: u16 = 206;
    /// First code treated as a failure
    pub const FAILURE_THRESHOLD: u16 = 400;
}

/// Lifecycle of the single logical socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed(GremlinError),
}

impl ConnectionState {
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Notifications broadcast to application observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected { reason: String },
    Failed(GremlinError),
    Closed,
}

/// One bytecode instruction: an operator followed by GraphSON-typed arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub operator: String,
    pub arguments: Vec<Value>,
}

impl Serialize for Instruction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.arguments.len() + 1))?;
        seq.serialize_element(&self.operator)?;
        for argument in &self.arguments {
            seq.serialize_element(argument)?;
        }
        seq.end()
    }
}

/// Minimal traversal bytecode container.
///
/// Arguments are passed through verbatim, so numbers and other typed values
/// must already be in GraphSON form (see [`Bytecode::typed`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub source: Vec<Instruction>,
    pub step: Vec<Instruction>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_source(mut self, operator: &str, arguments: Vec<Value>) -> Self {
        self.source.push(Instruction {
            operator: operator.to_string(),
            arguments,
        });
        self
    }

    #[must_use]
    pub fn add_step(mut self, operator: &str, arguments: Vec<Value>) -> Self {
        self.step.push(Instruction {
            operator: operator.to_string(),
            arguments,
        });
        self
    }

    /// Wrap a value in a GraphSON type envelope, e.g. `typed("g:Int32", json!(10))`
    pub fn typed(graphson_type: &str, value: Value) -> Value {
        json!({ "@type": graphson_type, "@value": value })
    }

    /// GraphSON v2 `g:Bytecode` representation
    pub fn to_graphson(&self) -> Result<Value, GremlinError> {
        let mut body = serde_json::Map::new();
        if !self.source.is_empty() {
            body.insert("source".to_string(), serde_json::to_value(&self.source)?);
        }
        if !self.step.is_empty() {
            body.insert("step".to_string(), serde_json::to_value(&self.step)?);
        }
        Ok(json!({ "@type": "g:Bytecode", "@value": body }))
    }
}
