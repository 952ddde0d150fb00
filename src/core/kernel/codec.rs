use crate::core::errors::GremlinError;
use crate::core::types::{Bytecode, RequestId, ResponseFrame, ResponseStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Codec trait for the traversal serialization format
///
/// The connection treats queries and result elements as opaque: the codec turns
/// a query into the JSON placed under `args.gremlin`, and turns raw socket
/// payloads into [`ResponseFrame`]s.
pub trait QueryCodec: Send + Sync + 'static {
    /// The query type accepted by `submit`
    type Query: Send;

    /// Encode a query into its wire representation
    fn encode_query(&self, query: &Self::Query) -> Result<Value, GremlinError>;

    /// Decode one inbound socket payload
    fn decode_frame(&self, payload: &[u8]) -> Result<ResponseFrame, GremlinError>;
}

/// GraphSON v2 codec for [`Bytecode`] traversals
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphSonCodec;

impl QueryCodec for GraphSonCodec {
    type Query = Bytecode;

    fn encode_query(&self, query: &Bytecode) -> Result<Value, GremlinError> {
        query.to_graphson()
    }

    fn decode_frame(&self, payload: &[u8]) -> Result<ResponseFrame, GremlinError> {
        let raw: RawResponse = serde_json::from_slice(payload)
            .map_err(|e| GremlinError::MalformedResponse(format!("invalid JSON: {}", e)))?;

        let request_id = raw.request_id.and_then(|id| match id {
            Value::String(id) => Some(id),
            Value::Object(mut typed) => match typed.remove("@value") {
                Some(Value::String(id)) => Some(id),
                _ => None,
            },
            _ => None,
        });

        let status = raw.status.map(|status| ResponseStatus {
            code: status.code,
            message: status.message.filter(|m| !m.is_empty()),
        });

        let data = match raw.result.and_then(|result| result.data) {
            None | Some(Value::Null) => Vec::new(),
            Some(data) => unwrap_list(data),
        };

        Ok(ResponseFrame {
            request_id,
            status,
            data,
        })
    }
}

/// Flatten a result payload into its elements, unwrapping a `g:List` envelope
fn unwrap_list(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Object(mut typed)
            if typed.get("@type").and_then(Value::as_str) == Some("g:List") =>
        {
            match typed.remove("@value") {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![other],
            }
        }
        other => vec![other],
    }
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(rename = "requestId")]
    request_id: Option<Value>,
    status: Option<RawStatus>,
    result: Option<RawResult>,
}

#[derive(Deserialize)]
struct RawStatus {
    code: u16,
    message: Option<String>,
}

#[derive(Deserialize)]
struct RawResult {
    data: Option<Value>,
}

/// Request envelope sent for every submitted traversal
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    #[serde(rename = "requestId")]
    request_id: TypedUuid,
    op: &'static str,
    processor: &'static str,
    args: RequestArgs<'a>,
}

#[derive(Debug, Serialize)]
struct TypedUuid {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@value")]
    value: String,
}

#[derive(Debug, Serialize)]
struct RequestArgs<'a> {
    gremlin: &'a Value,
    aliases: Aliases<'a>,
}

#[derive(Debug, Serialize)]
struct Aliases<'a> {
    g: &'a str,
}

impl<'a> RequestEnvelope<'a> {
    pub fn bytecode(request_id: RequestId, gremlin: &'a Value, traversal_source: &'a str) -> Self {
        Self {
            request_id: TypedUuid {
                kind: "g:UUID",
                value: request_id.to_string(),
            },
            op: "bytecode",
            processor: "traversal",
            args: RequestArgs {
                gremlin,
                aliases: Aliases {
                    g: traversal_source,
                },
            },
        }
    }
}

/// Frame an envelope as `[len(mime)] ++ mime ++ json`
pub fn frame_request(mime_type: &str, envelope: &RequestEnvelope<'_>) -> Result<Vec<u8>, GremlinError> {
    let mime_len = u8::try_from(mime_type.len()).map_err(|_| {
        GremlinError::SerializationError(format!(
            "mime type is {} bytes, at most 255 fit the header",
            mime_type.len()
        ))
    })?;

    let body = serde_json::to_vec(envelope)?;
    let mut frame = Vec::with_capacity(1 + mime_type.len() + body.len());
    frame.push(mime_len);
    frame.extend_from_slice(mime_type.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}
