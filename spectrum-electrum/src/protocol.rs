//! Wire protocol: newline-delimited JSON-RPC 2.0 frames.
//!
//! Requests carry a fresh random 32-bit id; responses may arrive in any
//! order and are matched back by id; notifications carry a method and no id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TransportError;

/// An outgoing request frame.
#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u32,
}

/// Encode a request as a single `json\n` line ready for the writer worker.
pub(crate) fn encode_request(
    method: &str,
    params: &Value,
    id: u32,
) -> Result<String, TransportError> {
    let req = Request {
        jsonrpc: "2.0",
        method,
        params,
        id,
    };
    let mut line = serde_json::to_string(&req)
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// An error object returned by the server in place of a result.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct ServerError {
    pub code: i64,
    pub message: String,
}

/// A server-initiated notification: a method plus params, no id.
#[derive(Clone, Debug)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// A parsed incoming frame.
#[derive(Debug)]
pub(crate) enum Message {
    Response {
        id: u32,
        result: Result<Value, ServerError>,
    },
    Notification(Notification),
}

#[derive(Deserialize)]
struct Incoming {
    id: Option<u32>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<Value>,
}

/// Parse one newline-delimited frame from the server.
pub(crate) fn parse_line(line: &str) -> Result<Message, TransportError> {
    let incoming: Incoming = serde_json::from_str(line)
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

    if let Some(id) = incoming.id {
        let result = match incoming.error {
            Some(error) => Err(parse_server_error(error)),
            None => Ok(incoming.result.unwrap_or(Value::Null)),
        };
        return Ok(Message::Response { id, result });
    }

    match incoming.method {
        Some(method) => Ok(Message::Notification(Notification {
            method,
            params: incoming.params,
        })),
        None => Err(TransportError::Protocol(
            "frame has neither id nor method".to_owned(),
        )),
    }
}

/// Servers usually send `{code, message}` but some send a bare string.
fn parse_server_error(error: Value) -> ServerError {
    match serde_json::from_value::<ServerError>(error.clone()) {
        Ok(e) => e,
        Err(_) => ServerError {
            code: -1,
            message: match error {
                Value::String(s) => s,
                other => other.to_string(),
            },
        },
    }
}
