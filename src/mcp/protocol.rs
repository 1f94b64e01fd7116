//! JSON-RPC 2.0 wire envelope and stdio read-loop (§6.1): request/response/
//! error struct shapes and an `McpServer::run` blank-line-tolerant stdio
//! loop, narrowed from a general tool-call envelope (`tools/list`/
//! `tools/call`, `InitializeResult`, `ToolContent`) down to the flat
//! five-method dispatch this service actually exposes — there is no open
//! tool table to advertise, so `dispatch.rs` owns the method names directly
//! instead of routing through a `tools/call` wrapper.

use std::io::{BufRead, BufReader, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{MementoError, Result};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const APPLICATION_ERROR: i64 = -32000;

/// One JSON-RPC 2.0 request line (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One JSON-RPC 2.0 response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(McpError { code, message: message.into(), data: None }),
        }
    }

    /// Project a domain error through `MementoError::code` (§7) rather than
    /// collapsing everything to a generic application error.
    pub fn from_error(id: Option<Value>, err: MementoError) -> Self {
        Self::error(id, err.code(), err.to_string())
    }
}

/// Implemented by whatever owns the store/engine wiring for one process;
/// `dispatch.rs`'s `Dispatcher` is the only implementor.
#[async_trait::async_trait]
pub trait McpHandler: Send + Sync {
    async fn handle_request(&self, request: McpRequest) -> McpResponse;
}

/// Blocking stdin/stdout JSON-RPC server (§4.7, §6.1). Runs on a dedicated
/// blocking thread since `std::io::Stdin` has no async-cancellable read;
/// `token` is checked between lines so a cancelled run stops promptly instead
/// of only on the next line of input.
pub struct McpServer<H>
where
    H: McpHandler,
{
    handler: H,
}

impl<H: McpHandler> McpServer<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Read newline-delimited requests from stdin, dispatch each to the
    /// handler, write one response line per request to stdout. Stops cleanly
    /// on EOF or `token` cancellation (§4.7: "EOF on stdin or context
    /// cancellation stops the loop without emitting a final error").
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        let mut reader = BufReader::new(stdin.lock());
        let mut writer = stdout.lock();

        loop {
            if token.is_cancelled() {
                break;
            }

            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break; // EOF
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<McpRequest>(trimmed) {
                Ok(request) if request.jsonrpc != "2.0" => {
                    McpResponse::error(request.id, INVALID_REQUEST, "unsupported jsonrpc version")
                }
                Ok(request) => self.handler.handle_request(request).await,
                Err(err) => McpResponse::error(None, PARSE_ERROR, format!("parse error: {err}")),
            };

            let response_json = serde_json::to_string(&response)?;
            writeln!(writer, "{response_json}")?;
            writer.flush()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_has_no_error_field() {
        let resp = McpResponse::success(Some(Value::from(1)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn error_response_projects_memento_error_code() {
        let resp = McpResponse::from_error(None, MementoError::NotFound("mem:default:x".into()));
        assert_eq!(resp.error.unwrap().code, -32001);
    }

    #[test]
    fn request_without_params_defaults_to_null() {
        let req: McpRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"store_memory"}"#).unwrap();
        assert!(req.params.is_null());
    }
}
