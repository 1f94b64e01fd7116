//! JSON-RPC stdio front end (§4.7, §6.1): wire envelope + dispatcher for the
//! five methods the stdio front end exposes.

pub mod dispatch;
pub mod protocol;

pub use dispatch::Dispatcher;
pub use protocol::{McpError, McpHandler, McpRequest, McpResponse, McpServer};
