//! JSON-RPC 2.0 channel over Content-Length framed byte streams.
//!
//! This module provides the RPC boundary between the coordinator and the
//! formatting worker process:
//!
//! ```text
//! ┌─────────────────┐          byte stream          ┌─────────────────────┐
//! │   Coordinator   │ ◄────────────────────────────►│  formatting worker  │
//! │   (RpcChannel)  │    JSON-RPC 2.0 + framing     │   (external process)│
//! └─────────────────┘                               └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"protocolVersion":"2.0","method":"hasConfig","id":1}
//! ```
//!
//! The channel is symmetric: it serves inbound requests through a mutable
//! handler registry and issues outbound calls through
//! [`RpcHandle::request`] / [`RpcHandle::notify`].

mod channel;
mod message;

pub use channel::{Handler, Registration, RpcChannel, RpcError, RpcHandle};
pub use message::{
    error_response, success_response, validate_call, ErrorObject, Validated, INTERNAL_ERROR,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
