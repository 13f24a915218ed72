//! JSON-RPC over message connections.
//!
//! - [`protocol`]: request/response wire types
//! - [`connection`]: the [`MessageConnection`] seam and its channel and
//!   in-memory implementations
//! - [`center`]: call correlation, service proxies and inbound dispatch

pub mod center;
pub mod connection;
pub mod protocol;

pub use center::{RpcHandler, RpcProxy, RpcServiceCenter};
pub use connection::{ChannelConnection, MemoryConnection, MessageConnection};
pub use protocol::{RpcErrorObject, RpcMessage, RpcRequest, RpcResponse};
