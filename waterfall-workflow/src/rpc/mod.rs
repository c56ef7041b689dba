//! Workflow RPC: versions, messages, transport, client and dispatcher.
//!
//! `cast` is fire-and-forget and `call` waits for a reply. Every envelope
//! carries its protocol version so mixed-version fleets keep working
//! during a rolling upgrade.

mod client;
mod message;
mod server;
mod transport;
mod version;

pub use client::WorkflowRpcClient;
pub use message::{RpcEnvelope, WorkflowReply, WorkflowRequest};
pub use server::WorkflowDispatcher;
pub use transport::{LocalTransport, RpcChannel, RpcEndpoint, DEFAULT_CALL_TIMEOUT};
pub use version::RpcVersion;
