//! # Client Errors
//!
//! One error type for the whole client. The variants fall into the groups
//! the cluster uses to decide what happens to a command:
//!
//! - transport (socket, framing, timeout, TLS): the node is suspect, the
//!   connection is discarded and the command may be retried elsewhere;
//! - protocol (`Server`): the server answered with an error, never retried;
//! - capacity (`NoNodesAvailable`, `QueueFull`);
//! - lifecycle and validation (`ClusterState`, `NodeState`, `InvalidArgument`).

use std::time::Duration;

use thiserror::Error;

use rkv_common::FrameError;

use crate::cluster::ClusterState;
use crate::node::NodeState;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish a TCP connection.
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Stream could not be split into frames.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// Peer closed the socket mid-exchange.
    #[error("connection closed by peer")]
    Closed,

    /// Deadline expired; the connection state is indeterminate.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// TLS handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Server returned an error reply.
    #[error("server error ({code}): {message}")]
    Server { code: u32, message: String },

    /// Response code did not match the command.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    /// Response payload could not be decoded.
    #[error("payload decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// No node could accept the command.
    #[error("no node available to execute command")]
    NoNodesAvailable,

    /// The pending-command queue is at capacity.
    #[error("command queue full (capacity {0})")]
    QueueFull(usize),

    /// The cluster is not accepting commands in its current state.
    #[error("cluster is {0}")]
    ClusterState(ClusterState),

    /// The node is not in a state that allows the operation.
    #[error("node is {0}")]
    NodeState(NodeState),

    /// The response receiver went away before the command finished.
    #[error("command cancelled")]
    Cancelled,

    /// Command options failed validation at build time.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl ClientError {
    /// True for failures that say something about the connection or node
    /// rather than about the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Connect { .. }
                | ClientError::Framing(_)
                | ClientError::Closed
                | ClientError::Timeout(_)
                | ClientError::Tls(_)
                | ClientError::UnexpectedResponse { .. }
                | ClientError::Decode(_)
        )
    }

    /// True when the server explicitly answered with an error.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ClientError::Server { .. })
    }
}
