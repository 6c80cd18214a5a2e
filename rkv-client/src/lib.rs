//! # RingKV Client
//!
//! Purpose: Execute key/value commands against a cluster of RingKV nodes
//! over the length-prefixed binary protocol, with pooled connections,
//! health tracking and retries.
//!
//! ## Design Principles
//! 1. **Layered**: framing (`rkv-common`) < connection < pool < node <
//!    cluster. Each layer only talks to the one below it.
//! 2. **Typed Commands**: Every request is a `Command` with its own result
//!    type; callers await a handle or read a stream.
//! 3. **Transport Vs Protocol**: Socket-level failures are retried on
//!    another node; server error replies are returned as they are.
//! 4. **Explicit Lifecycle**: Clusters and nodes are started and stopped
//!    explicitly, and every state change is logged with `tracing`.
//!
//! ## Usage
//!
//! ```no_run
//! use rkv_client::commands::{FetchValue, StoreValue};
//! use rkv_client::{Cluster, NodeConfig};
//!
//! # async fn demo() -> rkv_client::ClientResult<()> {
//! let cluster = Cluster::builder()
//!     .node(NodeConfig::new("10.0.0.1:8087"))
//!     .node(NodeConfig::new("10.0.0.2:8087"))
//!     .build()?;
//! cluster.start().await?;
//!
//! let (store, stored) = StoreValue::builder("users").key("alice").value("{}").build()?;
//! cluster.execute(store);
//! stored.await?;
//!
//! let (fetch, fetched) = FetchValue::builder("users", "alice").build()?;
//! cluster.execute(fetch);
//! assert!(!fetched.await?.not_found);
//!
//! cluster.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod command;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod node_manager;
pub mod pool;
pub mod tls;

pub use cluster::{Cluster, ClusterBuilder, ClusterState};
pub use command::{BoxCommand, Command, Decoded, Reply, ResponseHandle, ResponseStream, StreamReply};
pub use config::{ClusterConfig, HealthCheck, NodeConfig, ServerAddress};
pub use connection::{Connection, ConnectionState};
pub use error::{ClientError, ClientResult};
pub use node::{Node, NodeEvent, NodeState};
pub use node_manager::{NodeManager, RoundRobinNodeManager};
pub use pool::ConnectionPool;
pub use tls::{Credentials, TlsSettings};
