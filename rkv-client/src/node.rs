//! # Node
//!
//! Purpose: Represent one server. A node owns a connection pool, runs each
//! accepted command on its own task and tracks whether the server looks
//! healthy.
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED -> RUNNING <-> HEALTH_CHECKING
//!               \            /
//!                SHUTTING_DOWN -> SHUTDOWN
//! ```
//!
//! ## Design Principles
//! 1. **Accept Or Hand Back**: `execute` decides synchronously. A node that
//!    is not running, or has no free connection, returns the command so the
//!    caller can try another node. A node never retries.
//! 2. **Failures Go Upstream**: A transport failure discards the connection,
//!    flips the node to `HEALTH_CHECKING` and reports the command back to
//!    the cluster, which owns the retry decision.
//! 3. **Backoff Probes**: While unhealthy, the node probes with delays of
//!    `base * multiplier^(failures - 1)`, capped, until a probe succeeds.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use rkv_common::{Frame, MessageCode};

use crate::command::{BoxCommand, Command, Decoded};
use crate::config::{HealthCheck, NodeConfig, ServerAddress};
use crate::connection::{server_error, unexpected_response, Connection};
use crate::error::{ClientError, ClientResult};
use crate::pool::{Checkout, ConnectionPool, PooledConnection};

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Created,
    Running,
    HealthChecking,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Created => "created",
            NodeState::Running => "running",
            NodeState::HealthChecking => "health checking",
            NodeState::ShuttingDown => "shutting down",
            NodeState::Shutdown => "shut down",
        };
        f.write_str(name)
    }
}

/// Notifications a node sends to its owner.
pub enum NodeEvent {
    /// An attempt failed at the transport level; the owner decides whether
    /// to retry or fail the command.
    AttemptFailed {
        node: Arc<Node>,
        command: BoxCommand,
        error: ClientError,
    },
    /// A connection was returned to the pool.
    Available(Arc<Node>),
    StateChanged { node: Arc<Node>, state: NodeState },
}

impl fmt::Debug for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::AttemptFailed {
                node,
                command,
                error,
            } => f
                .debug_struct("AttemptFailed")
                .field("node", &node.address())
                .field("command", &command.name())
                .field("error", error)
                .finish(),
            NodeEvent::Available(node) => f.debug_tuple("Available").field(&node.address()).finish(),
            NodeEvent::StateChanged { node, state } => f
                .debug_struct("StateChanged")
                .field("node", &node.address())
                .field("state", state)
                .finish(),
        }
    }
}

/// Channel a node reports on.
pub type NodeEventSender = mpsc::UnboundedSender<NodeEvent>;

struct NodeInner {
    state: NodeState,
    consecutive_failures: u32,
    events: Option<NodeEventSender>,
    health_task: Option<JoinHandle<()>>,
    eviction_task: Option<JoinHandle<()>>,
}

/// One server and its connections.
pub struct Node {
    address: ServerAddress,
    config: Arc<NodeConfig>,
    pool: ConnectionPool,
    inner: Mutex<NodeInner>,
    span: tracing::Span,
}

/// How one exchange ended, when it did not fail at the transport level.
enum Exchange {
    Completed,
    ServerError(ClientError),
}

impl Node {
    /// Builds a node in `CREATED`; nothing is opened until `start`.
    pub fn new(config: NodeConfig) -> ClientResult<Arc<Node>> {
        config.validate()?;
        let address = config.server_address()?;
        let config = Arc::new(config);
        let span = tracing::info_span!("node", addr = %address);
        Ok(Arc::new(Node {
            pool: ConnectionPool::new(address.clone(), config.clone()),
            address,
            config,
            inner: Mutex::new(NodeInner {
                state: NodeState::Created,
                consecutive_failures: 0,
                events: None,
                health_task: None,
                eviction_task: None,
            }),
            span,
        }))
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().expect("node mutex poisoned").state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().expect("node mutex poisoned").consecutive_failures
    }

    /// Open connections, idle plus in use.
    pub fn open_connections(&self) -> usize {
        self.pool.total()
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.idle()
    }

    /// Opens the minimum connections and starts idle eviction. A server that
    /// cannot be reached puts the node straight into `HEALTH_CHECKING`;
    /// that is not an error. `events` receives failures and state changes;
    /// without it, failures go straight to the command.
    pub async fn start(self: &Arc<Self>, events: Option<NodeEventSender>) -> ClientResult<()> {
        {
            let mut inner = self.inner.lock().expect("node mutex poisoned");
            if inner.state != NodeState::Created {
                return Err(ClientError::NodeState(inner.state));
            }
            inner.events = events;
            inner.eviction_task = Some(self.spawn_eviction());
        }

        match self.pool.warm_up().instrument(self.span.clone()).await {
            Ok(()) => {
                self.transition(NodeState::Created, NodeState::Running);
            }
            Err(err) => {
                warn!(parent: &self.span, error = %err, "initial connections failed");
                self.enter_health_check(NodeState::Created);
            }
        }
        Ok(())
    }

    fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let period = self.config.idle_timeout().max(std::time::Duration::from_millis(10));
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    pool.evict_idle();
                }
            }
            .instrument(self.span.clone()),
        )
    }

    /// Tries to run `command` here. `Err` hands the command back untouched
    /// when the node is not running or has no free connection.
    pub fn execute(self: &Arc<Self>, command: BoxCommand) -> Result<(), BoxCommand> {
        if self.state() != NodeState::Running {
            return Err(command);
        }
        let checkout = match self.pool.checkout() {
            Some(checkout) => checkout,
            None => {
                debug!(parent: &self.span, command = command.name(), "pool exhausted");
                return Err(command);
            }
        };

        debug!(parent: &self.span, command = command.name(), reused = checkout.is_reused(), "command accepted");
        let node = Arc::clone(self);
        tokio::spawn(node.run(checkout, command).instrument(self.span.clone()));
        Ok(())
    }

    async fn run(self: Arc<Self>, checkout: Checkout, mut command: BoxCommand) {
        let mut conn = match checkout.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                self.attempt_failed(command, err);
                return;
            }
        };

        let outcome = match command.timeout() {
            Some(limit) => tokio::time::timeout(limit, exchange(&mut conn, command.as_mut()))
                .await
                .unwrap_or(Err(ClientError::Timeout(limit))),
            None => exchange(&mut conn, command.as_mut()).await,
        };

        match outcome {
            Ok(Exchange::Completed) => {
                drop(conn);
                self.emit(NodeEvent::Available);
            }
            Ok(Exchange::ServerError(err)) => {
                drop(conn);
                debug!(command = command.name(), error = %err, "server returned error");
                command.on_protocol_error(err);
                self.emit(NodeEvent::Available);
            }
            Err(err) => {
                conn.discard();
                drop(conn);
                self.attempt_failed(command, err);
            }
        }
    }

    fn attempt_failed(self: &Arc<Self>, command: BoxCommand, error: ClientError) {
        warn!(command = command.name(), error = %error, "attempt failed");
        self.enter_health_check(NodeState::Running);

        let events = self.inner.lock().expect("node mutex poisoned").events.clone();
        let event = NodeEvent::AttemptFailed {
            node: Arc::clone(self),
            command,
            error,
        };
        let undelivered = match events {
            Some(tx) => tx.send(event).err().map(|e| e.0),
            None => Some(event),
        };
        if let Some(NodeEvent::AttemptFailed { command, error, .. }) = undelivered {
            command.on_transport_error(error);
        }
    }

    /// Moves `from -> HEALTH_CHECKING` and starts the probe loop. No-op in
    /// any other state.
    fn enter_health_check(self: &Arc<Self>, from: NodeState) {
        {
            let mut inner = self.inner.lock().expect("node mutex poisoned");
            if inner.state != from {
                return;
            }
            inner.state = NodeState::HealthChecking;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            let node = Arc::clone(self);
            inner.health_task = Some(tokio::spawn(
                node.health_check_loop().instrument(self.span.clone()),
            ));
        }
        let dropped = self.pool.drain_idle();
        info!(parent: &self.span, dropped_idle = dropped, "node health checking");
        self.emit(|node| NodeEvent::StateChanged {
            node,
            state: NodeState::HealthChecking,
        });
    }

    async fn health_check_loop(self: Arc<Self>) {
        loop {
            let failures = self.consecutive_failures();
            let delay = self.config.health_check_delay(failures);
            tokio::time::sleep(delay).await;

            if self.state() != NodeState::HealthChecking {
                return;
            }

            match self.probe().await {
                Ok(conn) => {
                    self.pool.adopt(conn);
                    {
                        let mut inner = self.inner.lock().expect("node mutex poisoned");
                        if inner.state != NodeState::HealthChecking {
                            return;
                        }
                        inner.state = NodeState::Running;
                        inner.consecutive_failures = 0;
                        inner.health_task = None;
                    }
                    info!(failures, "node recovered");
                    self.emit(|node| NodeEvent::StateChanged {
                        node,
                        state: NodeState::Running,
                    });
                    return;
                }
                Err(err) => {
                    let mut inner = self.inner.lock().expect("node mutex poisoned");
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    debug!(failures = inner.consecutive_failures, error = %err, "health probe failed");
                }
            }
        }
    }

    async fn probe(&self) -> ClientResult<Connection> {
        let mut conn = Connection::connect(&self.address, &self.config).await?;
        if self.config.health_check == HealthCheck::Ping {
            let limit = self.config.connect_timeout();
            tokio::time::timeout(limit, conn.ping())
                .await
                .map_err(|_| ClientError::Timeout(limit))??;
        }
        Ok(conn)
    }

    /// Stops accepting commands, waits up to the shutdown timeout for
    /// in-flight ones, then closes every connection.
    pub async fn stop(self: &Arc<Self>) {
        let (health, eviction) = {
            let mut inner = self.inner.lock().expect("node mutex poisoned");
            if matches!(inner.state, NodeState::ShuttingDown | NodeState::Shutdown) {
                return;
            }
            inner.state = NodeState::ShuttingDown;
            (inner.health_task.take(), inner.eviction_task.take())
        };
        if let Some(task) = health {
            task.abort();
        }
        info!(parent: &self.span, "node shutting down");
        self.emit(|node| NodeEvent::StateChanged {
            node,
            state: NodeState::ShuttingDown,
        });

        if !self.pool.wait_idle(self.config.shutdown_timeout()).await {
            warn!(parent: &self.span, in_use = self.pool.in_use(), "shutdown timeout with commands in flight");
        }
        for mut conn in self.pool.close() {
            conn.close().await;
        }
        if let Some(task) = eviction {
            task.abort();
        }

        self.inner.lock().expect("node mutex poisoned").state = NodeState::Shutdown;
        info!(parent: &self.span, "node shut down");
        self.emit(|node| NodeEvent::StateChanged {
            node,
            state: NodeState::Shutdown,
        });
    }

    fn transition(self: &Arc<Self>, from: NodeState, to: NodeState) -> bool {
        {
            let mut inner = self.inner.lock().expect("node mutex poisoned");
            if inner.state != from {
                return false;
            }
            inner.state = to;
        }
        info!(parent: &self.span, state = %to, "node state changed");
        self.emit(|node| NodeEvent::StateChanged { node, state: to });
        true
    }

    fn emit(self: &Arc<Self>, event: impl FnOnce(Arc<Node>) -> NodeEvent) {
        let events = self.inner.lock().expect("node mutex poisoned").events.clone();
        if let Some(tx) = events {
            let _ = tx.send(event(Arc::clone(self)));
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: NodeState) {
        self.inner.lock().expect("node mutex poisoned").state = state;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("open_connections", &self.pool.total())
            .finish()
    }
}

/// Sends the request and feeds reply frames to the command until it
/// completes. `ERROR_RESP` ends the exchange without harming the
/// connection; anything unexpected is a transport failure.
async fn exchange(conn: &mut PooledConnection, command: &mut dyn Command) -> ClientResult<Exchange> {
    command.begin_attempt();
    let request = Frame::new(command.request_code(), command.encode_request());
    conn.mark_busy();
    conn.send(&request).await?;

    loop {
        let frame = conn.recv().await?;
        if frame.is(MessageCode::ErrorResp) {
            conn.mark_idle();
            return Ok(Exchange::ServerError(server_error(&frame)));
        }
        if !frame.is(command.response_code()) {
            return Err(unexpected_response(command.response_code(), &frame));
        }
        if command.decode(frame)? == Decoded::Complete {
            conn.mark_idle();
            return Ok(Exchange::Completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Ping;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn created_node_rejects_commands() {
        let node = Node::new(NodeConfig::new("127.0.0.1:1")).unwrap();
        let (ping, _response) = Ping::new();
        assert!(node.execute(Box::new(ping)).is_err());
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn unreachable_server_starts_health_checking() {
        let node = Node::new(NodeConfig::new(closed_port().await)).unwrap();
        node.start(None).await.unwrap();
        assert_eq!(node.state(), NodeState::HealthChecking);
        assert_eq!(node.consecutive_failures(), 1);
        node.stop().await;
        assert_eq!(node.state(), NodeState::Shutdown);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let node = Node::new(NodeConfig::new(closed_port().await)).unwrap();
        node.start(None).await.unwrap();
        assert!(matches!(
            node.start(None).await,
            Err(ClientError::NodeState(NodeState::HealthChecking))
        ));
        node.stop().await;
    }

    #[tokio::test]
    async fn full_pool_hands_command_back() {
        let node = Node::new(NodeConfig::new("127.0.0.1:1").with_connections(0, 1)).unwrap();
        node.force_state(NodeState::Running);
        let (first, _a) = Ping::new();
        let (second, _b) = Ping::new();
        assert!(node.execute(Box::new(first)).is_ok());
        assert!(node.execute(Box::new(second)).is_err());
    }

    #[tokio::test]
    async fn failure_without_owner_goes_to_command() {
        let node = Node::new(NodeConfig::new(closed_port().await).with_connections(0, 1)).unwrap();
        node.force_state(NodeState::Running);
        let (ping, response) = Ping::new();
        node.execute(Box::new(ping)).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), response)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(node.state(), NodeState::HealthChecking);
    }

    #[test]
    fn state_display() {
        assert_eq!(NodeState::HealthChecking.to_string(), "health checking");
    }
}
