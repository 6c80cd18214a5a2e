//! # Cluster
//!
//! Purpose: The entry point for executing commands against a set of nodes,
//! with retry on transport failures and a bounded queue for bursts that
//! exceed every node's capacity.
//!
//! ## Design Principles
//! 1. **Single Owner**: The node list, the selection cursor and the pending
//!    queue belong to one actor task. `Cluster` is a cheap handle that talks
//!    to it over channels, so none of that state needs a lock.
//! 2. **Retry Elsewhere**: A transport failure spends one try and the
//!    command is offered again, never to the node that just failed while
//!    another exists. Protocol errors are final.
//! 3. **Bounded Backlog**: Commands no node can take are parked up to
//!    `queue_capacity`; beyond that the caller gets `QueueFull` at once.
//! 4. **Observable Lifecycle**: State changes are published on a `watch`
//!    channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn, Instrument};

use crate::command::{BoxCommand, Command};
use crate::config::{ClusterConfig, NodeConfig, ServerAddress};
use crate::error::{ClientError, ClientResult};
use crate::node::{Node, NodeEvent, NodeEventSender, NodeState};
use crate::node_manager::{NodeManager, RoundRobinNodeManager};

/// Cluster lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Created => "created",
            ClusterState::Running => "running",
            ClusterState::ShuttingDown => "shutting down",
            ClusterState::Shutdown => "shut down",
        };
        f.write_str(name)
    }
}

enum ClusterRequest {
    Execute(BoxCommand),
    AddNode(Arc<Node>, oneshot::Sender<bool>),
    RemoveNode(ServerAddress, oneshot::Sender<Option<Arc<Node>>>),
    Nodes(oneshot::Sender<Vec<Arc<Node>>>),
    Stop(oneshot::Sender<()>),
}

/// Builder for `Cluster`.
pub struct ClusterBuilder {
    nodes: Vec<NodeConfig>,
    execution_attempts: u32,
    queue_capacity: usize,
    queue_submit_interval: Duration,
    node_manager: Box<dyn NodeManager>,
}

impl ClusterBuilder {
    fn from_config(config: ClusterConfig) -> Self {
        ClusterBuilder {
            queue_submit_interval: config.queue_submit_interval(),
            nodes: config.nodes,
            execution_attempts: config.execution_attempts,
            queue_capacity: config.queue_capacity,
            node_manager: Box::new(RoundRobinNodeManager::new()),
        }
    }

    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = NodeConfig>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Tries granted to commands that do not set their own.
    pub fn execution_attempts(mut self, attempts: u32) -> Self {
        self.execution_attempts = attempts;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn queue_submit_interval(mut self, interval: Duration) -> Self {
        self.queue_submit_interval = interval;
        self
    }

    pub fn node_manager(mut self, manager: impl NodeManager) -> Self {
        self.node_manager = Box::new(manager);
        self
    }

    pub fn build(self) -> ClientResult<Cluster> {
        if self.execution_attempts == 0 {
            return Err(ClientError::InvalidArgument(
                "execution_attempts must be at least 1".into(),
            ));
        }
        let nodes = self
            .nodes
            .into_iter()
            .map(Node::new)
            .collect::<ClientResult<Vec<_>>>()?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClusterState::Created);

        let actor = ClusterActor {
            nodes,
            node_manager: self.node_manager,
            queue: VecDeque::new(),
            queue_capacity: self.queue_capacity,
            queue_submit_interval: self.queue_submit_interval,
            execution_attempts: self.execution_attempts,
            state: state_tx,
            requests: requests_rx,
            events: events_rx,
            events_tx: events_tx.clone(),
        };

        Ok(Cluster {
            requests: requests_tx,
            state: state_rx,
            pending: Mutex::new(Some(actor)),
            task: Mutex::new(None),
        })
    }
}

/// Handle to a cluster of nodes.
pub struct Cluster {
    requests: mpsc::UnboundedSender<ClusterRequest>,
    state: watch::Receiver<ClusterState>,
    /// The actor until `start` moves it onto its task.
    pending: Mutex<Option<ClusterActor>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::from_config(ClusterConfig::default())
    }

    /// Builds a cluster from a loaded configuration.
    pub fn from_config(config: ClusterConfig) -> ClientResult<Self> {
        config.validate()?;
        ClusterBuilder::from_config(config).build()
    }

    pub fn state(&self) -> ClusterState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ClusterState> {
        self.state.clone()
    }

    /// Starts every node and begins accepting commands. Nodes that cannot be
    /// reached start in `HEALTH_CHECKING`.
    pub async fn start(&self) -> ClientResult<()> {
        let actor = self
            .pending
            .lock()
            .expect("cluster mutex poisoned")
            .take()
            .ok_or_else(|| ClientError::ClusterState(self.state()))?;

        let mut starting = JoinSet::new();
        for node in &actor.nodes {
            let node = Arc::clone(node);
            let events = actor.events_tx.clone();
            starting.spawn(async move { node.start(Some(events)).await });
        }
        while let Some(joined) = starting.join_next().await {
            if let Ok(Err(err)) = joined {
                warn!(error = %err, "node failed to start");
            }
        }

        actor.set_state(ClusterState::Running);
        info!(nodes = actor.nodes.len(), "cluster running");
        let handle = tokio::spawn(actor.run().instrument(tracing::info_span!("cluster")));
        *self.task.lock().expect("cluster mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Submits a command. Outcomes are delivered through the command's own
    /// response handle; a cluster that is not running fails it at once.
    pub fn execute(&self, command: impl Command) {
        self.execute_boxed(Box::new(command));
    }

    pub fn execute_boxed(&self, command: BoxCommand) {
        let state = self.state();
        if state != ClusterState::Running {
            command.on_transport_error(ClientError::ClusterState(state));
            return;
        }
        if let Err(mpsc::error::SendError(ClusterRequest::Execute(command))) =
            self.requests.send(ClusterRequest::Execute(command))
        {
            command.on_transport_error(ClientError::ClusterState(self.state()));
        }
    }

    /// Adds and starts a node. Returns false if a node with the same address
    /// is already present.
    pub async fn add_node(&self, config: NodeConfig) -> ClientResult<bool> {
        let node = Node::new(config)?;
        let inserted = self
            .pending
            .lock()
            .expect("cluster mutex poisoned")
            .as_mut()
            .map(|actor| actor.insert_node(Arc::clone(&node)));
        if let Some(inserted) = inserted {
            return Ok(inserted);
        }

        let (tx, rx) = oneshot::channel();
        self.requests
            .send(ClusterRequest::AddNode(node, tx))
            .map_err(|_| ClientError::ClusterState(self.state()))?;
        rx.await.map_err(|_| ClientError::ClusterState(self.state()))
    }

    /// Removes the node at `address` and stops it. Returns false when no such
    /// node exists.
    pub async fn remove_node(&self, address: &ServerAddress) -> ClientResult<bool> {
        let removed = self
            .pending
            .lock()
            .expect("cluster mutex poisoned")
            .as_mut()
            .map(|actor| actor.take_node(address));
        let removed = match removed {
            Some(removed) => removed,
            None => {
                let (tx, rx) = oneshot::channel();
                self.requests
                    .send(ClusterRequest::RemoveNode(address.clone(), tx))
                    .map_err(|_| ClientError::ClusterState(self.state()))?;
                rx.await.map_err(|_| ClientError::ClusterState(self.state()))?
            }
        };

        match removed {
            Some(node) => {
                node.stop().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of the current nodes.
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        let snapshot = self
            .pending
            .lock()
            .expect("cluster mutex poisoned")
            .as_ref()
            .map(|actor| actor.nodes.clone());
        if let Some(nodes) = snapshot {
            return nodes;
        }
        let (tx, rx) = oneshot::channel();
        if self.requests.send(ClusterRequest::Nodes(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Fails queued commands, stops every node (waiting for in-flight
    /// commands up to each node's shutdown timeout) and ends in `SHUTDOWN`.
    pub async fn stop(&self) {
        let never_started = self.pending.lock().expect("cluster mutex poisoned").take();
        if let Some(actor) = never_started {
            actor.set_state(ClusterState::ShuttingDown);
            actor.set_state(ClusterState::Shutdown);
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.requests.send(ClusterRequest::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().expect("cluster mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Waits until the cluster reaches `target`.
    pub async fn wait_for_state(&self, target: ClusterState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

/// A queued command and the node its last attempt failed on.
struct Parked {
    command: BoxCommand,
    previous: Option<ServerAddress>,
}

struct ClusterActor {
    nodes: Vec<Arc<Node>>,
    node_manager: Box<dyn NodeManager>,
    queue: VecDeque<Parked>,
    queue_capacity: usize,
    queue_submit_interval: Duration,
    execution_attempts: u32,
    state: watch::Sender<ClusterState>,
    requests: mpsc::UnboundedReceiver<ClusterRequest>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    events_tx: NodeEventSender,
}

impl ClusterActor {
    fn current(&self) -> ClusterState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ClusterState) {
        if self.current() != state {
            info!(state = %state, "cluster state changed");
            self.state.send_replace(state);
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.queue_submit_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(ClusterRequest::Stop(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(request) => self.handle_request(request),
                    // Every handle is gone.
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = ticker.tick() => self.drain_queue(),
            }
        }
    }

    fn handle_request(&mut self, request: ClusterRequest) {
        match request {
            ClusterRequest::Execute(command) => self.submit(command),
            ClusterRequest::AddNode(node, reply) => {
                let _ = reply.send(self.insert_node(node));
            }
            ClusterRequest::RemoveNode(address, reply) => {
                let _ = reply.send(self.take_node(&address));
            }
            ClusterRequest::Nodes(reply) => {
                let _ = reply.send(self.nodes.clone());
            }
            ClusterRequest::Stop(done) => {
                let _ = done.send(());
            }
        }
    }

    fn insert_node(&mut self, node: Arc<Node>) -> bool {
        if self.nodes.iter().any(|n| n.address() == node.address()) {
            return false;
        }
        info!(node = %node.address(), "node added");
        self.nodes.push(Arc::clone(&node));

        if self.current() == ClusterState::Running {
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = node.start(Some(events)).await {
                    warn!(node = %node.address(), error = %err, "node failed to start");
                }
            });
        }
        true
    }

    fn take_node(&mut self, address: &ServerAddress) -> Option<Arc<Node>> {
        let index = self.nodes.iter().position(|n| n.address() == address)?;
        info!(node = %address, "node removed");
        Some(self.nodes.remove(index))
    }

    fn submit(&mut self, mut command: BoxCommand) {
        if self.current() != ClusterState::Running {
            command.on_transport_error(ClientError::ClusterState(self.current()));
            return;
        }
        if command.is_cancelled() {
            debug!(command = command.name(), "dropping cancelled command");
            return;
        }
        if command.remaining_tries().is_none() {
            command.set_remaining_tries(self.execution_attempts);
        }

        // Earlier arrivals keep their place in line.
        if !self.queue.is_empty() {
            self.enqueue(command, None, ClientError::NoNodesAvailable);
            self.drain_queue();
            return;
        }

        if let Err(command) = self.dispatch(command, None) {
            self.enqueue(command, None, ClientError::NoNodesAvailable);
        }
    }

    fn dispatch(&mut self, command: BoxCommand, previous: Option<&Arc<Node>>) -> Result<(), BoxCommand> {
        let name = command.name();
        let node = self
            .node_manager
            .execute_on_node(&self.nodes, command, previous)?;
        debug!(command = name, node = %node.address(), "dispatched");
        Ok(())
    }

    /// Parks a command nobody could take, or fails it with `fallback` when
    /// queueing is disabled. `previous` is the node its last attempt failed
    /// on, avoided again when the command is drained.
    fn enqueue(&mut self, command: BoxCommand, previous: Option<ServerAddress>, fallback: ClientError) {
        if self.queue_capacity == 0 {
            command.on_transport_error(fallback);
            return;
        }
        if self.queue.len() >= self.queue_capacity {
            warn!(capacity = self.queue_capacity, command = command.name(), "command queue full");
            command.on_transport_error(ClientError::QueueFull(self.queue_capacity));
            return;
        }
        debug!(command = command.name(), queued = self.queue.len() + 1, "command queued");
        self.queue.push_back(Parked { command, previous });
    }

    fn drain_queue(&mut self) {
        while let Some(Parked { command, previous }) = self.queue.pop_front() {
            if command.is_cancelled() {
                continue;
            }
            let failed_on = previous
                .as_ref()
                .and_then(|addr| self.nodes.iter().find(|n| n.address() == addr))
                .cloned();
            if let Err(command) = self.dispatch(command, failed_on.as_ref()) {
                self.queue.push_front(Parked { command, previous });
                break;
            }
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::AttemptFailed {
                node,
                command,
                error,
            } => self.retry(node, command, error),
            NodeEvent::Available(_) => self.drain_queue(),
            NodeEvent::StateChanged { node, state } => {
                debug!(node = %node.address(), state = %state, "node state changed");
                if state == NodeState::Running {
                    self.drain_queue();
                }
            }
        }
    }

    fn retry(&mut self, node: Arc<Node>, mut command: BoxCommand, error: ClientError) {
        let left = command.remaining_tries().unwrap_or(1).saturating_sub(1);
        command.set_remaining_tries(left);

        if self.current() != ClusterState::Running
            || left == 0
            || (command.is_streaming() && command.delivered_partial())
            || command.is_cancelled()
        {
            debug!(command = command.name(), error = %error, "attempts exhausted");
            command.on_transport_error(error);
            return;
        }

        debug!(command = command.name(), failed = %node.address(), remaining = left, "retrying");
        if let Err(command) = self.dispatch(command, Some(&node)) {
            self.enqueue(command, Some(node.address().clone()), error);
        }
    }

    async fn shutdown(&mut self) {
        self.set_state(ClusterState::ShuttingDown);

        let pending = self.queue.len();
        for Parked { command, .. } in self.queue.drain(..) {
            command.on_transport_error(ClientError::ClusterState(ClusterState::ShuttingDown));
        }
        if pending > 0 {
            info!(pending, "failed queued commands on shutdown");
        }

        let mut stopping = JoinSet::new();
        for node in &self.nodes {
            let node = Arc::clone(node);
            stopping.spawn(async move { node.stop().await });
        }
        // Attempts that fail while nodes drain are surfaced, not retried.
        loop {
            tokio::select! {
                joined = stopping.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }

        self.set_state(ClusterState::Shutdown);
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            match request {
                ClusterRequest::Execute(command) => {
                    command.on_transport_error(ClientError::ClusterState(ClusterState::Shutdown))
                }
                other => self.handle_request(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Ping;

    #[tokio::test]
    async fn execute_before_start_fails_fast() {
        let cluster = Cluster::builder().build().unwrap();
        let (ping, response) = Ping::new();
        cluster.execute(ping);
        assert!(matches!(
            response.await,
            Err(ClientError::ClusterState(ClusterState::Created))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let cluster = Cluster::builder().build().unwrap();
        cluster.start().await.unwrap();
        assert_eq!(cluster.state(), ClusterState::Running);
        assert!(matches!(
            cluster.start().await,
            Err(ClientError::ClusterState(ClusterState::Running))
        ));
        cluster.stop().await;
        assert_eq!(cluster.state(), ClusterState::Shutdown);
    }

    #[tokio::test]
    async fn no_nodes_and_no_queue_fails_command() {
        let cluster = Cluster::builder().build().unwrap();
        cluster.start().await.unwrap();
        let (ping, response) = Ping::new();
        cluster.execute(ping);
        assert!(matches!(response.await, Err(ClientError::NoNodesAvailable)));
        cluster.stop().await;
    }

    #[tokio::test]
    async fn zero_attempts_is_rejected() {
        assert!(matches!(
            Cluster::builder().execution_attempts(0).build(),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_address_is_not_added() {
        let cluster = Cluster::builder()
            .node(NodeConfig::new("127.0.0.1:10001"))
            .build()
            .unwrap();
        assert!(!cluster.add_node(NodeConfig::new("127.0.0.1:10001")).await.unwrap());
        assert!(cluster.add_node(NodeConfig::new("127.0.0.1:10002")).await.unwrap());
        assert_eq!(cluster.nodes().await.len(), 2);
        let removed = cluster
            .remove_node(&ServerAddress::new("127.0.0.1", 10001))
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(cluster.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_without_start_ends_shut_down() {
        let cluster = Cluster::builder().build().unwrap();
        cluster.stop().await;
        assert_eq!(cluster.state(), ClusterState::Shutdown);
    }
}
