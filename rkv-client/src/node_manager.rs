//! Node selection.
//!
//! The cluster asks its `NodeManager` to place each command. The manager
//! offers the command to nodes in its own order until one accepts it, and
//! gives it back when none does.

use std::sync::Arc;

use tracing::trace;

use crate::command::BoxCommand;
use crate::node::{Node, NodeState};

/// Chooses which node runs a command.
pub trait NodeManager: Send + 'static {
    /// Offers `command` to `nodes` and returns the node that accepted it.
    ///
    /// `previous` is the node a failed attempt ran on. With more than one
    /// node it must not be picked again; with a single node it may be.
    fn execute_on_node(
        &mut self,
        nodes: &[Arc<Node>],
        command: BoxCommand,
        previous: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, BoxCommand>;
}

/// Round robin with a cursor that persists across calls.
///
/// Each call makes at most one pass over the nodes, starting at the cursor
/// and wrapping. The cursor advances past every node offered the command,
/// so successive commands spread across the cluster.
#[derive(Debug, Default)]
pub struct RoundRobinNodeManager {
    cursor: usize,
}

impl RoundRobinNodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next call starts from.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl NodeManager for RoundRobinNodeManager {
    fn execute_on_node(
        &mut self,
        nodes: &[Arc<Node>],
        mut command: BoxCommand,
        previous: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, BoxCommand> {
        let count = nodes.len();
        for _ in 0..count {
            if self.cursor >= count {
                self.cursor = 0;
            }
            let node = &nodes[self.cursor];
            self.cursor += 1;

            if count > 1 && previous.is_some_and(|prev| Arc::ptr_eq(prev, node)) {
                trace!(node = %node.address(), "skipping node of failed attempt");
                continue;
            }
            if node.state() != NodeState::Running {
                continue;
            }
            match node.execute(command) {
                Ok(()) => return Ok(Arc::clone(node)),
                Err(returned) => command = returned,
            }
        }
        Err(command)
    }
}
