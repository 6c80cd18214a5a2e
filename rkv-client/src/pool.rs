//! # Connection Pool
//!
//! Purpose: Keep a bounded set of reusable connections to one server so
//! commands skip the TCP (and TLS) handshake.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections are reused before new ones
//!    are opened; `total` counts idle plus in-use and never exceeds the max.
//! 2. **Minimal Locking**: The mutex is held only to move connections and
//!    adjust counters, never across an await.
//! 3. **Fail Fast**: `checkout` never waits for capacity. A full pool
//!    answers `None` and the caller picks another node.
//! 4. **RAII Slots**: A reserved slot or a checked-out connection is given
//!    back exactly once, when its guard drops.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::{NodeConfig, ServerAddress};
use crate::connection::Connection;
use crate::error::ClientResult;

struct PoolState {
    /// Most recently used first; eviction works from the back.
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    addr: ServerAddress,
    config: Arc<NodeConfig>,
    state: Mutex<PoolState>,
    released: Notify,
}

/// Connection pool handle for one node.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(addr: ServerAddress, config: Arc<NodeConfig>) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_connections),
            total: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                addr,
                config,
                state: Mutex::new(state),
                released: Notify::new(),
            }),
        }
    }

    /// Takes an idle connection or reserves a slot for a new one, without
    /// waiting. `None` means the pool is at its maximum or closed.
    pub fn checkout(&self) -> Option<Checkout> {
        if let Some(conn) = self.pop_idle() {
            return Some(Checkout {
                pool: self.clone(),
                conn: Some(conn),
                reserved: false,
            });
        }

        if !self.try_reserve() {
            return None;
        }
        Some(Checkout {
            pool: self.clone(),
            conn: None,
            reserved: true,
        })
    }

    /// Opens connections until `min_connections` are open.
    pub async fn warm_up(&self) -> ClientResult<()> {
        while self.total() < self.inner.config.min_connections {
            if !self.try_reserve() {
                break;
            }
            match Connection::connect(&self.inner.addr, &self.inner.config).await {
                Ok(conn) => self.return_connection(conn),
                Err(err) => {
                    self.release_slot();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Adds a connection opened outside the pool, e.g. by a health probe.
    /// Dropped if the pool is full or closed.
    pub fn adopt(&self, conn: Connection) {
        if self.try_reserve() {
            self.return_connection(conn);
        }
    }

    fn pop_idle(&self) -> Option<Connection> {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        while let Some(conn) = state.idle.pop_front() {
            if !conn.is_closed() {
                return Some(conn);
            }
            state.total = state.total.saturating_sub(1);
        }
        None
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if state.closed || state.total >= self.inner.config.max_connections {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.total = state.total.saturating_sub(1);
        }
        self.inner.released.notify_waiters();
    }

    fn return_connection(&self, mut conn: Connection) {
        let evicted = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.closed || conn.is_closed() {
                state.total = state.total.saturating_sub(1);
                Vec::new()
            } else {
                conn.mark_idle();
                state.idle.push_front(conn);
                self.evict_locked(&mut state, Instant::now())
            }
        };
        drop(evicted);
        self.inner.released.notify_waiters();
    }

    fn evict_locked(&self, state: &mut PoolState, now: Instant) -> Vec<Connection> {
        let min = self.inner.config.min_connections;
        let timeout = self.inner.config.idle_timeout();
        let mut evicted = Vec::new();
        while state.total > min {
            match state.idle.back() {
                Some(conn) if conn.idle_for(now) >= timeout => {
                    if let Some(conn) = state.idle.pop_back() {
                        state.total -= 1;
                        evicted.push(conn);
                    }
                }
                _ => break,
            }
        }
        evicted
    }

    /// Closes idle connections unused for longer than the idle timeout,
    /// keeping at least `min_connections` open. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let evicted = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            self.evict_locked(&mut state, Instant::now())
        };
        if !evicted.is_empty() {
            debug!(addr = %self.inner.addr, count = evicted.len(), "evicted idle connections");
        }
        evicted.len()
    }

    /// Drops every idle connection, e.g. when the server looks unhealthy.
    pub fn drain_idle(&self) -> usize {
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        drained.len()
    }

    /// Stops handing out connections and hands back the idle ones for the
    /// caller to shut down. In-use connections are dropped when they come
    /// back.
    pub fn close(&self) -> Vec<Connection> {
        let drained = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        trace!(addr = %self.inner.addr, idle = drained.len(), "pool closed");
        self.inner.released.notify_waiters();
        drained
    }

    /// Waits until no connection is checked out, up to `limit`. Returns
    /// false on timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let released = self.inner.released.notified();
            if self.in_use() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.in_use() == 0;
            }
        }
    }

    /// Open connections, idle plus in use.
    pub fn total(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").total
    }

    pub fn idle(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").idle.len()
    }

    /// Connections or reserved slots currently handed out.
    pub fn in_use(&self) -> usize {
        let state = self.inner.state.lock().expect("pool mutex poisoned");
        state.total - state.idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("pool mutex poisoned").closed
    }
}

/// A claim on the pool: either an idle connection or a reserved slot that
/// `connect` fills. Dropping it gives the claim back.
pub struct Checkout {
    pool: ConnectionPool,
    conn: Option<Connection>,
    reserved: bool,
}

impl Checkout {
    /// True when an existing connection is reused.
    pub fn is_reused(&self) -> bool {
        self.conn.is_some()
    }

    /// Turns the claim into a usable connection, opening one if needed. On
    /// failure the reserved slot is released.
    pub async fn connect(mut self) -> ClientResult<PooledConnection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => Connection::connect(&self.pool.inner.addr, &self.pool.inner.config).await?,
        };
        // The slot now belongs to the pooled connection.
        self.reserved = false;
        Ok(PooledConnection::new(self.pool.clone(), conn))
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        } else if self.reserved {
            self.pool.release_slot();
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Keeps the connection out of the pool when it is dropped.
    pub fn discard(&mut self) {
        self.valid = false;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection exists until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid && !conn.is_closed() {
            self.pool.return_connection(conn);
        } else {
            drop(conn);
            self.pool.release_slot();
        }
    }
}
