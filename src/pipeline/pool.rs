use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Fixed-size set of reusable connections.
///
/// Connections are lent to one apply task at a time and handed back by
/// the dispatcher once it sees that task finished.
pub struct ConnectionPool<C> {
    state: Mutex<PoolState<C>>,
}

struct PoolState<C> {
    slots: Vec<Slot<C>>,
    closed: bool,
}

enum Slot<C> {
    Idle(C),
    Lent,
    Retired,
}

/// A connection on loan from the pool.
#[derive(Debug)]
pub struct PooledConnection<C> {
    slot: usize,
    connection: C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub retired: usize,
    pub closed: bool,
}

impl<C> ConnectionPool<C> {
    pub fn new(connections: Vec<C>) -> Self {
        info!("Connection pool created with {} connections", connections.len());
        Self {
            state: Mutex::new(PoolState {
                slots: connections.into_iter().map(Slot::Idle).collect(),
                closed: false,
            }),
        }
    }

    /// Lends an idle connection. Fails instead of waiting when none is free.
    pub fn acquire(&self) -> Result<PooledConnection<C>> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        for (slot, entry) in state.slots.iter_mut().enumerate() {
            if matches!(entry, Slot::Idle(_)) {
                if let Slot::Idle(connection) = std::mem::replace(entry, Slot::Lent) {
                    debug!(slot, "Connection acquired");
                    return Ok(PooledConnection { slot, connection });
                }
            }
        }

        let in_use = state.slots.iter().filter(|e| matches!(e, Slot::Lent)).count();
        Err(Error::PoolExhausted {
            capacity: state.slots.len(),
            in_use,
            retired: state.slots.len() - in_use,
        })
    }

    /// Takes a connection back. After shutdown it is closed instead.
    pub fn release(&self, connection: PooledConnection<C>) {
        let mut state = self.lock();
        let closed = state.closed;

        let slot = connection.slot;
        match state.slots.get_mut(slot) {
            Some(entry) if matches!(entry, Slot::Lent) => {
                if closed {
                    debug!(slot, "Pool closed, dropping returned connection");
                    *entry = Slot::Retired;
                } else {
                    debug!(slot, "Connection released");
                    *entry = Slot::Idle(connection.connection);
                }
            }
            _ => warn!(slot, "Released a connection the pool did not lend"),
        }
    }

    /// Forgets a lent connection that can never come back.
    pub fn discard(&self, slot: usize) {
        let mut state = self.lock();
        if let Some(entry) = state.slots.get_mut(slot).filter(|e| matches!(e, Slot::Lent)) {
            warn!(slot, "Connection discarded, pool capacity reduced");
            *entry = Slot::Retired;
        }
    }

    /// Closes every idle connection and refuses further loans.
    ///
    /// Returns the number of connections closed, or an error if some were
    /// still lent out.
    pub fn shutdown(&self) -> Result<usize> {
        let mut state = self.lock();
        state.closed = true;

        let mut closed = 0;
        let mut lent = 0;
        for entry in state.slots.iter_mut() {
            match entry {
                Slot::Idle(_) => {
                    *entry = Slot::Retired;
                    closed += 1;
                }
                Slot::Lent => lent += 1,
                Slot::Retired => {}
            }
        }

        info!(closed, "Connection pool shut down");
        if lent > 0 {
            return Err(Error::Connection(format!(
                "{} pooled connections were still in use at shutdown",
                lent
            )));
        }
        Ok(closed)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = PoolStats {
            capacity: state.slots.len(),
            idle: 0,
            in_use: 0,
            retired: 0,
            closed: state.closed,
        };
        for entry in &state.slots {
            match entry {
                Slot::Idle(_) => stats.idle += 1,
                Slot::Lent => stats.in_use += 1,
                Slot::Retired => stats.retired += 1,
            }
        }
        stats
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> PooledConnection<C> {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}
