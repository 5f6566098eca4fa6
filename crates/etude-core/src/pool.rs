//! Bounded pool of pre-established backend connections.
//!
//! All connections are opened up front by [`ResourcePool::initialize`]. The
//! free list sits behind a mutex, and a counting [`Semaphore`] tracks how many
//! entries it holds so that [`ResourcePool::acquire`] can block without
//! spinning. Workers normally use the scoped form, [`ResourcePool::get`],
//! which hands the connection back when the guard is dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::store::{Backend, BackendConfig, BackendError};
use crate::sync::Semaphore;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("resource pool needs at least one connection")]
    Empty,
    #[error("failed to open backend connection #{index}: {source}")]
    Connect {
        index: usize,
        #[source]
        source: BackendError,
    },
    #[error("resource pool has been shut down")]
    ShutDown,
}

/// One checked-out backend connection. Must be handed back with
/// [`ResourcePool::release`]; prefer [`ResourcePool::get`].
#[must_use = "a lease that is never released permanently removes a permit"]
#[derive(Debug)]
pub struct Lease<C> {
    pool_id: usize,
    slot: usize,
    conn: C,
}

impl<C> Lease<C> {
    /// Stable identity of the pooled connection behind this lease.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

struct PoolState<C> {
    free: VecDeque<(usize, C)>,
    checked_out: Vec<bool>,
    free_count: usize,
    in_use: usize,
    shut_down: bool,
}

pub struct ResourcePool<B: Backend> {
    id: usize,
    backend: B,
    capacity: usize,
    state: Mutex<PoolState<B::Conn>>,
    reserve: Semaphore,
}

impl<B: Backend> ResourcePool<B> {
    /// Open `capacity` connections. Any failure closes what was opened so far
    /// and is returned to the caller, which treats it as fatal.
    pub fn initialize(backend: B, config: &BackendConfig, capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::Empty);
        }

        let mut free = VecDeque::with_capacity(capacity);
        for index in 0..capacity {
            match backend.connect(config) {
                Ok(conn) => free.push_back((index, conn)),
                Err(source) => {
                    tracing::error!(index, error = %source, "backend connection failed");
                    for (_, conn) in free.drain(..) {
                        backend.close(conn);
                    }
                    return Err(PoolError::Connect { index, source });
                }
            }
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            capacity,
            "resource pool ready"
        );

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            capacity,
            state: Mutex::new(PoolState {
                free,
                checked_out: vec![false; capacity],
                free_count: capacity,
                in_use: 0,
                shut_down: false,
            }),
            reserve: Semaphore::new(capacity),
        })
    }

    /// Block until a connection is free and take it.
    pub fn acquire(&self) -> Result<Lease<B::Conn>, PoolError> {
        if !self.reserve.acquire() {
            return Err(PoolError::ShutDown);
        }
        self.take()
    }

    /// Take a connection only if one is free right now.
    pub fn try_acquire(&self) -> Option<Lease<B::Conn>> {
        if !self.reserve.try_acquire() {
            return None;
        }
        self.take().ok()
    }

    fn take(&self) -> Result<Lease<B::Conn>, PoolError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }
        // The permit we hold guarantees the free list is non-empty.
        let (slot, conn) = state.free.pop_front().ok_or(PoolError::ShutDown)?;
        state.checked_out[slot] = true;
        state.free_count -= 1;
        state.in_use += 1;
        Ok(Lease {
            pool_id: self.id,
            slot,
            conn,
        })
    }

    /// Return a connection. `false` when the lease does not belong to this
    /// pool's checked-out set or the pool was shut down; in the shut-down
    /// case the connection is closed instead.
    pub fn release(&self, lease: Lease<B::Conn>) -> bool {
        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            self.backend.close(lease.conn);
            return false;
        }
        if lease.pool_id != self.id || !state.checked_out.get(lease.slot).copied().unwrap_or(false) {
            return false;
        }

        state.checked_out[lease.slot] = false;
        state.free.push_back((lease.slot, lease.conn));
        state.free_count += 1;
        state.in_use -= 1;
        drop(state);

        self.reserve.release();
        true
    }

    /// Releasing nothing is a no-op that reports failure.
    pub fn release_opt(&self, lease: Option<Lease<B::Conn>>) -> bool {
        match lease {
            Some(lease) => self.release(lease),
            None => false,
        }
    }

    /// Scoped acquisition: the connection goes back to the pool when the
    /// guard drops, whatever path the caller leaves by.
    pub fn get(&self) -> Result<PooledConnection<'_, B>, PoolError> {
        let lease = self.acquire()?;
        Ok(PooledConnection {
            pool: self,
            lease: Some(lease),
        })
    }

    /// Close every pooled connection and wake blocked acquirers. Safe to call
    /// more than once.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let conns: Vec<_> = state.free.drain(..).collect();
        state.free_count = 0;
        state.in_use = 0;
        drop(state);

        self.reserve.close();
        let closed = conns.len();
        for (_, conn) in conns {
            self.backend.close(conn);
        }
        tracing::info!(closed, "resource pool shut down");
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free_count
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<B: Backend> Drop for ResourcePool<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Guard returned by [`ResourcePool::get`].
pub struct PooledConnection<'a, B: Backend> {
    pool: &'a ResourcePool<B>,
    lease: Option<Lease<B::Conn>>,
}

impl<B: Backend> PooledConnection<'_, B> {
    pub fn slot(&self) -> usize {
        self.lease.as_ref().map_or(usize::MAX, |lease| lease.slot)
    }
}

impl<B: Backend> Deref for PooledConnection<'_, B> {
    type Target = B::Conn;

    fn deref(&self) -> &B::Conn {
        // Only `None` inside `drop`.
        match &self.lease {
            Some(lease) => &lease.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<B: Backend> DerefMut for PooledConnection<'_, B> {
    fn deref_mut(&mut self) -> &mut B::Conn {
        match &mut self.lease {
            Some(lease) => &mut lease.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<B: Backend> Drop for PooledConnection<'_, B> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease);
        }
    }
}
