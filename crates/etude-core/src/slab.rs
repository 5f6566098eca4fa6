// src/slab.rs
use std::os::unix::io::RawFd;

use crate::conn::Connection;
use crate::timer::TimerId;

/// Who currently owns the connection in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Slot unused.
    #[default]
    Idle,
    /// The connection was moved into the worker pool.
    AwaitingWorker,
    /// The reactor holds the connection and waits for readiness.
    AwaitingReactor,
}

/// Identifies one connection for its whole lifetime. The generation changes
/// every time a slot is torn down, so a job that comes back after its socket
/// was evicted (and perhaps the fd reused) does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub fd: RawFd,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct Slot {
    pub state: SocketState,
    pub generation: u64,
    pub conn: Option<Box<Connection>>,
    pub timer: Option<TimerId>,
}

/// What is left of a slot after [`SlotTable::close`].
#[derive(Debug)]
pub struct Closed {
    pub conn: Option<Box<Connection>>,
    pub timer: Option<TimerId>,
    pub state: SocketState,
}

/// Connection slots indexed by file descriptor. Slots are reused when the
/// kernel hands out the same fd again.
pub struct SlotTable {
    entries: Vec<Slot>,
    active_count: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, Slot::default);
        Self {
            entries,
            active_count: 0,
        }
    }

    /// Install a freshly accepted connection. Returns `None` if the slot is
    /// still in use.
    pub fn open(&mut self, fd: RawFd, conn: Box<Connection>) -> Option<Token> {
        let index = usize::try_from(fd).ok()?;
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, Slot::default);
        }
        let slot = &mut self.entries[index];
        if slot.state != SocketState::Idle {
            return None;
        }
        slot.state = SocketState::AwaitingReactor;
        slot.conn = Some(conn);
        slot.timer = None;
        self.active_count += 1;
        Some(Token {
            fd,
            generation: slot.generation,
        })
    }

    #[inline(always)]
    pub fn get(&self, fd: RawFd) -> Option<&Slot> {
        self.entries.get(usize::try_from(fd).ok()?)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Slot> {
        self.entries.get_mut(usize::try_from(fd).ok()?)
    }

    pub fn state(&self, fd: RawFd) -> SocketState {
        self.get(fd).map_or(SocketState::Idle, |slot| slot.state)
    }

    pub fn token(&self, fd: RawFd) -> Option<Token> {
        let slot = self.get(fd)?;
        (slot.state != SocketState::Idle).then_some(Token {
            fd,
            generation: slot.generation,
        })
    }

    /// Move the connection out for a worker. Only valid while the reactor
    /// owns it.
    pub fn lend(&mut self, fd: RawFd) -> Option<(Token, Box<Connection>)> {
        let slot = self.get_mut(fd)?;
        if slot.state != SocketState::AwaitingReactor {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.state = SocketState::AwaitingWorker;
        Some((
            Token {
                fd,
                generation: slot.generation,
            },
            conn,
        ))
    }

    /// Take back a connection a worker finished with. A token from an
    /// earlier generation, or a slot not waiting on a worker, hands the
    /// connection back as the error.
    pub fn restore(&mut self, token: Token, conn: Box<Connection>) -> Result<(), Box<Connection>> {
        let Some(slot) = self.get_mut(token.fd) else {
            return Err(conn);
        };
        if slot.generation != token.generation || slot.state != SocketState::AwaitingWorker {
            return Err(conn);
        }
        slot.conn = Some(conn);
        slot.state = SocketState::AwaitingReactor;
        Ok(())
    }

    /// Tear the slot down and bump its generation. `None` if it was idle.
    pub fn close(&mut self, fd: RawFd) -> Option<Closed> {
        let slot = self.get_mut(fd)?;
        if slot.state == SocketState::Idle {
            return None;
        }
        let closed = Closed {
            conn: slot.conn.take(),
            timer: slot.timer.take(),
            state: slot.state,
        };
        slot.state = SocketState::Idle;
        slot.generation += 1;
        self.active_count -= 1;
        Some(closed)
    }

    /// File descriptors of every slot in use.
    pub fn active_fds(&self) -> Vec<RawFd> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state != SocketState::Idle)
            .filter_map(|(index, _)| RawFd::try_from(index).ok())
            .collect()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
