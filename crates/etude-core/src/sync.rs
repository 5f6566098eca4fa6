// src/sync.rs
use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
///
/// `acquire` blocks while the count is zero; `release` adds one permit and
/// wakes a single waiter. `close` wakes every waiter and makes further
/// acquisitions fail, which is how pools and queues are torn down.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Debug)]
struct State {
    permits: usize,
    closed: bool,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is posted. Returns `false` if the
    /// semaphore was closed while waiting.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        while state.permits == 0 && !state.closed {
            self.cond.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.permits -= 1;
        true
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.permits == 0 {
            return false;
        }
        state.permits -= 1;
        true
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        drop(state);
        self.cond.notify_one();
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn available(&self) -> usize {
        self.state.lock().permits
    }
}
