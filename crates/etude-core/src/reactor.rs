// src/reactor.rs
//! The single I/O thread.
//!
//! The reactor owns every socket. It reads request bytes, lends the
//! connection to the worker pool for parsing and dispatch, takes it back
//! through the completion queue and writes the staged response. Idle
//! connections are evicted by the timer sweep that runs on every tick.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, TickSource};
use crate::conn::{self, Connection, ProcessOutcome, ReadOutcome, WriteOutcome};
use crate::error::EtudeResult;
use crate::handler::Dispatcher;
use crate::http::Status;
use crate::metrics::ServerStats;
use crate::pool::ResourcePool;
use crate::signal::{self, Notifier, Ticker};
use crate::slab::{SlotTable, SocketState, Token};
use crate::store::Backend;
use crate::syscalls::{
    self, CLIENT_READ, CLIENT_WRITE, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll,
    epoll_event,
};
use crate::timer::TimerList;
use crate::worker::WorkerPool;

const LISTENER: u64 = u64::MAX;
const SIGNALS: u64 = u64::MAX - 1;
const COMPLETIONS: u64 = u64::MAX - 2;

const BACKLOG: i32 = 5;
const MAX_EVENTS: usize = 1024;

/// Timer payload: the connection to evict when the timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub fd: RawFd,
    pub generation: u64,
}

/// A connection on its way through the worker pool.
#[derive(Debug)]
pub struct Job {
    pub token: Token,
    pub conn: Box<Connection>,
}

struct Finished {
    token: Token,
    conn: Box<Connection>,
    outcome: ProcessOutcome,
}

/// Jobs handed back by workers, plus the pipe that wakes the reactor.
struct Completions {
    done: Mutex<Vec<Finished>>,
    wake: OwnedFd,
}

impl Completions {
    fn push(&self, finished: Finished) {
        self.done.lock().push(finished);
        syscalls::write_byte(std::os::fd::AsRawFd::as_raw_fd(&self.wake), 1);
    }
}

pub struct Reactor {
    listen_fd: RawFd,
    local_addr: SocketAddr,
    epoll: Epoll,
    signal_fd: RawFd,
    notifier: Notifier,
    completion_fd: RawFd,
    completions: Arc<Completions>,
    slots: SlotTable,
    timers: TimerList<Eviction>,
    workers: WorkerPool<Job>,
    stats: Arc<ServerStats>,
    busy_response: Vec<u8>,
    max_connections: usize,
    idle_timeout: Duration,
    timeslot: Duration,
    tick_source: TickSource,
}

impl Reactor {
    /// Bind the listener and start the worker pool. Every request processed
    /// by a worker holds one connection from `resources`.
    pub fn bind<B: Backend>(config: &Config, resources: Arc<ResourcePool<B>>) -> EtudeResult<Self> {
        let epoll = Epoll::new()?;

        let listen_fd = syscalls::create_listen_socket(config.listen_addr(), BACKLOG)?;
        let listener = unsafe { OwnedFd::from_raw_fd(listen_fd) };
        let local_addr = syscalls::local_addr(listen_fd)?;

        let (signal_fd, signal_tx) = syscalls::create_pipe()?;
        let signal_rx = unsafe { OwnedFd::from_raw_fd(signal_fd) };
        let notifier = Notifier::new(unsafe { OwnedFd::from_raw_fd(signal_tx) });

        let (completion_fd, completion_tx) = syscalls::create_pipe()?;
        let completion_rx = unsafe { OwnedFd::from_raw_fd(completion_fd) };
        let completions = Arc::new(Completions {
            done: Mutex::new(Vec::new()),
            wake: unsafe { OwnedFd::from_raw_fd(completion_tx) },
        });

        epoll.add(listen_fd, LISTENER, EPOLLIN)?;
        epoll.add(signal_fd, SIGNALS, EPOLLIN)?;
        epoll.add(completion_fd, COMPLETIONS, EPOLLIN)?;

        let dispatcher = Arc::new(Dispatcher::new(
            config.doc_root.clone(),
            &config.default_document,
            config.routes.clone(),
        ));
        let handler = {
            let completions = completions.clone();
            move |job: Job, store: &mut B::Conn| {
                let Job { token, mut conn } = job;
                // A panicking request still goes back so the socket is closed now.
                let outcome = catch_unwind(AssertUnwindSafe(|| conn.process(&dispatcher, store)))
                    .unwrap_or_else(|_| {
                        tracing::error!(fd = token.fd, "request processing panicked");
                        ProcessOutcome::Abort
                    });
                completions.push(Finished {
                    token,
                    conn,
                    outcome,
                });
            }
        };
        let threads = config.worker_threads();
        let max_requests = config.workers.max_requests;
        let workers = if config.workers.pin_to_cores {
            WorkerPool::new_pinned(threads, max_requests, resources, handler)?
        } else {
            WorkerPool::new(threads, max_requests, resources, handler)?
        };

        let mut busy_response = Vec::with_capacity(128);
        let form = Status::Busy.form();
        conn::write_head(&mut busy_response, Status::Busy, form.len(), false)?;
        busy_response.extend_from_slice(form.as_bytes());

        tracing::info!(addr = %local_addr, doc_root = %config.doc_root.display(), "listening");

        // Ownership of the raw descriptors passes to the reactor, which
        // closes them on drop.
        Ok(Self {
            listen_fd: into_raw(listener),
            local_addr,
            epoll,
            signal_fd: into_raw(signal_rx),
            notifier,
            completion_fd: into_raw(completion_rx),
            completions,
            slots: SlotTable::new(1024),
            timers: TimerList::with_capacity(1024),
            workers,
            stats: Arc::new(ServerStats::new()),
            busy_response,
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout(),
            timeslot: config.timeslot(),
            tick_source: config.timer.tick_source,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for posting tick and stop requests from other threads.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Live client connections.
    pub fn connections(&self) -> usize {
        self.slots.len()
    }

    /// Serve until a stop byte arrives on the signal pipe. In alarm mode the
    /// caller must have run [`signal::install`] first.
    pub fn run(&mut self) -> EtudeResult<()> {
        let _ticker = match self.tick_source {
            TickSource::Alarm => {
                signal::rearm_alarm(self.timeslot);
                None
            }
            TickSource::Thread => Some(Ticker::spawn(self.notifier.clone(), self.timeslot)?),
        };

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut stop = false;

        while !stop {
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "epoll_wait failed");
                    self.close_all();
                    return Err(e.into());
                }
            };

            let mut tick = false;
            for i in 0..n {
                let token = events[i].u64;
                let flags = events[i].events;

                match token {
                    LISTENER => self.accept_all(),
                    SIGNALS => self.read_signals(&mut tick, &mut stop),
                    COMPLETIONS => self.collect_completions(),
                    fd => {
                        let fd = fd as RawFd;
                        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                            self.evict(fd, "peer hung up");
                        } else if flags & EPOLLIN != 0 {
                            self.on_readable(fd);
                        } else if flags & EPOLLOUT != 0 {
                            self.on_writable(fd);
                        }
                    }
                }
            }

            if tick {
                self.sweep();
                if self.tick_source == TickSource::Alarm {
                    signal::rearm_alarm(self.timeslot);
                }
            }
        }

        tracing::info!("stopping reactor");
        self.close_all();
        self.workers.shutdown();
        let snap = self.stats.snapshot();
        tracing::info!(
            accepted = snap.accepted,
            requests = snap.requests,
            bytes_sent = snap.bytes_sent,
            rejected = snap.rejected,
            evicted = snap.evicted,
            "reactor stopped"
        );
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.on_accept(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_accept(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        self.stats.inc_accepted();

        if self.slots.len() >= self.max_connections {
            tracing::warn!(fd, live = self.slots.len(), "connection limit reached");
            self.reject(fd);
            syscalls::close(fd);
            return;
        }

        let Some(token) = self.slots.open(fd, Box::new(Connection::new(fd, peer))) else {
            tracing::error!(fd, "accepted fd still has a live slot");
            syscalls::close(fd);
            return;
        };
        if let Err(e) = self.epoll.add(fd, fd as u64, CLIENT_READ) {
            tracing::error!(fd, error = %e, "failed to register client");
            self.slots.close(fd);
            syscalls::close(fd);
            return;
        }

        let timer = self.timers.add(
            Instant::now() + self.idle_timeout,
            Eviction {
                fd,
                generation: token.generation,
            },
        );
        if let Some(slot) = self.slots.get_mut(fd) {
            slot.timer = Some(timer);
        }
        self.stats.inc_conn();
        tracing::debug!(fd, peer = ?peer, "accepted");
    }

    /// Best-effort 503 on a socket that is about to be closed.
    fn reject(&self, fd: RawFd) {
        self.stats.inc_rejected();
        match syscalls::send_nonblocking(fd, &self.busy_response) {
            Ok(Some(n)) => self.stats.add_bytes(n),
            Ok(None) => {}
            Err(e) => tracing::debug!(fd, error = %e, "busy response not delivered"),
        }
    }

    fn read_signals(&mut self, tick: &mut bool, stop: &mut bool) {
        let drained = syscalls::drain(self.signal_fd, |bytes| {
            for &byte in bytes {
                match byte {
                    signal::TICK => *tick = true,
                    signal::STOP => *stop = true,
                    other => tracing::debug!(signal = other, "ignoring signal byte"),
                }
            }
        });
        if let Err(e) = drained {
            tracing::error!(error = %e, "failed to read signal pipe");
        }
    }

    fn collect_completions(&mut self) {
        if let Err(e) = syscalls::drain(self.completion_fd, |_| {}) {
            tracing::error!(error = %e, "failed to read completion pipe");
        }
        let finished = std::mem::take(&mut *self.completions.done.lock());

        for Finished {
            token,
            conn,
            outcome,
        } in finished
        {
            if self.slots.restore(token, conn).is_err() {
                tracing::debug!(fd = token.fd, "dropping job for a closed connection");
                continue;
            }
            match outcome {
                ProcessOutcome::NeedInput => self.rearm(token.fd, CLIENT_READ),
                ProcessOutcome::Respond => {
                    self.stats.inc_req();
                    self.rearm(token.fd, CLIENT_WRITE);
                }
                ProcessOutcome::Abort => self.evict(token.fd, "response aborted"),
            }
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        if !self.owned(fd) {
            return;
        }
        let Some(conn) = self.slots.get_mut(fd).and_then(|slot| slot.conn.as_mut()) else {
            return;
        };

        match conn.read_from() {
            ReadOutcome::Read(n) => tracing::trace!(fd, bytes = n, "read"),
            ReadOutcome::Eof => return self.evict(fd, "peer closed"),
            ReadOutcome::Full => return self.evict(fd, "receive buffer full"),
            ReadOutcome::Failed(e) => {
                tracing::debug!(fd, error = %e, "recv failed");
                return self.evict(fd, "recv failed");
            }
        }

        let Some((token, conn)) = self.slots.lend(fd) else {
            return;
        };
        match self.workers.submit(Job { token, conn }) {
            Ok(()) => self.renew(fd),
            Err(job) => {
                tracing::warn!(
                    fd,
                    queued = self.workers.queued(),
                    max = self.workers.max_requests(),
                    "work queue full"
                );
                // Restoring cannot fail: the slot was lent a moment ago.
                let _ = self.slots.restore(job.token, job.conn);
                self.reject(fd);
                self.evict(fd, "overloaded");
            }
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        if !self.owned(fd) {
            return;
        }
        let Some(conn) = self.slots.get_mut(fd).and_then(|slot| slot.conn.as_mut()) else {
            return;
        };

        let (outcome, written) = conn.write_to();
        self.stats.add_bytes(written);
        match outcome {
            WriteOutcome::WouldBlock => {
                self.rearm(fd, CLIENT_WRITE);
                self.renew(fd);
            }
            WriteOutcome::KeepAlive => {
                self.rearm(fd, CLIENT_READ);
                self.renew(fd);
            }
            WriteOutcome::Close => self.evict(fd, "response complete"),
            WriteOutcome::Failed(e) => {
                tracing::debug!(fd, error = %e, "send failed");
                self.evict(fd, "send failed");
            }
        }
    }

    /// Readiness for a connection the reactor does not hold means the
    /// handoff bookkeeping is broken for that socket; drop it.
    fn owned(&mut self, fd: RawFd) -> bool {
        match self.slots.state(fd) {
            SocketState::AwaitingReactor => true,
            state => {
                tracing::warn!(fd, ?state, "readiness for a socket the reactor does not own");
                self.evict(fd, "ownership mismatch");
                false
            }
        }
    }

    fn rearm(&mut self, fd: RawFd, interests: u32) {
        if let Err(e) = self.epoll.modify(fd, fd as u64, interests) {
            tracing::error!(fd, error = %e, "failed to re-arm client");
            self.evict(fd, "re-arm failed");
        }
    }

    /// Push the connection's idle deadline out by one timeout.
    fn renew(&mut self, fd: RawFd) {
        let expire = Instant::now() + self.idle_timeout;
        let Some(token) = self.slots.token(fd) else {
            return;
        };
        let current = self.slots.get(fd).and_then(|slot| slot.timer);
        let renewed = current.is_some_and(|id| self.timers.adjust(id, expire));
        if !renewed {
            let id = self.timers.add(
                expire,
                Eviction {
                    fd,
                    generation: token.generation,
                },
            );
            if let Some(slot) = self.slots.get_mut(fd) {
                slot.timer = Some(id);
            }
        }
    }

    /// Close a connection wherever it is. A connection currently with a
    /// worker loses its socket now; the job is dropped when it comes back.
    fn evict(&mut self, fd: RawFd, reason: &'static str) {
        let Some(closed) = self.slots.close(fd) else {
            return;
        };
        if let Some(id) = closed.timer {
            self.timers.remove(id);
        }
        if let Err(e) = self.epoll.delete(fd) {
            tracing::error!(fd, error = %e, "failed to deregister client");
        }
        syscalls::close(fd);
        self.stats.dec_conn();
        tracing::debug!(fd, reason, state = ?closed.state, "connection closed");
    }

    fn sweep(&mut self) {
        let mut expired = Vec::new();
        let fired = self.timers.tick(Instant::now(), |eviction| expired.push(eviction));

        for Eviction { fd, generation } in expired {
            if self.slots.token(fd) != Some(Token { fd, generation }) {
                continue;
            }
            // The timer already left the list.
            if let Some(slot) = self.slots.get_mut(fd) {
                slot.timer = None;
            }
            self.stats.inc_evicted();
            self.evict(fd, "idle timeout");
        }
        tracing::debug!(fired, live = self.slots.len(), "timer tick");
    }

    fn close_all(&mut self) {
        for fd in self.slots.active_fds() {
            self.evict(fd, "shutting down");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.workers.shutdown();
        self.close_all();
        syscalls::close(self.listen_fd);
        syscalls::close(self.signal_fd);
        syscalls::close(self.completion_fd);
    }
}

fn into_raw(fd: OwnedFd) -> RawFd {
    std::os::fd::IntoRawFd::into_raw_fd(fd)
}
