// src/worker.rs
//! Fixed set of threads draining a bounded work queue.
//!
//! Each work item is processed while holding one scoped permit from the
//! shared [`ResourcePool`], so the number of requests touching the backend
//! at once never exceeds the pool's capacity.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::pool::ResourcePool;
use crate::store::Backend;
use crate::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Semaphore,
    max_requests: usize,
}

pub struct WorkerPool<T: Send + 'static> {
    queue: Arc<Queue<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<B, F>(
        threads: usize,
        max_requests: usize,
        resources: Arc<ResourcePool<B>>,
        handler: F,
    ) -> Result<Self, WorkerError>
    where
        B: Backend,
        F: Fn(T, &mut B::Conn) + Send + Sync + 'static,
    {
        Self::start(threads, max_requests, false, resources, handler)
    }

    /// Like [`new`](Self::new), pinning worker `i` to core `i % cores`.
    pub fn new_pinned<B, F>(
        threads: usize,
        max_requests: usize,
        resources: Arc<ResourcePool<B>>,
        handler: F,
    ) -> Result<Self, WorkerError>
    where
        B: Backend,
        F: Fn(T, &mut B::Conn) + Send + Sync + 'static,
    {
        Self::start(threads, max_requests, true, resources, handler)
    }

    fn start<B, F>(
        threads: usize,
        max_requests: usize,
        pin: bool,
        resources: Arc<ResourcePool<B>>,
        handler: F,
    ) -> Result<Self, WorkerError>
    where
        B: Backend,
        F: Fn(T, &mut B::Conn) + Send + Sync + 'static,
    {
        if threads == 0 {
            return Err(WorkerError::InvalidConfig("thread count must be positive"));
        }
        if max_requests == 0 {
            return Err(WorkerError::InvalidConfig("max_requests must be positive"));
        }

        let queue = Arc::new(Queue {
            items: Mutex::new(VecDeque::with_capacity(max_requests.min(1024))),
            ready: Semaphore::new(0),
            max_requests,
        });
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let pool = Self {
            queue: queue.clone(),
            handles: Mutex::new(Vec::with_capacity(threads)),
            threads,
        };

        for i in 0..threads {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let queue = queue.clone();
            let resources = resources.clone();
            let handler = handler.clone();

            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run(i, &queue, &resources, &*handler);
                });

            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    // `pool` drops here and joins whatever already started.
                    return Err(WorkerError::Spawn(e));
                }
            }
        }

        tracing::info!(threads, max_requests, pinned = pin, "worker pool started");
        Ok(pool)
    }

    /// Queue an item. Hands it back when the queue already holds
    /// `max_requests` items or the pool is shutting down. Never blocks.
    pub fn submit(&self, item: T) -> Result<(), T> {
        let mut items = self.queue.items.lock();
        if self.queue.ready.is_closed() || items.len() >= self.queue.max_requests {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.queue.ready.release();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.queue.items.lock().len()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn max_requests(&self) -> usize {
        self.queue.max_requests
    }

    /// Stop every worker and wait for it. Items still queued are dropped.
    pub fn shutdown(&self) {
        self.queue.ready.close();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread exited by panic");
            }
        }
        let dropped = {
            let mut items = self.queue.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued work at shutdown");
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T, B, F>(id: usize, queue: &Queue<T>, resources: &ResourcePool<B>, handler: &F)
where
    B: Backend,
    F: Fn(T, &mut B::Conn),
{
    tracing::debug!(worker = id, "worker running");
    while queue.ready.acquire() {
        let Some(item) = queue.items.lock().pop_front() else {
            continue;
        };

        let mut conn = match resources.get() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(worker = id, error = %e, "dropping request, no backend connection");
                continue;
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler(item, &mut *conn)));
        drop(conn);
        if outcome.is_err() {
            tracing::error!(worker = id, "request handler panicked");
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BackendConfig, MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn resources(capacity: usize) -> Arc<ResourcePool<MemoryBackend>> {
        Arc::new(ResourcePool::initialize(MemoryBackend::new(), &BackendConfig::default(), capacity).unwrap())
    }

    #[test]
    fn test_invalid_config() {
        let r = resources(1);
        assert!(matches!(
            WorkerPool::<u32>::new(0, 10, r.clone(), |_, _| {}),
            Err(WorkerError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorkerPool::<u32>::new(2, 0, r, |_, _| {}),
            Err(WorkerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_processes_every_item() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(4, 100, resources(2), move |n: u32, _conn| {
            tx.lock().send(n).unwrap();
        })
        .unwrap();
        assert_eq!(pool.threads(), 4);

        for n in 0..50 {
            pool.submit(n).unwrap();
        }
        let mut seen: Vec<u32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_queue_never_exceeds_max_requests() {
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let gate_rx = Mutex::new(gate_rx);

        let pool = WorkerPool::new(1, 3, resources(1), move |_: u32, _conn| {
            started_tx.lock().send(()).unwrap();
            gate_rx.lock().recv().unwrap();
        })
        .unwrap();

        // Occupy the only worker.
        pool.submit(0).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for n in 1..=3 {
            pool.submit(n).unwrap();
        }
        assert_eq!(pool.queued(), 3);
        assert_eq!(pool.submit(99), Err(99));
        assert_eq!(pool.queued(), 3);

        for _ in 0..4 {
            gate_tx.send(()).unwrap();
        }
        for _ in 0..3 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_tasks_hold_a_pool_permit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let r = resources(2);

        let pool = {
            let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
            WorkerPool::new(6, 100, r.clone(), move |_: u32, _conn| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        for n in 0..24 {
            pool.submit(n).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while done.load(Ordering::SeqCst) < 24 {
            assert!(std::time::Instant::now() < deadline, "workers stalled");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        drop(pool);
        assert_eq!(r.free_count(), 2);
    }

    #[test]
    fn test_worker_survives_handler_panic() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let r = resources(1);
        let pool = WorkerPool::new(1, 10, r.clone(), move |n: u32, _conn| {
            if n == 0 {
                panic!("bad request");
            }
            tx.lock().send(n).unwrap();
        })
        .unwrap();

        pool.submit(0).unwrap();
        pool.submit(1).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        drop(pool);
        assert_eq!(r.free_count(), 1);
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let pool = WorkerPool::new(2, 10, resources(1), |_: u32, _conn| {}).unwrap();
        pool.shutdown();
        assert_eq!(pool.submit(1), Err(1));
        pool.shutdown();
    }
}
