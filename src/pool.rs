//! Fixed-size worker pool: a `Mutex`-guarded FIFO task queue, a condvar for
//! non-emptiness, and a shutdown flag shared across every worker thread.
//!
//! Grounded directly on the original `ThreadPool`'s shared `Pool` struct
//! plus a lock/pop-outside-the-lock/wait loop per worker. The queue is
//! deliberately unbounded (spec §4.4, §9 open question (c)): `submit`
//! must never block the acceptor thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue depth past which `submit` logs a warning about unbounded growth
/// under sustained overload (spec §9, open question (c)).
const QUEUE_WARN_WATERMARK: usize = 10_000;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    not_empty: Condvar,
    shutdown: std::sync::atomic::AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0, "thread_count must be >= 1");
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });

        let workers = (0..thread_count)
            .map(|id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("reactor-worker-{id}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueues `task` and wakes one waiting worker. Never blocks.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Box::new(task));
        if queue.len() == QUEUE_WARN_WATERMARK {
            warn!(depth = queue.len(), "worker pool queue crossed growth watermark");
        }
        drop(queue);
        self.shared.not_empty.notify_one();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            if let Some(task) = queue.pop_front() {
                drop(queue);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    log_worker_panic(payload);
                }
                break;
            }
            if shared.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                return;
            }
            queue = shared.not_empty.wait(queue).unwrap();
        }
    }
}

fn log_worker_panic(payload: Box<dyn std::any::Any + Send>) {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(panic = %msg, "worker task panicked; connection-local failure, pool keeps running");
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, std::sync::atomic::Ordering::Release);
        self.shared.not_empty.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
