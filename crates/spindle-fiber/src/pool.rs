//! Fiber pools.
//!
//! A pool turns a bounded set of worker fibers into a task executor for
//! one cord. Producers on any thread push into a mutex-guarded pipe;
//! the consumer cord drains it on its loop thread. Idle workers park on
//! an idle list and are dispatched tail-first, so the most recently
//! parked worker (warmest stack, warmest region) runs next; workers
//! idle past the timeout retire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::fiber::{self, Fiber};

type PoolTask = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    cord: Arc<crate::fiber::CordInner>,
    name: String,
    max_size: usize,
    size: AtomicUsize,
    idle: Mutex<Vec<Fiber>>,
    pipe: Mutex<VecDeque<PoolTask>>,
    idle_timeout: Duration,
}

/// A pool of worker fibers bound to the cord that created it.
#[derive(Clone)]
pub struct FiberPool {
    inner: Arc<PoolInner>,
}

impl FiberPool {
    /// Create a pool on the current cord.
    pub fn new(name: &str, max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cord: crate::fiber::current_cord(),
                name: name.to_owned(),
                max_size,
                size: AtomicUsize::new(0),
                idle: Mutex::new(Vec::new()),
                pipe: Mutex::new(VecDeque::new()),
                idle_timeout,
            }),
        }
    }

    /// Number of worker fibers currently alive.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    /// Queue a task. Callable from any thread; the task runs in a
    /// worker fiber on the consumer cord.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.pipe.lock().push_back(Box::new(task));
        let inner = Arc::clone(&self.inner);
        self.inner
            .cord
            .post(Box::new(move || dispatch(&inner)));
    }
}

/// Runs on the consumer cord's loop thread: hand the queued work to
/// idle workers, spawning new ones up to the cap.
fn dispatch(inner: &Arc<PoolInner>) {
    loop {
        if inner.pipe.lock().is_empty() {
            return;
        }
        // Tail-first: the most recently idled worker is dispatched.
        let idle_worker = inner.idle.lock().pop();
        if let Some(worker) = idle_worker {
            worker.call();
            continue;
        }
        if inner.size.load(Ordering::Acquire) >= inner.max_size {
            // Enough workers exist; one of them will drain the pipe.
            return;
        }
        let pool = Arc::clone(inner);
        let worker = match fiber::new(&inner.name, move || {
            worker_loop(&pool);
            Ok(())
        }) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(pool = %inner.name, error = %e, "failed to spawn a pool worker");
                return;
            }
        };
        inner.size.fetch_add(1, Ordering::AcqRel);
        worker.start();
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        let task = inner.pipe.lock().pop_front();
        if let Some(task) = task {
            task();
            fiber::gc();
            continue;
        }
        // Nothing queued: park on the idle list (at the tail).
        let me = fiber::current();
        inner.idle.lock().push(me.clone());
        let timed_out = fiber::yield_timeout(inner.idle_timeout);
        if timed_out {
            // Retire unless a dispatcher popped us concurrently with the
            // timer; still being on the idle list means nobody did.
            let mut idle = inner.idle.lock();
            if let Some(pos) = idle.iter().position(|f| f.fid() == me.fid()) {
                idle.remove(pos);
                drop(idle);
                inner.size.fetch_sub(1, Ordering::AcqRel);
                debug!(pool = %inner.name, fid = me.fid(), "idle pool worker retired");
                return;
            }
        }
    }
}
