//! Bounded worker pool consuming a FIFO task queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A handle to a task's eventual result. Awaiting it blocks the calling thread until the worker
/// that picked up the job finishes.
pub struct JobHandle<T> {
    rx: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Blocks until the job completes, returning its result.
    ///
    /// Panics if the worker that owned this job panicked before sending its result — the same
    /// failure mode as an unwound thread's `JoinHandle::join`.
    pub fn join(self) -> T {
        self.rx.recv().expect("worker dropped without completing job")
    }
}

struct Shared {
    tasks: (Sender<Job>, Receiver<Job>),
    stopped: AtomicBool,
}

/// Bounded pool of worker threads draining a shared task queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `worker_count` threads, each blocking on the shared task queue.
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(Shared {
            tasks: unbounded(),
            stopped: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }

        Self { shared, workers }
    }

    /// Enqueues `f`, returning a handle for its result.
    ///
    /// Fails only if the pool has already been stopped; the queue is otherwise unbounded and
    /// accepts all tasks.
    pub fn enqueue<F, T>(&self, f: F) -> Result<JobHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::PoolStopped);
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let result = f();
            let _ = result_tx.send(result);
        });

        self.shared
            .tasks
            .0
            .send(job)
            .map_err(|_| Error::PoolStopped)?;

        Ok(JobHandle { rx: result_rx })
    }

    /// Sets the drain flag, wakes all workers, joins them, and drops any residual tasks.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        // Dropping the sender side would be cleaner, but `Shared` is shared by `Arc` across
        // workers and enqueuers; closing the channel here would race a caller mid-`enqueue`.
        // Workers instead observe `stopped` directly and exit once the queue drains.
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        while self.shared.tasks.1.try_recv().is_ok() {}
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.shared.stopped.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        match shared.tasks.1.recv_timeout(std::time::Duration::from_millis(50)) {
            Ok(job) => job(),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shared.stopped.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_enqueued_jobs_and_returns_results() {
        let pool = ThreadPool::new(4);
        let handle = pool.enqueue(|| 2 + 2).unwrap();
        assert_eq!(handle.join(), 4);
    }

    #[test]
    fn distributes_work_across_many_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                pool.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let mut pool = ThreadPool::new(2);
        pool.stop();
        assert!(pool.enqueue(|| ()).is_err());
    }
}
