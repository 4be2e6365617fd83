//! Fixed-size worker pool for parallel and concurrent GC tasks.

use crossbeam::channel::{Sender, unbounded};
use std::thread::JoinHandle;
use tracing::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of GC worker threads fed through an unbounded channel.
/// Phase completion is not the pool's business: callers track outstanding
/// work with the heap's running-task barrier.
pub struct TaskPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    #[must_use]
    pub fn new(thread_count: usize) -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let workers = (0..thread_count)
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("gengc-worker-{index}"))
                    .spawn(move || {
                        for task in &receiver {
                            task();
                        }
                    })
                    .expect("failed to spawn GC worker thread")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(task)).is_err() {
                warn!("GC task posted after pool shutdown");
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain and exit.
        drop(self.sender.take());
        let current = std::thread::current().id();
        for handle in self.workers.drain(..) {
            // A worker can be the thread releasing the last heap handle;
            // it must not join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_on_pool_threads() {
        let pool = TaskPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = crossbeam::channel::bounded(16);
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let done = done_tx.clone();
            pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done.send(()).unwrap();
            });
        }
        for _ in 0..16 {
            done_rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn drop_joins_idle_workers() {
        let pool = TaskPool::new(4);
        assert_eq!(pool.thread_count(), 4);
        drop(pool);
    }
}
