//! Serialized event loops
//!
//! An [`EventLoop`] is a single task draining a queue of boxed closures.
//! Everything scheduled onto one loop runs in arrival order, which is the
//! ordering guarantee the transport relies on: connection lifecycle runs on
//! the receive loop, enqueue/flush decisions on the send loop, and the two
//! only meet at the link registry mutex.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::BusError;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct EventLoop {
    name: &'static str,
    queue: mpsc::UnboundedSender<Task>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Starts the worker task. Must be called inside a tokio runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Task>();
        let stopped = Arc::new(AtomicBool::new(false));
        let stop = stopped.clone();
        let worker = tokio::spawn(async move {
            debug!(name, "event loop started");
            while let Some(task) = rx.recv().await {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                task();
            }
            debug!(name, "event loop stopped");
        });
        Self {
            name,
            queue,
            stopped,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Appends a closure to the loop. Thread-safe; the closure must not
    /// block, long work belongs on its own task.
    pub fn schedule<F>(&self, task: F) -> Result<(), BusError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::LoopStopped);
        }
        self.queue
            .send(Box::new(task))
            .map_err(|_| BusError::LoopStopped)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the worker and waits for it. Idempotent; closures still queued
    /// when the stop lands are dropped unrun.
    pub async fn finish(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // wake the worker so it observes the stop flag
        let _ = self.queue.send(Box::new(|| {}));
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_closures_in_order() {
        let evloop = EventLoop::spawn("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        for i in 0..100 {
            let seen = seen.clone();
            evloop.schedule(move || seen.lock().push(i)).unwrap();
        }
        evloop.schedule(move || drop(done_tx.send(()))).unwrap();
        done_rx.await.unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        evloop.finish().await;
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let evloop = EventLoop::spawn("test");
        evloop.finish().await;
        evloop.finish().await;
        assert!(matches!(
            evloop.schedule(|| {}),
            Err(BusError::LoopStopped)
        ));
    }

    #[tokio::test]
    async fn schedule_from_other_tasks() {
        let evloop = Arc::new(EventLoop::spawn("test"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut joins = Vec::new();
        for i in 0..8 {
            let evloop = evloop.clone();
            let tx = tx.clone();
            joins.push(tokio::spawn(async move {
                evloop
                    .schedule(move || {
                        let _ = tx.send(i);
                    })
                    .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        let mut got = Vec::new();
        for _ in 0..8 {
            got.push(rx.recv().await.unwrap());
        }
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        evloop.finish().await;
    }
}
