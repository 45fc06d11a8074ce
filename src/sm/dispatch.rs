use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    wake: Notify,
    open: AtomicBool,
}

/// FIFO work queue drained by a fixed pool of workers.
///
/// MAD receive processing runs through here: each receive event is queued
/// as one callback, workers pop and invoke them outside the enqueue lock.
/// Callbacks are expected to be short; anything long-running does not
/// belong on this queue.
///
/// Ordering: items queued by a single producer run in queue order.
/// Concurrent producers are serialised only by the enqueue lock, nothing
/// more. There is no mid-callback cancellation; an item that should not
/// run must simply never be queued.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts `workers` worker tasks (at least one) waiting on the queue.
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            open: AtomicBool::new(true),
        });
        let workers = (0..workers.max(1))
            .map(|worker| {
                let shared = shared.clone();
                tokio::spawn(worker_loop(worker, shared))
            })
            .collect();
        Self { shared, workers }
    }

    /// Appends a work item and signals the pool. Returns immediately; the
    /// callback runs asynchronously on some worker.
    pub fn queue(&self, item: impl FnOnce() + Send + 'static) {
        if !self.shared.open.load(Ordering::Acquire) {
            warn!("work item dropped: dispatcher is shutting down");
            return;
        }
        self.shared
            .queue
            .lock()
            .expect("dispatch queue poisoned")
            .push_back(Box::new(item));
        self.shared.wake.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("dispatch queue poisoned")
            .len()
    }

    /// Stops the pool and drains the queue.
    ///
    /// Workers stop dequeuing as soon as the flag flips; whatever each one
    /// already holds finishes first. Every item still queued afterwards is
    /// invoked here, on the calling task, before this returns: queued
    /// callbacks run exactly once even through shutdown, none lost, none
    /// duplicated.
    pub async fn shutdown(mut self) {
        self.shared.open.store(false, Ordering::Release);
        self.shared.wake.notify_waiters();
        join_all(self.workers.drain(..)).await;

        loop {
            let item = self
                .shared
                .queue
                .lock()
                .expect("dispatch queue poisoned")
                .pop_front();
            match item {
                Some(callback) => callback(),
                None => break,
            }
        }
    }
}

async fn worker_loop(worker: usize, shared: Arc<Shared>) {
    trace!("dispatch worker {} started", worker);
    loop {
        if !shared.open.load(Ordering::Acquire) {
            break;
        }
        let item = shared
            .queue
            .lock()
            .expect("dispatch queue poisoned")
            .pop_front();
        match item {
            Some(callback) => callback(),
            None => {
                // register interest before re-checking, so a queue() that
                // lands between the check and the await still wakes us
                let notified = shared.wake.notified();
                if !shared.open.load(Ordering::Acquire) {
                    break;
                }
                if !shared
                    .queue
                    .lock()
                    .expect("dispatch queue poisoned")
                    .is_empty()
                {
                    continue;
                }
                notified.await;
            }
        }
    }
    trace!("dispatch worker {} stopped", worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn single_producer_fifo_order() {
        let dispatcher = Dispatcher::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = order.clone();
            dispatcher.queue(move || {
                order.lock().unwrap().push(label);
            });
        }
        dispatcher.shutdown().await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn shutdown_runs_every_queued_item_exactly_once() {
        let dispatcher = Dispatcher::new(4);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let ran = ran.clone();
            dispatcher.queue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn workers_drain_without_shutdown() {
        let dispatcher = Dispatcher::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = ran.clone();
            dispatcher.queue(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(dispatcher.pending(), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn callbacks_see_their_captured_context() {
        let dispatcher = Dispatcher::new(2);
        let total = Arc::new(AtomicUsize::new(0));
        for value in [1usize, 2, 39] {
            let total = total.clone();
            dispatcher.queue(move || {
                total.fetch_add(value, Ordering::SeqCst);
            });
        }
        dispatcher.shutdown().await;
        assert_eq!(total.load(Ordering::SeqCst), 42);
    }
}
