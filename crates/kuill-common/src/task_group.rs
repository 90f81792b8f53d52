//! Fan-out task group with dynamic growth
//!
//! Work that discovers more work (a denied cluster-scope check expanding into
//! one check per namespace) needs a wait group whose size is not known up
//! front. [`fan_out`] returns a [`Spawner`] and a [`Collector`]:
//!
//! - every spawned task receives its own `Spawner`, so it can add children
//!   while it runs
//! - results flow through an unbounded channel, so producers never block on
//!   a collector that has not caught up
//! - the collector's stream ends exactly when the root spawner has been
//!   finished and every task (and thus every task-held spawner) is done
//! - each task runs under a child of the group's cancellation token, so one
//!   `cancel` stops the whole tree

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicUsize,
    completed: AtomicUsize,
}

/// Handle used to add tasks to a fan-out group
pub struct Spawner<T> {
    tx: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl<T> Clone for Spawner<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<T: Send + 'static> Spawner<T> {
    /// Spawn a task into the group
    ///
    /// The closure receives a spawner scoped to the task's own cancellation
    /// token; use it to add child tasks. `Some` results are delivered to the
    /// collector, `None` contributes nothing.
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(Spawner<T>) -> Fut,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let token = self.cancel.child_token();
        let child = Spawner {
            tx: self.tx.clone(),
            cancel: token.clone(),
            counters: self.counters.clone(),
        };
        let tx = self.tx.clone();
        let counters = self.counters.clone();
        counters.spawned.fetch_add(1, Ordering::SeqCst);

        let fut = task(child);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                out = fut => {
                    if let Some(value) = out {
                        let _ = tx.send(value);
                    }
                }
            }
            counters.completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    /// Cancellation token scoped to this spawner
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signal that this producer will add no more tasks
    ///
    /// The collector finishes once every producer has finished and every
    /// spawned task has completed.
    pub fn finish(self) {}
}

/// Receives results from a fan-out group
pub struct Collector<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl<T> Collector<T> {
    /// Next result, or `None` once the group is drained
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Wait for every task and gather all results
    pub async fn collect(mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(value) = self.rx.recv().await {
            out.push(value);
        }
        out
    }

    /// Cancel every task in the group
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Total number of tasks spawned so far
    pub fn spawned(&self) -> usize {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    /// Number of tasks that have completed or been cancelled
    pub fn completed(&self) -> usize {
        self.counters.completed.load(Ordering::SeqCst)
    }
}

/// Create a fan-out group whose tasks are cancelled with `cancel`
pub fn fan_out<T: Send + 'static>(cancel: CancellationToken) -> (Spawner<T>, Collector<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        Spawner {
            tx,
            cancel: cancel.clone(),
            counters: counters.clone(),
        },
        Collector {
            rx,
            cancel,
            counters,
        },
    )
}
