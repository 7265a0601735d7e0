//! Execution queue
//!
//! A bounded-concurrency work queue: a FIFO backlog drained by a fixed
//! pool of tokio workers. With one worker this is the strict-order
//! variant used by the sequential strategy; with N workers it bounds
//! parallel task execution.
//!
//! Pause closes the intake gate but lets in-flight work finish; stop
//! clears the backlog and `drain` awaits the workers out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A unit of work handed to a worker: run one agent loop over one task
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub task_id: String,
    /// Agent actually executing (a clone's id when the owner was busy)
    pub agent_id: String,
    /// Aggregated results of prior tasks relevant to this one
    pub context: String,
    /// Dispatch epoch; must match the task's current epoch to be valid
    pub epoch: u64,
    /// Re-enter the loop with checkpointed history instead of starting fresh
    pub resume: bool,
}

/// Executes work items pulled off the queue
#[async_trait]
pub trait WorkRunner: Send + Sync {
    async fn run(&self, item: WorkItem);
}

struct QueueInner {
    backlog: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
    /// true = workers may pull new items
    gate_tx: watch::Sender<bool>,
    /// true = shut down once the backlog view is observed
    closed_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
}

/// Bounded worker pool over a FIFO backlog
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionQueue {
    /// Spawn `worker_count` workers feeding items into `runner`
    pub fn start(worker_count: usize, runner: Arc<dyn WorkRunner>) -> Self {
        let worker_count = worker_count.max(1);
        let (gate_tx, _) = watch::channel(true);
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(QueueInner {
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            gate_tx,
            closed_tx,
            in_flight: AtomicUsize::new(0),
        });

        let workers = (0..worker_count)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                let runner = Arc::clone(&runner);
                tokio::spawn(worker_loop(worker_id, inner, runner))
            })
            .collect();

        debug!(worker_count, "execution queue started");
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Append a work item to the backlog
    pub fn submit(&self, item: WorkItem) {
        if *self.inner.closed_tx.borrow() {
            warn!(task_id = %item.task_id, "submit after close; dropping work item");
            return;
        }
        debug!(task_id = %item.task_id, agent_id = %item.agent_id, resume = item.resume, "work item queued");
        self.inner.backlog.lock().expect("backlog lock").push_back(item);
        self.inner.notify.notify_one();
    }

    /// Close the intake gate; queued items stay put, in-flight work finishes
    pub fn pause(&self) {
        self.inner.gate_tx.send_replace(false);
    }

    /// Reopen the intake gate
    pub fn resume(&self) {
        self.inner.gate_tx.send_replace(true);
        self.inner.notify.notify_one();
    }

    /// Stop intake and discard the backlog; workers exit after their
    /// current item
    pub fn close(&self) {
        let dropped = {
            let mut backlog = self.inner.backlog.lock().expect("backlog lock");
            let dropped = backlog.len();
            backlog.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "discarded queued work items on close");
        }
        self.inner.closed_tx.send_replace(true);
        // Open the gate so workers parked on a paused queue can observe
        // the shutdown
        self.inner.gate_tx.send_replace(true);
    }

    /// Await all workers after `close`
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker table lock");
            workers.drain(..).collect()
        };
        join_all(handles).await;
    }

    /// Number of items currently being executed
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Number of items waiting in the backlog
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().expect("backlog lock").len()
    }

    /// True when nothing is queued or executing
    pub fn is_idle(&self) -> bool {
        self.backlog_len() == 0 && self.in_flight() == 0
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<QueueInner>, runner: Arc<dyn WorkRunner>) {
    let mut gate_rx = inner.gate_tx.subscribe();
    let mut closed_rx = inner.closed_tx.subscribe();

    loop {
        if *closed_rx.borrow_and_update() {
            break;
        }

        if !*gate_rx.borrow_and_update() {
            tokio::select! {
                _ = gate_rx.changed() => {},
                _ = closed_rx.changed() => {},
            }
            continue;
        }

        let item = inner.backlog.lock().expect("backlog lock").pop_front();
        match item {
            Some(item) => {
                debug!(worker_id, task_id = %item.task_id, "worker picked up item");
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                runner.run(item).await;
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                tokio::select! {
                    _ = inner.notify.notified() => {},
                    _ = closed_rx.changed() => {},
                }
            }
        }
    }
    debug!(worker_id, "worker exiting");
}
