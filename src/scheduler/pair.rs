//! The exclusive/concurrent scheduler pair.
//!
//! Both lanes share one backing pool (the tokio runtime) and a
//! reader-writer gate: concurrent jobs hold a read guard for their whole
//! run, the single exclusive worker holds the write guard per job. That
//! yields the pair invariant: at most one exclusive job at a time, and no
//! concurrent job overlaps an exclusive one. Exclusive jobs run in
//! submission order because a single worker drains one FIFO queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::debug;

use crate::error::TaskError;

pub(crate) type LaneJob = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct SchedulerPair {
    gate: Arc<RwLock<()>>,
    exclusive_tx: Mutex<Option<mpsc::UnboundedSender<LaneJob>>>,
    completed: Arc<Notify>,
    completed_flag: Arc<AtomicBool>,
}

impl SchedulerPair {
    /// Spawn the exclusive worker loop on the given runtime.
    pub(crate) fn new(handle: &Handle) -> Self {
        let gate: Arc<RwLock<()>> = Arc::new(RwLock::new(()));
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
        let completed = Arc::new(Notify::new());
        let completed_flag = Arc::new(AtomicBool::new(false));

        let worker_gate = gate.clone();
        let worker_done = completed.clone();
        let worker_flag = completed_flag.clone();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                let _writer = worker_gate.clone().write_owned().await;
                job.await;
            }
            debug!("exclusive lane drained");
            worker_flag.store(true, Ordering::SeqCst);
            worker_done.notify_waiters();
        });

        Self {
            gate,
            exclusive_tx: Mutex::new(Some(tx)),
            completed,
            completed_flag,
        }
    }

    /// Run a job on the concurrent lane: unbounded parallelism, each job
    /// holding a reader slot on the gate.
    pub(crate) fn run_concurrent(&self, handle: &Handle, job: LaneJob) {
        let gate = self.gate.clone();
        handle.spawn(async move {
            let _reader = gate.clone().read_owned().await;
            job.await;
        });
    }

    /// Queue a job on the serialized exclusive lane.
    pub(crate) fn submit_exclusive(&self, job: LaneJob) -> Result<(), TaskError> {
        let guard = self
            .exclusive_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| TaskError::Shutdown),
            None => Err(TaskError::Shutdown),
        }
    }

    /// Refuse further submissions; the worker exits after draining what was
    /// already queued.
    pub(crate) fn complete(&self) {
        let mut guard = self
            .exclusive_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take();
    }

    /// Wait for the exclusive worker to drain and exit. Only meaningful
    /// after [`SchedulerPair::complete`].
    pub(crate) async fn wait_completion(&self) {
        loop {
            let notified = self.completed.notified();
            if self.completed_flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}
