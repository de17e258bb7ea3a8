//! Background evaluation worker.
//!
//! A single thread owns a one-slot job mailbox. Submitting a job replaces
//! any queued-but-unstarted one; cancellation zeroes the running job's step
//! budget, which the evaluation loop observes between ticks. The submitting
//! side never blocks and never observes a partially-applied result: the job
//! owns its circuit, so cancelling leaves the caller's data untouched.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use dflow_core::error::DflowError;
use dflow_core::graph::Circuit;

use crate::registry::Registry;
use crate::session::{Session, TickOutcome};
use crate::value::Value;

/// How a background job ended.
#[derive(Debug)]
pub enum JobOutcome {
    Done(Value),
    Failed(DflowError),
    Cancelled,
    BudgetExhausted,
}

/// Delivered on the worker thread when its job settles.
pub type Callback = Box<dyn FnOnce(JobOutcome) + Send + 'static>;

/// One evaluation request.
pub struct Job {
    pub circuit: Circuit,
    pub inputs: Vec<Value>,
    /// Evaluation ticks this job may spend.
    pub budget: i64,
}

struct Shared {
    slot: Mutex<Option<(Job, Callback)>>,
    ready: Condvar,
    /// Remaining ticks of the running job; zeroed to cancel.
    steps: AtomicI64,
    cancelled: AtomicBool,
    shutdown: AtomicBool,
}

/// Handle to the evaluation thread. Dropping it shuts the thread down,
/// cancelling whatever is in flight.
pub struct Worker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn() -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            ready: Condvar::new(),
            steps: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("dflow-eval".into())
            .spawn(move || worker_loop(thread_shared))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn evaluation thread");
        }
        Worker { shared, handle }
    }

    /// Queues a job, replacing any job that has not started yet. The
    /// callback runs on the worker thread.
    pub fn submit(&self, job: Job, callback: Callback) {
        let replaced = {
            let mut slot = match self.shared.slot.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            slot.replace((job, callback))
        };
        if let Some((_, cb)) = replaced {
            cb(JobOutcome::Cancelled);
        }
        self.shared.ready.notify_one();
    }

    /// Stops the running job (its budget drops to zero) and clears the
    /// mailbox.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.steps.store(0, Ordering::SeqCst);
        let dropped = {
            let mut slot = match self.shared.slot.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            slot.take()
        };
        if let Some((_, cb)) = dropped {
            cb(JobOutcome::Cancelled);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.cancel();
        self.shared.ready.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (job, callback) = {
            let mut slot = match shared.slot.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(taken) = slot.take() {
                    break taken;
                }
                slot = match shared.ready.wait(slot) {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
            }
        };

        shared.cancelled.store(false, Ordering::SeqCst);
        shared.steps.store(job.budget.max(0), Ordering::SeqCst);
        let outcome = run_job(&shared, job);
        debug!(outcome = ?outcome, "job settled");
        callback(outcome);
    }
}

fn run_job(shared: &Shared, job: Job) -> JobOutcome {
    let registry = Registry::builtin();
    let mut session = Session::new(job.inputs);
    loop {
        if shared.cancelled.load(Ordering::SeqCst) || shared.shutdown.load(Ordering::SeqCst) {
            return JobOutcome::Cancelled;
        }
        if shared.steps.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return JobOutcome::BudgetExhausted;
        }
        match session.tick(&job.circuit, &registry) {
            TickOutcome::Running => continue,
            TickOutcome::Done(v) => return JobOutcome::Done(v),
            TickOutcome::Failed(e) => return JobOutcome::Failed(e),
        }
    }
}
