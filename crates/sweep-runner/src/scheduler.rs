use crate::error::{RunnerError, SweepError};
use crate::expand::InstanceParams;
use crate::runner::{Dispatch, InstanceRunner, RunOutcome};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts dispatched instances for progress output. Never used to decide
/// what runs next.
#[derive(Debug, Default)]
pub struct ProgressCounter(AtomicUsize);

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments and returns the new value (1-based sequence number).
    pub fn advance(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes a single instance. The scheduler only needs this seam, so it can
/// drive the real [`InstanceRunner`] or anything else.
pub trait Execute: Sync {
    fn execute(&self, params: &InstanceParams, dispatch: Dispatch)
        -> Result<RunOutcome, RunnerError>;
}

impl Execute for InstanceRunner {
    fn execute(
        &self,
        params: &InstanceParams,
        dispatch: Dispatch,
    ) -> Result<RunOutcome, RunnerError> {
        self.run(params, dispatch)
    }
}

/// What a sweep would do, without doing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepPlan {
    pub instances: usize,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    max_workers: usize,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn plan(&self, instances: &[InstanceParams]) -> SweepPlan {
        SweepPlan {
            instances: instances.len(),
            max_workers: self.max_workers,
        }
    }

    /// Runs every instance with at most `max_workers` in flight and returns
    /// one result per instance, in the order given.
    ///
    /// A single worker runs inline on the calling thread; more than one gets
    /// a dedicated pool sized exactly to the limit.
    pub fn dispatch<E: Execute>(
        &self,
        executor: &E,
        instances: &[InstanceParams],
        counter: &ProgressCounter,
    ) -> Result<Vec<Result<RunOutcome, RunnerError>>, SweepError> {
        let total = instances.len();
        let run_one = |params: &InstanceParams| {
            let sequence = counter.advance();
            executor.execute(params, Dispatch { sequence, total })
        };

        if self.max_workers == 1 {
            return Ok(instances.iter().map(run_one).collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .thread_name(|idx| format!("sweep-worker-{}", idx))
            .build()
            .map_err(|e| SweepError::WorkerPool(e.to_string()))?;
        Ok(pool.install(|| instances.par_iter().with_max_len(1).map(run_one).collect()))
    }
}
