//! Background job scheduling for sampling.
//!
//! Jobs are injected into a scheduler rather than spawned ad hoc, so tests can
//! run them inline and production can bound the worker count.

use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::io;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait JobScheduler: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Runs each job on the calling thread before returning.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl JobScheduler for ImmediateScheduler {
    fn schedule(&self, job: Job) {
        job();
    }
}

/// Runs jobs on a dedicated rayon pool.
pub struct RayonScheduler {
    pool: ThreadPool,
}

impl RayonScheduler {
    /// Pool with `threads` workers (0 = rayon default).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("index-sampler-{}", i))
            .build()
            .map_err(|e| IndexError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(Self { pool })
    }

    pub fn from_config(config: &IndexConfig) -> Result<Self> {
        Self::new(config.sampling_threads)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl JobScheduler for RayonScheduler {
    fn schedule(&self, job: Job) {
        self.pool.spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_immediate_runs_inline() {
        let (tx, rx) = mpsc::channel();
        ImmediateScheduler.schedule(Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_rayon_runs_jobs() {
        let scheduler = RayonScheduler::new(2).unwrap();
        assert_eq!(scheduler.threads(), 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            scheduler.schedule(Box::new(move || tx.send(i).unwrap()));
        }
        drop(tx);
        let mut got: Vec<i32> = rx.iter().collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }
}
