// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fan-out of independent per-file work over a fixed size worker pool.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result};
use log::{error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

#[derive(Debug, Clone, Default)]
/// Shared flag asking all running work to stop.
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask all holders of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// If `cancel` was called on any clone of this token.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Cancel this token when the process receives Ctrl-C.
    ///
    /// # Errors
    /// Fails if a handler is already installed.
    pub fn cancel_on_ctrlc(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, stopping after the current units of work.");
            token.cancel();
        })
        .context("Unable to install Ctrl-C handler.")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a unit of work that did not fail ended.
pub enum Unit {
    /// Work was done.
    Done,
    /// Nothing needed doing, e.g. the output already existed.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Counts of how the units of a batch ended.
pub struct BatchSummary {
    /// Units that did their work.
    pub succeeded: usize,
    /// Units with nothing to do.
    pub skipped: usize,
    /// Units that returned an error.
    pub failed: usize,
    /// Units never started because the batch was cancelled.
    pub not_started: usize,
}

impl BatchSummary {
    /// Write the summary as a single info line.
    pub fn log(&self, label: &str) {
        info!(
            "{label}: {} done, {} skipped, {} failed, {} not started.",
            self.succeeded, self.skipped, self.failed, self.not_started
        );
    }
}

#[derive(Debug)]
/// Fixed size worker pool with a shared cancel token.
pub struct WorkerPool {
    /// Threads executing the units.
    pool: ThreadPool,
    /// Checked before every unit of work.
    cancel: CancelToken,
}

impl WorkerPool {
    /// Build a pool with `jobs` threads, or one per CPU when `None`.
    ///
    /// # Errors
    /// Fails if the threads can not be spawned.
    pub fn new(jobs: Option<usize>, cancel: CancelToken) -> Result<Self> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("framesmith-{i}"));
        if let Some(jobs) = jobs {
            builder = builder.num_threads(jobs);
        }
        let pool = builder.build().context("Unable to start worker pool.")?;
        Ok(Self { pool, cancel })
    }

    /// The token units should poll during long running work.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` inside the pool so rayon parallel iterators use its threads.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }

    /// Run `work` once per item. A failing unit is logged and counted,
    /// never aborting the rest of the batch. There is no ordering between units.
    pub fn run<T, F>(&self, items: &[T], work: F) -> BatchSummary
    where
        T: AsRef<Path> + Sync,
        F: Fn(&T) -> Result<Unit> + Sync,
    {
        let succeeded = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let not_started = AtomicUsize::new(0);

        self.pool.install(|| {
            items.par_iter().for_each(|item| {
                if self.cancel.is_cancelled() {
                    not_started.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match work(item) {
                    Ok(Unit::Done) => succeeded.fetch_add(1, Ordering::Relaxed),
                    Ok(Unit::Skipped) => skipped.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        error!("Failed on {}: {e:#}", item.as_ref().display());
                        failed.fetch_add(1, Ordering::Relaxed)
                    }
                };
            });
        });

        BatchSummary {
            succeeded: succeeded.into_inner(),
            skipped: skipped.into_inner(),
            failed: failed.into_inner(),
            not_started: not_started.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::bail;

    use super::*;

    fn items(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("item-{i}"))).collect()
    }

    #[test]
    fn failures_do_not_abort_the_batch() {
        let pool = WorkerPool::new(Some(3), CancelToken::new()).unwrap();
        let summary = pool.run(&items(10), |item| {
            let n: usize = item.to_string_lossy()[5..].parse()?;
            match n % 3 {
                0 => bail!("unit {n} failed"),
                1 => Ok(Unit::Skipped),
                _ => Ok(Unit::Done),
            }
        });
        assert_eq!(
            summary,
            BatchSummary {
                succeeded: 3,
                skipped: 3,
                failed: 4,
                not_started: 0
            }
        );
    }

    #[test]
    fn cancelled_pool_starts_nothing() {
        let cancel = CancelToken::new();
        let pool = WorkerPool::new(Some(2), cancel.clone()).unwrap();
        cancel.cancel();
        let summary = pool.run(&items(5), |_| Ok(Unit::Done));
        assert_eq!(summary.not_started, 5);
        assert_eq!(summary.succeeded, 0);
    }
}
