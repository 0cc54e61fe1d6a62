//! Bounded parallel execution of index-addressed tasks
//!
//! This crate runs a fixed number of tasks, identified by their index in `[0, task_count)`,
//! with a cap on how many of them are in flight at the same time. It is the only place where
//! rstage tools fan work out in parallel.
//!
//! # Overview
//!
//! Tasks are produced lazily by a factory closure:
//!
//! 1. The factory is called once per index, sequentially, on the caller's task, immediately before
//!    that task is dispatched. This makes it safe for the factory to mutate caller-owned state that
//!    is aligned with the task index (e.g. pushing a result slot).
//! 2. At most `max_concurrency` tasks run at the same time. When `task_count <= max_concurrency` all
//!    of them are dispatched up-front.
//! 3. Once started, a task always runs to completion. A failing task never causes other tasks to be
//!    cancelled or skipped.
//!
//! The call returns only after every dispatched task has finished.
//!
//! # Failures
//!
//! When one or more tasks fail, exactly one error is returned: the one with the **lowest task
//! index**. Every other failure is logged with `tracing::error!`. A factory error stops further
//! dispatching (tasks already in flight still finish) and is reported against the index it was
//! called for.
//!
//! # Examples
//!
//! ```rust,no_run
//! use futures::FutureExt;
//!
//! # async fn example() -> Result<(), executor::Error> {
//! // run two unrelated steps concurrently and wait for both
//! executor::run_bounded(2, 2, |index| {
//!     let task = if index == 0 {
//!         async { tokio::fs::create_dir_all("/tmp/out").await?; anyhow::Ok(()) }.boxed()
//!     } else {
//!         async { tokio::fs::write("/tmp/marker", "ok").await?; anyhow::Ok(()) }.boxed()
//!     };
//!     Ok(task)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;

/// Failure of a single task, tagged with the index it was dispatched under.
///
/// The Display implementation shows the full error chain of the task failure.
#[derive(Debug, thiserror::Error)]
#[error("task {index} failed: {source:#}")]
pub struct Error {
    pub index: usize,
    #[source]
    pub source: anyhow::Error,
}

impl Error {
    #[must_use]
    pub fn new(index: usize, source: anyhow::Error) -> Self {
        Error { index, source }
    }
}

type Joined = Result<(usize, anyhow::Result<()>), tokio::task::JoinError>;

#[derive(Debug, Default)]
struct Failures {
    lowest: Option<Error>,
    count: usize,
}

impl Failures {
    fn record(&mut self, error: Error) {
        self.count += 1;
        match &self.lowest {
            Some(lowest) if lowest.index < error.index => {
                tracing::error!("{:#}", &error);
            }
            _ => {
                if let Some(previous) = self.lowest.replace(error) {
                    tracing::error!("{:#}", &previous);
                }
            }
        }
    }

    fn record_joined(&mut self, indices: &HashMap<tokio::task::Id, usize>, joined: Joined) {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((index, Err(error))) => self.record(Error::new(index, error)),
            Err(join_error) => {
                // the task panicked, the index only survives in the id map
                let index = *indices
                    .get(&join_error.id())
                    .expect("every spawned task must have a recorded index");
                self.record(Error::new(
                    index,
                    anyhow::anyhow!("task did not run to completion: {}", join_error),
                ));
            }
        }
    }
}

/// Runs `task_count` tasks produced by `factory`, keeping at most `max_concurrency` of them in
/// flight. `max_concurrency == 0` means no limit.
///
/// Returns the failure with the lowest index if any task (or the factory) failed.
pub async fn run_bounded<F, Fut>(
    task_count: usize,
    max_concurrency: usize,
    mut factory: F,
) -> Result<(), Error>
where
    F: FnMut(usize) -> anyhow::Result<Fut>,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if task_count == 0 {
        return Ok(());
    }
    let max_width = if max_concurrency == 0 || max_concurrency > task_count {
        task_count
    } else {
        max_concurrency
    };
    tracing::debug!(
        "running {} task(s), at most {} at a time",
        task_count,
        max_width
    );
    let mut join_set = tokio::task::JoinSet::new();
    let mut indices = HashMap::with_capacity(task_count);
    let mut failures = Failures::default();
    for index in 0..task_count {
        while join_set.len() >= max_width {
            let Some(joined) = join_set.join_next().await else {
                break;
            };
            failures.record_joined(&indices, joined);
        }
        let task = match factory(index) {
            Ok(task) => task,
            Err(error) => {
                tracing::debug!("task factory failed at index {}, stop dispatching", index);
                failures.record(Error::new(index, error.context("failed preparing task")));
                break;
            }
        };
        let handle = join_set.spawn(async move { (index, task.await) });
        indices.insert(handle.id(), index);
    }
    while let Some(joined) = join_set.join_next().await {
        failures.record_joined(&indices, joined);
    }
    match failures.lowest {
        Some(error) => {
            tracing::debug!("{} of {} task(s) failed", failures.count, task_count);
            Err(error)
        }
        None => Ok(()),
    }
}
