//! Shared library for rstage tools
//!
//! Holds the tree replication engine used to stage a source tree into an output directory, the
//! standalone symlink creation primitive it is built on, and the runtime and logging setup shared
//! by the command line tools.
//!
//! # Tree replication
//!
//! [`copy_tree`] replicates a file, symlink or directory tree in two phases:
//!
//! 1. A sequential walk of the source creating directories and replicating regular files, either
//!    by hard link or by copying contents and permissions. The first failed hard link switches the
//!    rest of the operation to copying. Symlinks are only recorded during the walk, absolute
//!    targets rewritten relative to the link's own directory.
//! 2. Once the walk succeeded, all recorded symlinks are created in parallel using
//!    [`executor::run_bounded`].
//!
//! Entries named `.DS_Store` are never replicated. Hard links are never used on Windows.
//!
//! # Errors
//!
//! Any error during the walk aborts the operation immediately. A failed hard link is not an error.
//! When the operation fails the destination must be considered to be in an unknown state.

use std::future::Future;

pub mod config;
pub mod copy;
pub mod link;
pub mod preserve;

#[cfg(all(test, unix))]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};
pub use copy::{
    CopyOperation, Summary as CopySummary, copy_dir_or_file, copy_tree, copy_using_hard_links,
};
pub use link::{LinkInfo, create_links};

fn init_logging(output: &OutputConfig) {
    let Some(level) = output.log_level() else {
        return;
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::from_level(level).into())
        .from_env_lossy();
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

/// Runs `func` to completion on a freshly built tokio runtime.
///
/// Logging is configured from `output` (`RUST_LOG` takes precedence over the verbosity level).
/// Returns `None` if the operation failed, after logging the error, unless in quiet mode.
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
    T: std::fmt::Display,
{
    init_logging(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {:#}", &error);
            return None;
        }
    };
    match tokio_runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            None
        }
    }
}
