use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rstage",
    version,
    about = "Stage a file or directory tree into an output location, hard-linking files where possible",
    long_about = "`rstage` replicates a file or directory tree into an output location.

Regular files are copied, or hard-linked when --hard-links is given and the filesystem allows it.
Symlinks are recreated with absolute targets rewritten to relative ones. `.DS_Store` files are
never staged.

EXAMPLE:
    # Stage a build directory into a package root, hard-linking files
    rstage --hard-links build/assets out/pkg/assets --summary

    # Stage into an existing directory (note the trailing slash)
    rstage build/assets out/pkg/"
)]
struct Args {
    // Staging options
    /// Hard-link regular files instead of copying them
    ///
    /// Once a hard link fails (e.g. across filesystems) the remaining files are copied. Ignored on
    /// platforms without hard link support.
    #[arg(short = 'l', long = "hard-links", help_heading = "Staging options")]
    hard_links: bool,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// File or directory to stage
    #[arg()]
    src: PathBuf,

    /// Destination path, a trailing slash stages into the directory under the source's name
    #[arg()]
    dst: String,
}

fn resolve_destination(src: &Path, dst: &str) -> Result<PathBuf> {
    if dst.ends_with('/') {
        let src_name = src
            .file_name()
            .with_context(|| format!("source {:?} does not have a basename", src))?;
        Ok(PathBuf::from(dst).join(src_name))
    } else {
        Ok(PathBuf::from(dst))
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<common::CopySummary> {
    let dst = resolve_destination(&args.src, &args.dst)?;
    tracing::info!("staging {:?} -> {:?}", &args.src, &dst);
    common::copy_tree(&args.src, &dst, args.hard_links)
        .await
        .map_err(|error| anyhow!("{}", error))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
