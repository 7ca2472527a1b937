//! calltape: inspect and maintain record/replay call caches
//!
//! ```text
//! calltape list
//! calltape show <fingerprint>
//! calltape recache --method fetch_user
//! calltape purge --older-than 30d
//! ```

// CLI binary: printing is the output channel
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod tracing;

use crate::tracing::TracingConfig;
use clap::Parser;

fn main() -> miette::Result<()> {
    let cli = cli::Cli::parse();

    crate::tracing::init_tracing(TracingConfig {
        format: cli.log_format,
        level: cli.log_level.into(),
        filter: cli.log_filter.clone(),
    })?;

    cli::run(cli)
}
