//! Entry point for the `sample` command line.
//!
//! The standard streams stay unlocked because `serve` logs to stderr from
//! worker threads.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    msgdispatch_samples::run(std::env::args_os(), &mut io::stdout(), &mut io::stderr())
}
