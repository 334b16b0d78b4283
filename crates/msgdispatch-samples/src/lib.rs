//! Sample servers and the matching client command line.
//!
//! [`echo`] answers strings, integers and a greeting. [`sample`] computes
//! factorials, hands out device descriptors, and mirrors typed field
//! sequences back to the caller. Both are served by
//! [`serve_until_signalled`], which the `echo-server` and `sample` binaries
//! share.

mod cli;
pub mod echo;
pub mod sample;
mod server;

pub use cli::{Cli, Command, run};
pub use server::{SIGNAL_POLL_INTERVAL, ServeError, serve_until_signalled};
