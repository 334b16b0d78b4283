//! Command line for the sample service: `sample <socket> serve` runs the
//! server, `sample <socket> fact <n>` asks a running one for `n!`.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{self, PathBuf};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use thiserror::Error;

use msgdispatch::shutdown::SystemShutdownSignal;
use msgdispatch::{ConnectionError, ServiceEndpoint};
use msgdispatch_config::Config;

use crate::sample::{self, Reply, SampleClient};
use crate::server::{ServeError, serve_until_signalled};

/// Exit status for failures that never reached a server reply.
const EXIT_TRANSPORT: u8 = 2;

/// Parsed `sample` arguments.
#[derive(Debug, Parser)]
#[command(name = "sample", about = "Sample message dispatch service and client")]
pub struct Cli {
    /// Socket path. Relative paths resolve against the working directory.
    pub socket: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

/// Action taken against the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Serve the sample handlers until SIGTERM or SIGINT.
    Serve,
    /// Print `n!` as computed by the server. Exits with the server's error
    /// code when it refuses.
    Fact {
        #[arg(allow_negative_numbers = true)]
        n: i32,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("socket path {0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("failed to resolve socket path: {0}")]
    Resolve(#[source] io::Error),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("request failed: {0}")]
    Request(#[from] ConnectionError),
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

/// Runs the `sample` command line, writing results to `stdout` and
/// diagnostics to `stderr`.
pub fn run<I, T, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => {
            let rendered = error.render().to_string();
            let _ = if error.use_stderr() {
                write!(stderr, "{rendered}")
            } else {
                write!(stdout, "{rendered}")
            };
            return ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(u8::MAX));
        }
    };

    match execute(&cli, stdout) {
        Ok(code) => code,
        Err(error) => {
            let _ = writeln!(stderr, "sample: {error}");
            ExitCode::from(EXIT_TRANSPORT)
        }
    }
}

fn execute<W: Write>(cli: &Cli, stdout: &mut W) -> Result<ExitCode, CliError> {
    let endpoint = resolve_endpoint(&cli.socket)?;
    match cli.command {
        Command::Serve => {
            let config = Config {
                service_socket: endpoint,
                ..Config::default()
            };
            let registry = sample::registry().map_err(ServeError::from)?;
            serve_until_signalled(registry, &config, &SystemShutdownSignal)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Fact { n } => match SampleClient::new(endpoint).factorial(n)? {
            Reply::Value(value) => {
                writeln!(stdout, "{value}").map_err(CliError::Output)?;
                Ok(ExitCode::SUCCESS)
            }
            Reply::Error(code) => Ok(ExitCode::from(refusal_status(code))),
        },
    }
}

// A refusal must never look like success, even when the server sends 0.
fn refusal_status(code: u16) -> u8 {
    match u8::try_from(code) {
        Ok(0) => 1,
        Ok(status) => status,
        Err(_) => u8::MAX,
    }
}

fn resolve_endpoint(socket: &std::path::Path) -> Result<ServiceEndpoint, CliError> {
    let absolute = path::absolute(socket).map_err(CliError::Resolve)?;
    let utf8 = Utf8PathBuf::from_path_buf(absolute).map_err(CliError::NonUtf8Path)?;
    Ok(ServiceEndpoint::path(utf8))
}
