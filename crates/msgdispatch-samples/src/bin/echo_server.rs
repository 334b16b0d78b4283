//! Echo server configured through `msgdispatch.toml`, `MSGDISPATCH_*`
//! variables and command-line flags.

use std::process::ExitCode;

use msgdispatch::shutdown::SystemShutdownSignal;
use msgdispatch_config::Config;
use msgdispatch_samples::{ServeError, echo, serve_until_signalled};
use ortho_config::OrthoConfig;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("echo-server: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), ServeError> {
    let config = Config::load().map_err(|source| ServeError::Configuration { source })?;
    serve_until_signalled(echo::registry()?, &config, &SystemShutdownSignal)
}
