// MIT License
// Copyright 2023--present exttool developers

//! Entry points behind the `exttool`, `exttool-server` and `exttool-client`
//! binaries.
//!
//! Each command parses its arguments, sets up logging on stderr and returns
//! the process exit code. Codes follow [`Status`]: 0 means a result file was
//! written, anything else names the failure category.

pub mod args;
pub mod client;
pub mod server;
pub mod standalone;

use clap::error::ErrorKind;
use clap::Parser;
use exttool_core::{backends, BackendFamily, BridgeError, Status};
use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` takes precedence over
/// `verbose`.
pub fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // a second call (several commands in one test process) keeps the first
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Text printed by `--list-backends`.
pub fn backend_listing() -> String {
    BackendFamily::ALL
        .into_iter()
        .map(|family| backends::describe(family) + "\n")
        .collect()
}

/// Exit status for an error returned by a command.
pub fn exit_status(error: &anyhow::Error) -> Status {
    error
        .downcast_ref::<BridgeError>()
        .map_or(Status::InternalError, BridgeError::status)
}

/// Parse `args` (without the program name) as `T`. Help and version requests
/// are printed and yield `Err(0)`; usage errors yield `Err(64)`.
fn parse<T, I, S>(program: &str, args: I) -> Result<T, i32>
where
    T: Parser,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once(program.to_string()).chain(args.into_iter().map(Into::into));
    T::try_parse_from(full_args).map_err(|err| match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{err}");
            Status::Success.code()
        }
        _ => {
            eprint!("{err}");
            Status::Usage.code()
        }
    })
}

/// Turn a command outcome into an exit code, printing the diagnostic.
fn finish(program: &str, outcome: anyhow::Result<()>) -> i32 {
    match outcome {
        Ok(()) => Status::Success.code(),
        Err(error) => {
            let status = exit_status(&error);
            eprintln!("{program}: error: {error:#}");
            status.code()
        }
    }
}
