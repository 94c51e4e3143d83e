// MIT License
// Copyright 2023--present exttool developers

//! `exttool-server`: keep a model loaded and serve requests until SIGINT or
//! SIGTERM.

use std::time::Duration;

use clap::Parser;
use exttool_core::config::ServerConfig;
use exttool_core::rpc::server::ServerSession;

use crate::args::{parse_seconds, BackendArgs, EndpointArgs, LogArgs};

const PROGRAM: &str = "exttool-server";

/// Serve energy and gradient requests from a model loaded once
#[derive(Debug, Parser)]
#[command(name = PROGRAM, version)]
pub struct Cli {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// Worker budget: cores shared by all concurrent requests
    #[arg(
        short = 'n',
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub nthreads: u32,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    pub grace_secs: Duration,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            endpoint: self.endpoint.bind.clone(),
            workers: self.nthreads as usize,
            grace: self.grace_secs,
            ..ServerConfig::default()
        }
    }
}

pub fn run<I, S>(args: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli: Cli = match crate::parse(PROGRAM, args) {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    crate::init_logging(cli.log.verbose);
    crate::finish(PROGRAM, execute(&cli))
}

fn execute(cli: &Cli) -> anyhow::Result<()> {
    if cli.backend.list_backends {
        print!("{}", crate::backend_listing());
        return Ok(());
    }
    let session = ServerSession::start(cli.server_config(), &cli.backend.to_config())?;
    session.run_blocking()?;
    Ok(())
}
