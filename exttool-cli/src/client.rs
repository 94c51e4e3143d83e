// MIT License
// Copyright 2023--present exttool developers

//! `exttool-client`: forward one request to a running server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use exttool_core::config::ClientConfig;
use exttool_core::rpc::client::{run_client, RpcClient};

use crate::args::{parse_seconds, EndpointArgs, LogArgs, OutputArgs};

const PROGRAM: &str = "exttool-client";

/// Send one ORCA ExtTool request to an exttool server
#[derive(Debug, Parser)]
#[command(name = PROGRAM, version)]
pub struct Cli {
    /// Request descriptor written by ORCA (<basename>_EXT.extinp.tmp)
    #[arg(required_unless_present = "status")]
    pub descriptor: Option<PathBuf>,

    /// Print the server's status report as JSON and exit
    #[arg(long, conflicts_with = "descriptor")]
    pub status: bool,

    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// Seconds allowed for establishing the connection
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    pub connect_timeout: Duration,

    /// Seconds to wait for the result (default: no limit)
    #[arg(long, value_parser = parse_seconds)]
    pub timeout: Option<Duration>,

    #[command(flatten)]
    pub output: OutputArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl Cli {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.bind.clone(),
            connect_timeout: self.connect_timeout,
            response_timeout: self.timeout,
            ..ClientConfig::default()
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
    match &cli.descriptor {
        Some(descriptor) => {
            run_client(descriptor, cli.client_config(), cli.output.format)
                .with_context(|| format!("request {}", descriptor.display()))?;
        }
        None => {
            let status = RpcClient::new(cli.client_config())?.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
