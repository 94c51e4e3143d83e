// MIT License
// Copyright 2023--present exttool developers

//! `exttool`: load the model, compute one request, exit.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use crate::args::{BackendArgs, LogArgs, OutputArgs};

const PROGRAM: &str = "exttool";

/// Compute energy and gradient for one ORCA ExtTool request
#[derive(Debug, Parser)]
#[command(name = PROGRAM, version)]
pub struct Cli {
    /// Request descriptor written by ORCA (<basename>_EXT.extinp.tmp)
    #[arg(required_unless_present = "list_backends")]
    pub descriptor: Option<PathBuf>,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    #[command(flatten)]
    pub log: LogArgs,
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
    let descriptor = cli
        .descriptor
        .as_deref()
        .context("no request descriptor given")?;
    let config = cli.backend.to_config();
    debug!(?config, "backend configuration");
    let written = exttool_core::runner::run_standalone(descriptor, &config, cli.output.format)
        .with_context(|| format!("request {}", descriptor.display()))?;
    debug!("result in {}", written.display());
    Ok(())
}
