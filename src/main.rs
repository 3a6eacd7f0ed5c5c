use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use crate::{
    cli::{Cli, Command},
    server::ServeConfig,
};

mod cli;
mod identifier;
mod logging;
mod registry;
mod resolver;
mod server;

fn main() -> anyhow::Result<ExitCode> {
    let args = Cli::parse();
    logging::init_logging();

    match args.command {
        Command::Serve { bind, registry } => {
            let config = ServeConfig {
                bind,
                registry: registry.into(),
            };
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?
                .block_on(server::serve(config))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Parse { arks } => cli::run_parse(&arks),
        Command::Resolve { arks, registry } => cli::run_resolve(&arks, registry),
    }
}
