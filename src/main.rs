//! kvd — single-threaded in-memory key/value server.
//!
//! A readiness reactor drives every client connection and periodic job on
//! one thread; see the `kvd-reactor` crate for the core. Run `kvd --help`
//! for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod server;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::KvdConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run => {
            if !cli.config.exists() {
                std::fs::write(&cli.config, b"")?;
                eprintln!(
                    "Created '{}' — run `kvd init` to see the available settings.",
                    cli.config.display()
                );
            }
            let config = config::KvdConfig::load(&cli.config)?;
            server::run(&config)?;
        }
    }

    Ok(())
}
