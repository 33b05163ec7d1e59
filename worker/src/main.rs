pub mod config;
pub mod gateway;
pub mod media;
pub mod opcode;
pub mod rest;
pub mod session;
pub mod state;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Cli, Config};
use crate::gateway::GatewayClient;
use crate::rest::RestClient;
use crate::state::State;

fn init_logging(logfile: &str, verbose: bool) -> anyhow::Result<()> {
  if let Some(parent) = std::path::Path::new(logfile).parent() {
    std::fs::create_dir_all(parent)?;
  }
  let file = std::fs::OpenOptions::new().create(true).append(true).open(logfile)?;

  let default_directive = if verbose { "info,media_extractor=debug" } else { "info" };
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

  tracing_subscriber::registry()
    .with(env_filter)
    .with(tracing_subscriber::fmt::layer())
    .with(tracing_subscriber::fmt::layer().with_writer(file).with_ansi(false))
    .init();
  Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  init_logging(&cli.logfile, cli.ydl_verbose)?;
  tracing::info!("starting up");

  let config = Config::load(&cli.env)?;
  let rest = Arc::new(RestClient::new(&config));
  let state = Arc::new(State::new());

  let gateway = GatewayClient::connect(rest, config, state).await?;
  gateway.run().await
}
