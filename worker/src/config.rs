//! CLI surface and environment-derived configuration (C9), per §4.8.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "worker", about = "Discord-like voice-chat gateway client core")]
pub struct Cli {
  /// Enables verbose media-extractor logs.
  #[arg(short = 'v', long = "ydl-verbose")]
  pub ydl_verbose: bool,

  /// Log file path.
  #[arg(short = 'l', long = "logfile", default_value = "/tmp/meu-chapeu/meu-chapeu.log")]
  pub logfile: String,

  /// Env file to load credentials from.
  #[arg(long = "env", default_value = ".env")]
  pub env: String
}

#[derive(Debug, Clone)]
pub struct Config {
  pub api_token: String,
  pub api_version: String,
  pub api_encoding: String,
  pub api_url: String,
  pub application_id: u64,
  pub idle_timeout: Duration
}

impl Config {
  pub fn load(env_path: &str) -> anyhow::Result<Self> {
    if let Err(error) = dotenvy::from_filename(env_path) {
      tracing::debug!(%error, env_path, "no env file loaded, falling back to process environment");
    }

    let api_token = required_env("API_TOKEN")?;
    let api_version = required_env("API_VERSION")?;
    let api_encoding = required_env("API_ENCODING")?;
    let api_url = required_env("API_URL")?;
    let application_id = required_env("APPLICATION_ID")?.parse::<u64>().context("APPLICATION_ID must be a u64")?;
    let idle_timeout = std::env::var("IDLE_TIMEOUT").ok().and_then(|it| it.parse::<u64>().ok()).unwrap_or(300);

    Ok(Self { api_token, api_version, api_encoding, api_url, application_id, idle_timeout: Duration::from_secs(idle_timeout) })
  }
}

fn required_env(name: &str) -> anyhow::Result<String> {
  std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}
