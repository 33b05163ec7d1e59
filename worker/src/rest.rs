//! Thin REST façade (C10), per §4.9: exactly the surface the core depends on.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;

pub struct RestClient {
  http: reqwest::Client,
  base_url: String,
  api_version: String,
  api_encoding: String,
  api_token: String,
  application_id: u64
}

impl RestClient {
  pub fn new(config: &Config) -> Self {
    Self {
      http: reqwest::Client::new(),
      base_url: format!("{}/{}", config.api_url, config.api_version),
      api_version: config.api_version.clone(),
      api_encoding: config.api_encoding.clone(),
      api_token: config.api_token.clone(),
      application_id: config.application_id
    }
  }

  fn authorization(&self) -> String {
    format!("Bot {}", self.api_token)
  }

  pub async fn get_gateway_url(&self) -> Result<String> {
    let response: Value = self
      .http
      .get(format!("{}/gateway", self.base_url))
      .header("Authorization", self.authorization())
      .send()
      .await?
      .json()
      .await?;
    let base = response.get("url").and_then(Value::as_str).context("gateway response missing url")?;
    Ok(format!("{base}?v={}&encoding={}", self.api_version, self.api_encoding))
  }

  pub async fn get_user_voice_channel(&self, guild_id: u64, user_id: u64) -> Result<Option<u64>> {
    let response: Value = self
      .http
      .get(format!("{}/guilds/{guild_id}/voice-states/{user_id}", self.base_url))
      .header("Authorization", self.authorization())
      .send()
      .await?
      .json()
      .await?;
    Ok(response.get("channel_id").and_then(Value::as_u64))
  }

  pub async fn respond_interaction_with_message(&self, interaction_id: u64, interaction_token: &str, content: &str, ephemeral: bool) -> Result<()> {
    let flags = if ephemeral { 1 << 6 } else { 0 };
    let body = json!({ "type": 4, "data": { "content": content, "flags": flags } });
    debug!(interaction_id, "responding to interaction");
    self
      .http
      .post(format!("{}/interactions/{interaction_id}/{interaction_token}/callback", self.base_url))
      .json(&body)
      .send()
      .await?;
    Ok(())
  }

  pub async fn create_slash_command(&self, name: &str, description: &str) -> Result<()> {
    let body = json!({ "name": name, "description": description, "type": 1 });
    self
      .http
      .post(format!("{}/applications/{}/commands", self.base_url, self.application_id))
      .header("Authorization", self.authorization())
      .json(&body)
      .send()
      .await?;
    Ok(())
  }
}
