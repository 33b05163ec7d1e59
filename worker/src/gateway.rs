//! Main gateway client (C7), per §4.1: START -> CONNECTING -> HELLO_WAIT ->
//! IDENTIFYING -> READY -> DISPATCH, with reconnect and invalid-session
//! recovery, plus the voice-join sub-protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use flume::{Receiver, Sender};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, RwLock as AsyncRwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use voice::VoiceConnectionOptions;

use crate::config::Config;
use crate::media::FileMediaSource;
use crate::opcode::GatewayOpcode;
use crate::rest::RestClient;
use crate::session::GuildSession;
use crate::state::State;

const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_GUILD_VOICE_STATES: u64 = 1 << 7;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

fn reconnectable(code: u16) -> bool {
  matches!(code, 1001 | 1006 | 4000..=4003 | 4005 | 4007..=4009)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPacket {
  pub op: GatewayOpcode,
  #[serde(default)]
  pub d: Value,
  #[serde(default)]
  pub s: Option<i64>,
  #[serde(default)]
  pub t: Option<String>
}

/// Owns one WebSocket connection: a background task forwards inbound frames
/// and serialises outbound sends, mirroring the voice gateway client's
/// socket-ownership idiom so reconnects are "open a new one and swap it in".
struct MainSocket {
  read: Receiver<GatewayPacket>,
  write: Sender<Message>,
  close_rx: Receiver<Option<u16>>
}

impl MainSocket {
  async fn connect(url: &str) -> Result<Self> {
    let (mut socket, _) = connect_async(url).await.context("connecting to main gateway")?;
    debug!(url, "main gateway connected");

    let (read_tx, read_rx) = flume::unbounded();
    let (write_tx, write_rx) = flume::unbounded::<Message>();
    let (close_tx, close_rx) = flume::bounded(1);

    tokio::spawn(async move {
      loop {
        tokio::select! {
          message = socket.next() => {
            match message {
              Some(Ok(Message::Text(json))) => {
                match serde_json::from_str::<GatewayPacket>(&json) {
                  Ok(packet) => { let _ = read_tx.send_async(packet).await; }
                  Err(error) => warn!(%error, "malformed main gateway JSON frame")
                }
              }
              Some(Ok(Message::Close(frame))) => {
                let _ = close_tx.send_async(frame.map(|frame| frame.code.into())).await;
                break;
              }
              Some(Ok(_)) => {}
              Some(Err(error)) => {
                warn!(%error, "main gateway read error");
                let _ = close_tx.send_async(None).await;
                break;
              }
              None => {
                let _ = close_tx.send_async(None).await;
                break;
              }
            }
          }
          message = write_rx.recv_async() => {
            let Ok(message) = message else { break };
            if let Err(error) = socket.send(message).await {
              warn!(%error, "main gateway write error");
              break;
            }
          }
        }
      }
    });

    Ok(Self { read: read_rx, write: write_tx, close_rx })
  }

  async fn send(&self, packet: &GatewayPacket) -> Result<()> {
    let json = serde_json::to_string(packet)?;
    debug!("> {}", json);
    self.write.send_async(Message::Text(json)).await.map_err(|_| anyhow!("main gateway socket closed"))
  }
}

pub struct GatewayClient {
  rest: Arc<RestClient>,
  config: Config,
  state: Arc<State>,
  socket: AsyncRwLock<MainSocket>,
  heartbeat_interval: Mutex<Option<tokio::time::Interval>>,
  last_seq: Mutex<Option<i64>>,
  session_id: Mutex<Option<String>>,
  resume_url: Mutex<Option<String>>,
  base_url: String,
  identified: AtomicBool,
  voice_state_updates: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
  voice_server_updates: Mutex<HashMap<u64, oneshot::Sender<Value>>>
}

impl GatewayClient {
  pub async fn connect(rest: Arc<RestClient>, config: Config, state: Arc<State>) -> Result<Arc<Self>> {
    let base_url = rest.get_gateway_url().await?;
    let socket = MainSocket::connect(&base_url).await?;

    Ok(Arc::new(Self {
      rest,
      config,
      state,
      socket: AsyncRwLock::new(socket),
      heartbeat_interval: Mutex::new(None),
      last_seq: Mutex::new(None),
      session_id: Mutex::new(None),
      resume_url: Mutex::new(None),
      base_url,
      identified: AtomicBool::new(false),
      voice_state_updates: Mutex::new(HashMap::new()),
      voice_server_updates: Mutex::new(HashMap::new())
    }))
  }

  fn intents() -> u64 {
    INTENT_GUILDS | INTENT_GUILD_VOICE_STATES | INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT
  }

  async fn send(&self, op: GatewayOpcode, d: Value) -> Result<()> {
    self.socket.read().await.send(&GatewayPacket { op, d, s: None, t: None }).await
  }

  async fn identify(&self) -> Result<()> {
    self
      .send(
        GatewayOpcode::Identify,
        json!({
          "token": self.config.api_token,
          "intents": Self::intents(),
          "properties": { "os": "linux", "browser": "worker", "device": "worker" }
        })
      )
      .await?;
    info!("sent IDENTIFY");
    Ok(())
  }

  async fn send_heartbeat(&self) -> Result<()> {
    let seq = *self.last_seq.lock().await;
    self.send(GatewayOpcode::Heartbeat, json!(seq)).await
  }

  /// Drives the connection for its lifetime: reconnects on transient
  /// closures, recovers from invalid sessions, runs forever on success.
  pub async fn run(self: Arc<Self>) -> Result<()> {
    loop {
      let close_code = self.receive_until_closed().await?;

      match close_code {
        Some(code) if reconnectable(code) => self.reconnect().await?,
        None => self.reconnect().await?,
        Some(code) => {
          info!(code, "main gateway closed with non-reconnectable code, stopping");
          return Ok(());
        }
      }
    }
  }

  async fn receive_until_closed(self: &Arc<Self>) -> Result<Option<u16>> {
    loop {
      let mut interval_lock = self.heartbeat_interval.lock().await;

      let message = {
        let socket = self.socket.read().await;
        tokio::select! {
          message = socket.read.recv_async() => Some(message),
          _ = async { interval_lock.as_mut().unwrap().tick().await }, if interval_lock.is_some() => {
            if let Err(error) = self.send_heartbeat().await {
              warn!(%error, "failed to send heartbeat");
            }
            None
          }
        }
      };
      drop(interval_lock);

      let Some(message) = message else { continue };
      match message {
        Ok(packet) => {
          if let Some(seq) = packet.s {
            *self.last_seq.lock().await = Some(seq);
          }
          if let Err(error) = self.handle_packet(packet).await {
            warn!(%error, "failed to handle main gateway packet");
          }
        }
        Err(_) => {
          let close_code = self.socket.read().await.close_rx.recv_async().await.ok().flatten();
          return Ok(close_code);
        }
      }
    }
  }

  async fn handle_packet(self: &Arc<Self>, packet: GatewayPacket) -> Result<()> {
    match packet.op {
      GatewayOpcode::Hello => self.handle_hello(packet.d).await,
      GatewayOpcode::HeartbeatAck => Ok(()),
      GatewayOpcode::Heartbeat => self.send_heartbeat().await,
      GatewayOpcode::Dispatch => self.clone().handle_dispatch(packet).await,
      GatewayOpcode::Reconnect => self.reconnect().await,
      GatewayOpcode::InvalidSession => self.handle_invalid_session().await,
      other => {
        debug!(?other, "unhandled main gateway opcode");
        Ok(())
      }
    }
  }

  async fn handle_hello(self: &Arc<Self>, d: Value) -> Result<()> {
    if self.identified.load(Ordering::Relaxed) {
      return Ok(());
    }

    let heartbeat_interval_ms = d.get("heartbeat_interval").and_then(Value::as_f64).context("HELLO missing heartbeat_interval")?;
    let initial_wait = Duration::from_secs_f64((heartbeat_interval_ms / 1000.0) * rand::thread_rng().gen_range(0.0..1.0));

    self.identify().await?;
    self.identified.store(true, Ordering::Relaxed);

    tokio::time::sleep(initial_wait).await;
    *self.heartbeat_interval.lock().await = Some(tokio::time::interval(Duration::from_millis(heartbeat_interval_ms as u64)));
    Ok(())
  }

  async fn handle_dispatch(self: Arc<Self>, packet: GatewayPacket) -> Result<()> {
    let Some(name) = packet.t.as_deref() else { return Ok(()) };
    debug!(name, "DISPATCH");

    match name {
      "READY" => {
        *self.session_id.lock().await = packet.d.get("session_id").and_then(Value::as_str).map(str::to_owned);
        *self.resume_url.lock().await = packet.d.get("resume_gateway_url").and_then(Value::as_str).map(str::to_owned);
      }
      "RESUMED" => info!("main gateway resumed"),
      "INTERACTION_CREATE" => {
        tokio::spawn(async move {
          if let Err(error) = self.handle_interaction(packet.d).await {
            warn!(%error, "failed to handle interaction");
          }
        });
      }
      "VOICE_STATE_UPDATE" => self.resolve_voice_state_update(packet.d).await,
      "VOICE_SERVER_UPDATE" => self.resolve_voice_server_update(packet.d).await,
      _ => {}
    }
    Ok(())
  }

  async fn resolve_voice_state_update(&self, d: Value) {
    if d.get("member").and_then(|m| m.get("user")).and_then(|u| u.get("id")).and_then(Value::as_u64) != Some(self.config.application_id) {
      return;
    }
    let Some(guild_id) = d.get("guild_id").and_then(Value::as_u64) else { return };
    if let Some(tx) = self.voice_state_updates.lock().await.remove(&guild_id) {
      let _ = tx.send(d);
    }
  }

  async fn resolve_voice_server_update(&self, d: Value) {
    let Some(guild_id) = d.get("guild_id").and_then(Value::as_u64) else { return };
    if let Some(tx) = self.voice_server_updates.lock().await.remove(&guild_id) {
      let _ = tx.send(d);
    }
  }

  async fn handle_interaction(self: Arc<Self>, interaction: Value) -> Result<()> {
    let interaction_id = interaction.get("id").and_then(Value::as_u64).context("interaction missing id")?;
    let interaction_token = interaction.get("token").and_then(Value::as_str).context("interaction missing token")?.to_owned();
    let guild_id = interaction.get("guild_id").and_then(Value::as_u64).context("interaction missing guild_id")?;
    let user_id = interaction.get("member").and_then(|m| m.get("user")).and_then(|u| u.get("id")).and_then(Value::as_u64).context("interaction missing user id")?;
    let command_name = interaction.get("data").and_then(|d| d.get("name")).and_then(Value::as_str).unwrap_or_default();

    match command_name {
      "play" => {
        let query = interaction
          .get("data")
          .and_then(|d| d.get("options"))
          .and_then(|o| o.get(0))
          .and_then(|o| o.get("value"))
          .and_then(Value::as_str)
          .unwrap_or_default()
          .to_owned();
        self.handle_play(guild_id, user_id, interaction_id, &interaction_token, query).await
      }
      "skip" => self.handle_skip(guild_id, user_id, interaction_id, &interaction_token).await,
      other => {
        warn!(command = other, "unknown slash command");
        Ok(())
      }
    }
  }

  async fn handle_play(self: Arc<Self>, guild_id: u64, user_id: u64, interaction_id: u64, interaction_token: &str, query: String) -> Result<()> {
    let Some(channel_id) = self.rest.get_user_voice_channel(guild_id, user_id).await? else {
      self.rest.respond_interaction_with_message(interaction_id, interaction_token, "You need to be in a voice channel I can join.", true).await?;
      return Ok(());
    };

    let needs_join = {
      let sessions = self.state.sessions.read().await;
      match sessions.get(&guild_id) {
        Some(session) if session.is_closed() => true,
        Some(session) if session.channel_id != channel_id => {
          self
            .rest
            .respond_interaction_with_message(interaction_id, interaction_token, "You need to be in the same channel I'm connected to.", true)
            .await?;
          return Ok(());
        }
        Some(_) => false,
        None => true
      }
    };

    if needs_join {
      let session = self.join_voice_channel(guild_id, channel_id).await?;
      self.state.sessions.write().await.insert(guild_id, session);
    }

    // Searching/downloading `query` is a producer interface the core does
    // not implement (no bundled extractor); `query` is resolved directly as
    // a path to a pre-encoded Opus file, the one concrete `MediaSource` this
    // crate ships. A real deployment swaps this resolution step for a search
    // provider without touching enqueue/acknowledge below.
    let item = match FileMediaSource::resolve(&query, &query) {
      Ok(item) => item,
      Err(error) => {
        warn!(%error, query, "failed to resolve media item");
        self.rest.respond_interaction_with_message(interaction_id, interaction_token, "Couldn't find that.", true).await?;
        return Ok(());
      }
    };

    let title = item.title.clone();
    let seconds = item.duration.as_secs();
    let sessions = self.state.sessions.read().await;
    let session = sessions.get(&guild_id).context("voice session vanished after join")?;
    session.enqueue(item)?;
    drop(sessions);

    self
      .rest
      .respond_interaction_with_message(interaction_id, interaction_token, &format!("Queued **{title}** ({seconds}s)."), true)
      .await
  }

  async fn handle_skip(&self, guild_id: u64, user_id: u64, interaction_id: u64, interaction_token: &str) -> Result<()> {
    let sessions = self.state.sessions.read().await;
    let Some(session) = sessions.get(&guild_id) else {
      return self.rest.respond_interaction_with_message(interaction_id, interaction_token, "I'm not connected in this server.", true).await;
    };
    if Some(session.channel_id) != self.rest.get_user_voice_channel(guild_id, user_id).await? {
      return self.rest.respond_interaction_with_message(interaction_id, interaction_token, "You need to be in the same channel.", true).await;
    }

    let message = if session.skip() { "Skipped" } else { "Nothing to skip" };
    self.rest.respond_interaction_with_message(interaction_id, interaction_token, message, true).await
  }

  /// §4.1's voice-join sub-protocol.
  async fn join_voice_channel(self: &Arc<Self>, guild_id: u64, channel_id: u64) -> Result<Arc<GuildSession>> {
    let (state_tx, state_rx) = oneshot::channel();
    let (server_tx, server_rx) = oneshot::channel();
    self.voice_state_updates.lock().await.insert(guild_id, state_tx);
    self.voice_server_updates.lock().await.insert(guild_id, server_tx);

    self
      .send(GatewayOpcode::VoiceStateUpdate, json!({ "guild_id": guild_id, "channel_id": channel_id, "self_mute": false, "self_deaf": true }))
      .await?;

    let state_update = state_rx.await.context("voice state update never arrived")?;
    let server_update = server_rx.await.context("voice server update never arrived")?;

    let session_id = state_update.get("session_id").and_then(Value::as_str).context("voice state update missing session_id")?.to_owned();
    let endpoint = server_update.get("endpoint").and_then(Value::as_str).context("voice server update missing endpoint")?.to_owned();
    let token = server_update.get("token").and_then(Value::as_str).context("voice server update missing token")?.to_owned();

    let options = VoiceConnectionOptions { guild_id, channel_id, user_id: self.config.application_id, endpoint, token, session_id };

    let client = self.clone();
    let session = GuildSession::connect(options, self.config.idle_timeout, move || {
      let client = client.clone();
      tokio::spawn(async move {
        let _ = client.leave_voice_channel(guild_id).await;
        client.state.sessions.write().await.remove(&guild_id);
      });
    })
    .await?;

    info!(guild_id, channel_id, "joined voice channel");
    Ok(session)
  }

  async fn leave_voice_channel(&self, guild_id: u64) -> Result<()> {
    self
      .send(GatewayOpcode::VoiceStateUpdate, json!({ "guild_id": guild_id, "channel_id": Value::Null, "self_mute": false, "self_deaf": true }))
      .await
  }

  async fn reconnect(&self) -> Result<()> {
    info!("reconnecting main gateway");
    let url = self.resume_url.lock().await.clone().unwrap_or_else(|| self.base_url.clone());

    loop {
      match MainSocket::connect(&url).await {
        Ok(socket) => {
          *self.socket.write().await = socket;
          break;
        }
        Err(error) => {
          warn!(%error, "main gateway reconnect failed, retrying in 30s");
          tokio::time::sleep(Duration::from_secs(30)).await;
        }
      }
    }

    let (session_id, last_seq) = (self.session_id.lock().await.clone(), *self.last_seq.lock().await);
    if let Some(session_id) = session_id {
      self
        .send(GatewayOpcode::Resume, json!({ "token": self.config.api_token, "session_id": session_id, "seq": last_seq }))
        .await?;
    }
    Ok(())
  }

  async fn handle_invalid_session(&self) -> Result<()> {
    info!("invalid session, opening a fresh one in 60s");
    self.identified.store(false, Ordering::Relaxed);
    *self.heartbeat_interval.lock().await = None;

    tokio::time::sleep(Duration::from_secs(60)).await;
    loop {
      match MainSocket::connect(&self.base_url).await {
        Ok(socket) => {
          *self.socket.write().await = socket;
          return Ok(());
        }
        Err(error) => {
          warn!(%error, "failed to start new session, retrying");
        }
      }
    }
  }
}
