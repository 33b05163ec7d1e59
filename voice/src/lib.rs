pub mod close_code;
pub mod codec;
pub mod constants;
pub mod crypto;
pub mod dave;
pub mod event;
pub mod opcode;
pub mod udp;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
pub use event::*;
pub use opcode::*;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};
use utils::state_flow::StateFlow;

use crate::close_code::{voice_close_action, VoiceCloseAction};
use crate::crypto::TransportMode;
use crate::dave::parser::{build_commit_welcome, build_key_package, parse_dave_message, DaveBinaryBody};
use crate::dave::session::DaveSessionManager;
use crate::udp::UdpVoiceConnection;
use crate::ws::{VoiceConnectionMode, VoiceGatewayMessage, WebSocketVoiceConnection};

#[derive(Debug, Clone)]
pub struct VoiceConnectionOptions {
  pub guild_id: u64,
  pub channel_id: u64,
  pub user_id: u64,

  pub endpoint: String,
  pub token: String,
  pub session_id: String
}

/// The per-call control/session state owned by the voice gateway client
/// (C6), per §3.
pub struct VoiceSession {
  pub options: VoiceConnectionOptions,
  pub ssrc: u32,
  pub audio_seq: u16,
  pub rtp_nonce: u32,
  pub last_seq: i64,
  pub transport_mode: Option<TransportMode>,
  pub transport_key: Option<[u8; 32]>,
  pub identified: bool
}

impl VoiceSession {
  fn new(options: VoiceConnectionOptions) -> Self {
    Self { options, ssrc: 0, audio_seq: rand::random(), rtp_nonce: rand::random(), last_seq: 0, transport_mode: None, transport_key: None, identified: false }
  }
}

pub struct VoiceConnection {
  ws: RwLock<Option<WebSocketVoiceConnection>>,
  ws_heartbeat_interval: Mutex<Option<tokio::time::Interval>>,
  udp: Mutex<Option<UdpVoiceConnection>>,
  pub session: RwLock<VoiceSession>,
  pub dave: Mutex<DaveSessionManager>,
  pub session_ready: StateFlow<bool>,
  pub dave_ready: StateFlow<bool>,
  stop_playback: AtomicBool
}

impl VoiceConnection {
  pub fn new(user_id: u64, options: VoiceConnectionOptions) -> Self {
    Self {
      ws: RwLock::new(None),
      ws_heartbeat_interval: Mutex::new(None),
      udp: Mutex::new(None),
      session: RwLock::new(VoiceSession::new(options)),
      dave: Mutex::new(DaveSessionManager::new(user_id)),
      session_ready: StateFlow::new(false),
      dave_ready: StateFlow::new(false),
      stop_playback: AtomicBool::new(false)
    }
  }

  /// Runs the handshake described in §4.2: HELLO/IDENTIFY happen inside
  /// `WebSocketVoiceConnection::new`; this drives READY, IP discovery,
  /// SELECT_PROTOCOL and SESSION_DESCRIPTION.
  pub async fn connect(&self) -> Result<()> {
    let options = self.session.read().await.options.clone();
    debug!(endpoint = %options.endpoint, "connecting to voice gateway");

    *self.ws.write().await = Some(WebSocketVoiceConnection::new(VoiceConnectionMode::New(options)).await?);

    let (heartbeat_interval, ready) = {
      let ws = self.ws.read().await;
      let ws = ws.as_ref().context("no voice gateway connection")?;
      let hello = ws.hello.as_ref().context("no voice hello packet")?;
      let ready = ws.ready.as_ref().context("no voice ready packet")?;
      (hello.heartbeat_interval, ready.clone())
    };
    *self.ws_heartbeat_interval.lock().await = Some(interval(Duration::from_millis(heartbeat_interval.round() as u64)));

    {
      let mut session = self.session.write().await;
      session.ssrc = ready.ssrc;
    }

    debug!("opening voice UDP socket");
    let udp = UdpVoiceConnection::connect(&ready).await?;
    let discovered = udp.discover_ip().await?;
    *self.udp.lock().await = Some(udp);

    let transport_mode = TransportMode::select(&ready.modes).context("server offered no supported transport mode")?;
    {
      let ws = self.ws.read().await;
      let ws = ws.as_ref().context("no voice gateway connection")?;
      ws.send_select_protocol(discovered.address, discovered.port, transport_mode.as_wire_str().to_owned()).await?;
    }

    let session_description = loop {
      let message = {
        let ws = self.ws.read().await;
        let ws = ws.as_ref().context("no voice gateway connection")?;
        ws.receive().await?
      };
      match message {
        VoiceGatewayMessage::Json(packet) => match GatewayEvent::try_from(packet)? {
          GatewayEvent::SessionDescription(description) => break description,
          other => warn!(?other, "expected SessionDescription, ignoring")
        },
        VoiceGatewayMessage::Binary(_) => continue
      }
    };

    let transport_key: [u8; 32] = session_description.secret_key.as_slice().try_into().context("secret_key must be 32 bytes")?;
    {
      let mut session = self.session.write().await;
      session.transport_mode = Some(transport_mode);
      session.transport_key = Some(transport_key);
      session.identified = true;
    }

    {
      let ws = self.ws.read().await;
      let ws = ws.as_ref().context("no voice gateway connection")?;
      ws.send_speaking(ready.ssrc).await?;
    }

    if session_description.dave_protocol_version > 0 {
      let key_package = self.dave.lock().await.generate_key_package().map_err(|error| anyhow!(error.to_string()))?;
      let ws = self.ws.read().await;
      let ws = ws.as_ref().context("no voice gateway connection")?;
      ws.send_binary(build_key_package(&key_package)).await?;
    } else {
      self.dave_ready.set(true);
    }

    self.session_ready.set(true);
    Ok(())
  }

  pub async fn reconnect(&self) -> Result<()> {
    let (options, last_seq) = {
      let session = self.session.read().await;
      (session.options.clone(), session.last_seq)
    };

    debug!("reconnecting to voice gateway");
    *self.ws.write().await = Some(WebSocketVoiceConnection::new(VoiceConnectionMode::Resume { options, last_seq }).await?);
    Ok(())
  }

  pub async fn disconnect(&self) -> Result<()> {
    self.session_ready.set(false);
    self.dave_ready.set(false);
    *self.udp.lock().await = None;

    let mut ws_lock = self.ws.write().await;
    if let Some(ws) = ws_lock.take() {
      if !ws.is_closed() {
        ws.close(None).await?;
      }
    }
    Ok(())
  }

  /// Drives the receive loop and heartbeat timer for this connection's
  /// lifetime. Dispatches DAVE staged-transition handling (§4.3) and the
  /// close-code reconnect policy (§4.2/§7).
  pub async fn run(self: Arc<Self>) -> Result<()> {
    loop {
      let close_reason = self.receive_until_closed().await?;

      match voice_close_action(close_reason) {
        VoiceCloseAction::Reconnect => {
          if let Err(error) = self.reconnect().await {
            warn!(%error, "voice gateway reconnect failed");
            return Err(error);
          }
        }
        VoiceCloseAction::Stop => {
          self.disconnect().await?;
          return Ok(());
        }
      }
    }
  }

  async fn receive_until_closed(&self) -> Result<Option<u16>> {
    loop {
      let mut interval_lock = self.ws_heartbeat_interval.lock().await;

      let message = {
        let ws = self.ws.read().await;
        let Some(ws) = ws.as_ref() else { return Ok(None) };

        tokio::select! {
          message = ws.receive() => Some(message),
          _ = async { interval_lock.as_mut().unwrap().tick().await }, if interval_lock.is_some() => {
            let seq_ack = self.session.read().await.last_seq;
            if let Err(error) = ws.send_heartbeat(seq_ack).await {
              warn!(%error, "failed to send voice heartbeat");
              None
            } else {
              None
            }
          }
        }
      };
      drop(interval_lock);

      let Some(message) = message else { continue };
      match message {
        Ok(message) => {
          if let Err(error) = self.handle_message(message).await {
            warn!(%error, "failed to handle voice gateway message");
          }
        }
        Err(error) => {
          debug!(%error, "voice gateway receive loop ended, fetching close frame");
          let close_frame = {
            let ws = self.ws.read().await;
            match ws.as_ref() {
              Some(ws) => ws.close_rx.recv_async().await.ok().flatten(),
              None => None
            }
          };
          return Ok(close_frame.map(|frame| frame.code.into()));
        }
      }
    }
  }

  async fn handle_message(&self, message: VoiceGatewayMessage) -> Result<()> {
    match message {
      VoiceGatewayMessage::Json(packet) => {
        if let Some(s) = packet.s {
          self.session.write().await.last_seq = s as i64;
        }
        match GatewayEvent::try_from(packet) {
          Ok(event) => self.handle_event(event).await,
          Err(error) => {
            warn!(%error, "failed to decode voice gateway event");
            Ok(())
          }
        }
      }
      VoiceGatewayMessage::Binary(data) => self.handle_binary(&data).await
    }
  }

  async fn handle_event(&self, event: GatewayEvent) -> Result<()> {
    match event {
      GatewayEvent::HeartbeatAck(_) => {}
      GatewayEvent::Resumed => info!("voice gateway resumed"),
      GatewayEvent::DavePrepareTransition(transition) => {
        if transition.protocol_version > 1 {
          warn!(version = transition.protocol_version, "unsupported DAVE protocol_version in PREPARE_TRANSITION");
        }
      }
      GatewayEvent::DaveTransitionReady(_) => {}
      GatewayEvent::DavePrepareEpoch(_) => {}
      GatewayEvent::DaveExecuteTransition(id) => self.execute_dave_transition(id.transition_id).await,
      GatewayEvent::DaveMlsInvalidCommitWelcome(_) => {}
      other => debug!(?other, "unhandled voice gateway event")
    }
    Ok(())
  }

  async fn execute_dave_transition(&self, transition_id: u16) {
    let executed = self.dave.lock().await.execute_transition(transition_id);
    if executed.is_some() {
      self.dave_ready.set(true);
    }
  }

  async fn handle_binary(&self, data: &[u8]) -> Result<()> {
    let message = parse_dave_message(data)?;
    match message.body {
      DaveBinaryBody::ExternalSender(package) => {
        self.dave.lock().await.set_external_sender(package.identity, package.signature_key);
      }
      DaveBinaryBody::MlsWelcome(welcome) => {
        let staged = self.dave.lock().await.stage_transition_from_welcome(welcome.transition_id, &welcome.welcome_message);
        match staged {
          Ok(()) => {
            if welcome.transition_id == 0 {
              self.execute_dave_transition(0).await;
            } else {
              let ws = self.ws.read().await;
              let ws = ws.as_ref().context("no voice gateway connection")?;
              ws.send_json(GatewayEvent::DaveTransitionReady(DaveTransitionId { transition_id: welcome.transition_id })).await?;
            }
          }
          Err(error) => warn!(%error, "failed to stage DAVE welcome transition")
        }
      }
      DaveBinaryBody::AnnounceCommitTransition(announce) => {
        let staged = self.dave.lock().await.stage_transition_from_commit(announce.transition_id, &announce.commit_message);
        if let Err(error) = staged {
          warn!(%error, "DAVE commit rejected, recovering session");
          self.recover_invalid_commit(announce.transition_id).await?;
        }
      }
      DaveBinaryBody::MlsProposals(body) => {
        let proposal_bytes = match body {
          crate::dave::parser::MlsProposalsBody::Messages(bytes) => bytes,
          crate::dave::parser::MlsProposalsBody::Refs(bytes) => bytes
        };
        let result = self.dave.lock().await.append_proposals(&proposal_bytes).map_err(|error| anyhow!(error.to_string()))?;
        if let Some(commit_and_welcome) = result {
          let ws = self.ws.read().await;
          let ws = ws.as_ref().context("no voice gateway connection")?;
          ws.send_binary(build_commit_welcome(&commit_and_welcome)).await?;
        }
      }
    }
    Ok(())
  }

  /// §7 DAVE invalid-commit recovery: reset the session, announce via
  /// DAVE_MLS_INVALID_COMMIT_WELCOME, then resend the key package.
  async fn recover_invalid_commit(&self, transition_id: u16) -> Result<()> {
    let key_package = {
      let mut dave = self.dave.lock().await;
      dave.reset_session();
      dave.generate_key_package().map_err(|error| anyhow!(error.to_string()))?
    };

    let ws = self.ws.read().await;
    let ws = ws.as_ref().context("no voice gateway connection")?;
    ws.send_json(GatewayEvent::DaveMlsInvalidCommitWelcome(DaveTransitionId { transition_id })).await?;
    ws.send_binary(build_key_package(&key_package)).await?;
    Ok(())
  }

  pub fn request_stop_playback(&self) {
    self.stop_playback.store(true, Ordering::Relaxed);
  }

  /// Streams one item's frames through the UDP sender (C5), wiring in the
  /// current transport mode/key and DAVE media key source. Returns the
  /// number of real frames transmitted, and advances `audio_seq`/`rtp_nonce`
  /// per §4.7 step 5.
  pub async fn play_item<F>(&self, mut frames: F) -> Result<usize>
  where
    F: FnMut() -> Option<Vec<u8>>
  {
    self.stop_playback.store(false, Ordering::Relaxed);

    let (transport_mode, transport_key) = {
      let session = self.session.read().await;
      (session.transport_mode.context("no transport mode negotiated")?, session.transport_key.context("no transport key negotiated")?)
    };

    let mut udp_lock = self.udp.lock().await;
    let udp = udp_lock.as_mut().context("no voice UDP socket")?;

    let dave = &self.dave;
    let sent = udp
      .stream_item(transport_mode, &transport_key, || frames(), || async { dave.lock().await.get_current_media_key() })
      .await?;

    let mut session = self.session.write().await;
    session.audio_seq = udp.sequence;
    session.rtp_nonce = udp.rtp_nonce;

    Ok(sent)
  }

  pub fn is_stopping(&self) -> bool {
    self.stop_playback.load(Ordering::Relaxed)
  }
}
