//! Voice gateway client (C6): per-call WS state machine (HELLO -> IDENTIFY
//! -> READY -> SELECT_PROTOCOL -> SESSION_DESCRIPTION -> (DAVE) ->
//! streaming), resume-on-close, DAVE opcode dispatch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use flume::{Receiver, Sender};
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use crate::codec::GatewayPacket;
use crate::event::*;
use crate::VoiceConnectionOptions;

/// Either a JSON control-channel packet or a raw binary DAVE frame, as they
/// arrive interleaved on the same socket.
#[derive(Debug, Clone)]
pub enum VoiceGatewayMessage {
  Json(GatewayPacket),
  Binary(Vec<u8>)
}

pub struct WebSocketVoiceConnection {
  pub read: Receiver<VoiceGatewayMessage>,
  write: Sender<Message>,
  close_tx: Sender<Option<CloseFrame<'static>>>,
  pub close_rx: Receiver<Option<CloseFrame<'static>>>,

  pub options: VoiceConnectionOptions,
  pub hello: Option<Hello>,
  pub ready: Option<Ready>,
  last_seq: AtomicI64
}

pub enum VoiceConnectionMode {
  New(VoiceConnectionOptions),
  Resume { options: VoiceConnectionOptions, last_seq: i64 }
}

impl WebSocketVoiceConnection {
  pub async fn new(mode: VoiceConnectionMode) -> Result<Self> {
    let options = match &mode {
      VoiceConnectionMode::New(options) => options,
      VoiceConnectionMode::Resume { options, .. } => options
    };

    let (mut socket, _) = connect_async(format!("wss://{}/?v=8", options.endpoint)).await?;
    debug!("voice gateway connected");

    let (read_tx, read_rx) = flume::unbounded();
    let (write_tx, write_rx) = flume::unbounded::<Message>();
    let (close_tx_tx, close_tx_rx) = flume::bounded::<Option<CloseFrame<'static>>>(1);
    let (close_rx_tx, close_rx_rx) = flume::bounded(1);

    tokio::spawn(async move {
      loop {
        select! {
          message = socket.next() => {
            match message {
              Some(Ok(Message::Text(json))) => {
                debug!("< {}", json);
                match serde_json::from_str::<GatewayPacket>(&json) {
                  Ok(packet) => { let _ = read_tx.send_async(VoiceGatewayMessage::Json(packet)).await; }
                  Err(error) => warn!(%error, "malformed voice gateway JSON frame")
                }
              }
              Some(Ok(Message::Binary(data))) => {
                let _ = read_tx.send_async(VoiceGatewayMessage::Binary(data)).await;
              }
              Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "voice gateway closed");
                let _ = close_rx_tx.send_async(frame).await;
                break;
              }
              Some(Ok(_)) => {}
              Some(Err(error)) => {
                warn!(%error, "voice gateway read error");
                let _ = close_rx_tx.send_async(None).await;
                break;
              }
              None => {
                let _ = close_rx_tx.send_async(None).await;
                break;
              }
            }
          }

          message = write_rx.recv_async() => {
            let Ok(message) = message else { break };
            if let Err(error) = socket.send(message).await {
              warn!(%error, "voice gateway write error");
              break;
            }
          }

          frame = close_tx_rx.recv_async() => {
            let Ok(frame) = frame else { break };
            let _ = socket.close(frame).await;
            break;
          }
        }
      }
    });

    let mut me = Self {
      read: read_rx,
      write: write_tx,
      close_tx: close_tx_tx,
      close_rx: close_rx_rx,
      options: options.to_owned(),
      hello: None,
      ready: None,
      last_seq: AtomicI64::new(0)
    };

    match mode {
      VoiceConnectionMode::New(_) => {
        let mut hello = None;
        let mut ready = None;
        while hello.is_none() || ready.is_none() {
          match me.receive_json().await?.try_into()? {
            GatewayEvent::Hello(it) => {
              hello = Some(it);
              me.send_identify().await?;
            }
            GatewayEvent::Ready(it) => ready = Some(it),
            other => warn!(?other, "expected Hello or Ready during connect")
          }
        }
        me.hello = hello;
        me.ready = ready;
      }
      VoiceConnectionMode::Resume { last_seq, .. } => {
        me.last_seq.store(last_seq, Ordering::Relaxed);
        me.send_resume(last_seq).await?;
        loop {
          match me.receive_json().await?.try_into()? {
            GatewayEvent::Hello(it) => me.hello = Some(it),
            GatewayEvent::Resumed => break,
            GatewayEvent::Ready(it) => me.ready = Some(it),
            other => warn!(?other, "unexpected event while resuming")
          }
        }
      }
    }

    Ok(me)
  }

  pub async fn send_identify(&self) -> Result<()> {
    self
      .send_json(GatewayEvent::Identify(Identify {
        server_id: self.options.guild_id,
        user_id: self.options.user_id,
        session_id: self.options.session_id.clone(),
        token: self.options.token.clone(),
        max_dave_protocol_version: 1
      }))
      .await
  }

  pub async fn send_resume(&self, last_seq: i64) -> Result<()> {
    self
      .send_json(GatewayEvent::Resume(Resume {
        server_id: self.options.guild_id,
        session_id: self.options.session_id.clone(),
        token: self.options.token.clone(),
        seq_ack: last_seq
      }))
      .await
  }

  pub async fn send_speaking(&self, ssrc: u32) -> Result<()> {
    self.send_json(GatewayEvent::Speaking(Speaking { speaking: 1, delay: 0, ssrc })).await
  }

  pub async fn send_select_protocol(&self, address: String, port: u16, mode: String) -> Result<()> {
    self
      .send_json(GatewayEvent::SelectProtocol(SelectProtocol { protocol: "udp".to_owned(), data: SelectProtocolData { address, port, mode } }))
      .await
  }

  pub async fn send_heartbeat(&self, seq_ack: i64) -> Result<()> {
    let t = u64::try_from(SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?.as_millis())?;
    self.send_json(GatewayEvent::Heartbeat(Heartbeat { seq_ack, t })).await
  }

  pub async fn send_json(&self, event: GatewayEvent) -> Result<()> {
    let packet: GatewayPacket = event.try_into()?;
    let json = serde_json::to_string(&packet)?;
    debug!("> {}", json);
    self.write.send_async(Message::Text(json)).await?;
    Ok(())
  }

  pub async fn send_binary(&self, frame: Vec<u8>) -> Result<()> {
    self.write.send_async(Message::Binary(frame)).await?;
    Ok(())
  }

  async fn receive_json(&self) -> Result<GatewayPacket> {
    loop {
      match self.read.recv_async().await? {
        VoiceGatewayMessage::Json(packet) => {
          if let Some(s) = packet.s {
            self.last_seq.store(s as i64, Ordering::Relaxed);
          }
          return Ok(packet);
        }
        VoiceGatewayMessage::Binary(_) => continue
      }
    }
  }

  pub async fn receive(&self) -> Result<VoiceGatewayMessage> {
    let message = self.read.recv_async().await?;
    if let VoiceGatewayMessage::Json(ref packet) = message {
      if let Some(s) = packet.s {
        self.last_seq.store(s as i64, Ordering::Relaxed);
      }
    }
    Ok(message)
  }

  pub fn last_seq(&self) -> i64 {
    self.last_seq.load(Ordering::Relaxed)
  }

  pub fn is_closed(&self) -> bool {
    self.write.is_disconnected()
  }

  pub async fn close(&self, frame: Option<CloseFrame<'_>>) -> Result<()> {
    self.close_tx.send_async(frame.map(|frame| frame.into_owned())).await.map_err(|_| anyhow!("voice gateway already closed"))
  }
}
