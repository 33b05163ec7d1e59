use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::GatewayPacket;
use crate::opcode::GatewayOpcode;

#[derive(Clone, Debug)]
pub enum GatewayEvent {
  Identify(Identify),
  SelectProtocol(SelectProtocol),
  Ready(Ready),
  Heartbeat(Heartbeat),
  SessionDescription(SessionDescription),
  Speaking(Speaking),
  HeartbeatAck(u64),
  Resume(Resume),
  Hello(Hello),
  Resumed,
  DavePrepareTransition(DaveTransition),
  DaveExecuteTransition(DaveTransitionId),
  DaveTransitionReady(DaveTransitionId),
  DavePrepareEpoch(DavePrepareEpoch),
  DaveMlsInvalidCommitWelcome(DaveTransitionId)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identify {
  pub server_id: u64,
  pub user_id: u64,
  pub session_id: String,
  pub token: String,
  #[serde(default)]
  pub max_dave_protocol_version: u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectProtocol {
  pub protocol: String,
  pub data: SelectProtocolData
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectProtocolData {
  pub address: String,
  pub port: u16,
  pub mode: String
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ready {
  pub ssrc: u32,
  pub ip: String,
  pub port: u16,
  pub modes: Vec<String>,
  #[serde(default)]
  pub dave_protocol_version: u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDescription {
  pub mode: String,
  pub secret_key: Vec<u8>,
  #[serde(default)]
  pub dave_protocol_version: u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Speaking {
  pub speaking: u8,
  pub delay: u32,
  pub ssrc: u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
  pub seq_ack: i64,
  pub t: u64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resume {
  pub server_id: u64,
  pub session_id: String,
  pub token: String,
  pub seq_ack: i64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
  pub heartbeat_interval: f64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaveTransitionId {
  pub transition_id: u16
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaveTransition {
  pub transition_id: u16,
  pub protocol_version: u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DavePrepareEpoch {
  pub transition_id: u16,
  pub epoch: u64
}

impl From<&GatewayEvent> for GatewayOpcode {
  fn from(event: &GatewayEvent) -> GatewayOpcode {
    use GatewayEvent::*;
    match event {
      Identify(_) => GatewayOpcode::Identify,
      SelectProtocol(_) => GatewayOpcode::SelectProtocol,
      Ready(_) => GatewayOpcode::Ready,
      Heartbeat(_) => GatewayOpcode::Heartbeat,
      SessionDescription(_) => GatewayOpcode::SessionDescription,
      Speaking(_) => GatewayOpcode::Speaking,
      HeartbeatAck(_) => GatewayOpcode::HeartbeatAck,
      Resume(_) => GatewayOpcode::Resume,
      Hello(_) => GatewayOpcode::Hello,
      Resumed => GatewayOpcode::Resumed,
      DavePrepareTransition(_) => GatewayOpcode::DavePrepareTransition,
      DaveExecuteTransition(_) => GatewayOpcode::DaveExecuteTransition,
      DaveTransitionReady(_) => GatewayOpcode::DaveTransitionReady,
      DavePrepareEpoch(_) => GatewayOpcode::DavePrepareEpoch,
      DaveMlsInvalidCommitWelcome(_) => GatewayOpcode::DaveMlsInvalidCommitWelcome
    }
  }
}

impl From<GatewayEvent> for GatewayOpcode {
  fn from(event: GatewayEvent) -> GatewayOpcode {
    (&event).into()
  }
}

impl TryFrom<GatewayPacket> for GatewayEvent {
  type Error = anyhow::Error;

  fn try_from(packet: GatewayPacket) -> Result<GatewayEvent, Self::Error> {
    use serde_json::from_value;

    use GatewayOpcode::*;

    let data = packet.d.clone();
    let opcode: GatewayOpcode = packet.op.into();
    match opcode {
      Identify => Ok(GatewayEvent::Identify(from_value(data)?)),
      SelectProtocol => Ok(GatewayEvent::SelectProtocol(from_value(data)?)),
      Ready => Ok(GatewayEvent::Ready(from_value(data)?)),
      Heartbeat => Ok(GatewayEvent::Heartbeat(from_value(data)?)),
      SessionDescription => Ok(GatewayEvent::SessionDescription(from_value(data)?)),
      Speaking => Ok(GatewayEvent::Speaking(from_value(data)?)),
      HeartbeatAck => Ok(GatewayEvent::HeartbeatAck(from_value(data)?)),
      Resume => Ok(GatewayEvent::Resume(from_value(data)?)),
      Hello => Ok(GatewayEvent::Hello(from_value(data)?)),
      Resumed => Ok(GatewayEvent::Resumed),
      DavePrepareTransition => Ok(GatewayEvent::DavePrepareTransition(from_value(data)?)),
      DaveExecuteTransition => Ok(GatewayEvent::DaveExecuteTransition(from_value(data)?)),
      DaveTransitionReady => Ok(GatewayEvent::DaveTransitionReady(from_value(data)?)),
      DavePrepareEpoch => Ok(GatewayEvent::DavePrepareEpoch(from_value(data)?)),
      DaveMlsInvalidCommitWelcome => Ok(GatewayEvent::DaveMlsInvalidCommitWelcome(from_value(data)?)),
      other => Err(anyhow::anyhow!("unsupported JSON gateway opcode: {other}")).context("decode GatewayEvent")
    }
  }
}

impl TryFrom<GatewayEvent> for GatewayPacket {
  type Error = anyhow::Error;

  fn try_from(event: GatewayEvent) -> Result<GatewayPacket, Self::Error> {
    use GatewayEvent::*;

    let op: GatewayOpcode = (&event).into();
    let d = match event {
      Identify(identify) => serde_json::to_value(identify)?,
      SelectProtocol(select_protocol) => serde_json::to_value(select_protocol)?,
      Ready(ready) => serde_json::to_value(ready)?,
      Heartbeat(heartbeat) => serde_json::to_value(heartbeat)?,
      SessionDescription(session_description) => serde_json::to_value(session_description)?,
      Speaking(speaking) => serde_json::to_value(speaking)?,
      HeartbeatAck(nonce) => serde_json::to_value(nonce)?,
      Resume(resume) => serde_json::to_value(resume)?,
      Hello(hello) => serde_json::to_value(hello)?,
      Resumed => serde_json::Value::Null,
      DavePrepareTransition(transition) => serde_json::to_value(transition)?,
      DaveExecuteTransition(tid) => serde_json::to_value(tid)?,
      DaveTransitionReady(tid) => serde_json::to_value(tid)?,
      DavePrepareEpoch(epoch) => serde_json::to_value(epoch)?,
      DaveMlsInvalidCommitWelcome(tid) => serde_json::to_value(tid)?
    };
    Ok(GatewayPacket { op: op.into(), d, s: None, t: None })
  }
}
