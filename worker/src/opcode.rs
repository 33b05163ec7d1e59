//! Main gateway opcodes, per §6.

use serde::{Deserialize, Serialize};

use self::GatewayOpcode::*;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum GatewayOpcode {
  Dispatch,
  Heartbeat,
  Identify,
  VoiceStateUpdate,
  Resume,
  Reconnect,
  InvalidSession,
  Hello,
  HeartbeatAck,
  Unknown(u8)
}

impl From<GatewayOpcode> for u8 {
  fn from(code: GatewayOpcode) -> u8 {
    match code {
      Dispatch => 0,
      Heartbeat => 1,
      Identify => 2,
      VoiceStateUpdate => 4,
      Resume => 6,
      Reconnect => 7,
      InvalidSession => 9,
      Hello => 10,
      HeartbeatAck => 11,
      Unknown(code) => code
    }
  }
}

impl From<u8> for GatewayOpcode {
  fn from(code: u8) -> GatewayOpcode {
    match code {
      0 => Dispatch,
      1 => Heartbeat,
      2 => Identify,
      4 => VoiceStateUpdate,
      6 => Resume,
      7 => Reconnect,
      9 => InvalidSession,
      10 => Hello,
      11 => HeartbeatAck,
      _ => Unknown(code)
    }
  }
}

impl Serialize for GatewayOpcode {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer
  {
    serializer.serialize_u8((*self).into())
  }
}

impl<'de> Deserialize<'de> for GatewayOpcode {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>
  {
    let value = u8::deserialize(deserializer)?;
    Ok(value.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn opcodes_round_trip() {
    for code in [0u8, 1, 2, 4, 6, 7, 9, 10, 11] {
      let opcode: GatewayOpcode = code.into();
      assert_eq!(u8::from(opcode), code);
    }
  }

  #[test]
  fn unknown_opcode_round_trips() {
    let opcode: GatewayOpcode = 99.into();
    assert_eq!(u8::from(opcode), 99);
  }
}
