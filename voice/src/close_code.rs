use std::fmt;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use self::GatewayCloseCode::*;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum GatewayCloseCode {
  UnknownOpcode,
  FailedToDecodePayload,
  NotAuthenticated,
  AuthenticationFailed,
  AlreadyAuthenticated,
  SessionNoLongerValid,
  SessionTimeout,
  ServerNotFound,
  UnknownProtocol,
  Disconnected,
  VoiceServerCrashed,
  UnknownEncryptionMode,
  CallTerminated,
  Unknown(u16)
}

impl fmt::Display for GatewayCloseCode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let code: u16 = self.into();
    write!(f, "{}", code)
  }
}

impl From<GatewayCloseCode> for u16 {
  fn from(code: GatewayCloseCode) -> u16 {
    match code {
      UnknownOpcode => 4001,
      FailedToDecodePayload => 4002,
      NotAuthenticated => 4003,
      AuthenticationFailed => 4004,
      AlreadyAuthenticated => 4005,
      SessionNoLongerValid => 4006,
      SessionTimeout => 4009,
      ServerNotFound => 4011,
      UnknownProtocol => 4012,
      Disconnected => 4014,
      VoiceServerCrashed => 4015,
      UnknownEncryptionMode => 4016,
      CallTerminated => 4022,
      Unknown(code) => code
    }
  }
}

impl<'t> From<&'t GatewayCloseCode> for u16 {
  fn from(code: &'t GatewayCloseCode) -> u16 {
    (*code).into()
  }
}

impl From<u16> for GatewayCloseCode {
  fn from(code: u16) -> GatewayCloseCode {
    match code {
      4001 => UnknownOpcode,
      4002 => FailedToDecodePayload,
      4003 => NotAuthenticated,
      4004 => AuthenticationFailed,
      4005 => AlreadyAuthenticated,
      4006 => SessionNoLongerValid,
      4009 => SessionTimeout,
      4011 => ServerNotFound,
      4012 => UnknownProtocol,
      4014 => Disconnected,
      4015 => VoiceServerCrashed,
      4016 => UnknownEncryptionMode,
      4022 => CallTerminated,
      _ => Unknown(code)
    }
  }
}

impl From<CloseCode> for GatewayCloseCode {
  fn from(code: CloseCode) -> GatewayCloseCode {
    Into::<u16>::into(code).into()
  }
}

/// What a VoiceSession should do after its WS closes, per §4.2/§7. `code` is
/// `None` when the socket dropped without a close frame at all.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum VoiceCloseAction {
  /// 4014 (kicked) / 4022 (terminated): permanent, stop the session.
  Stop,
  /// 1001, 1006, 4015, or no close code: transient, reopen and RESUME.
  Reconnect
}

pub fn voice_close_action(code: Option<u16>) -> VoiceCloseAction {
  match code {
    Some(4014) | Some(4022) => VoiceCloseAction::Stop,
    Some(1001) | Some(1006) | Some(4015) | None => VoiceCloseAction::Reconnect,
    _ => VoiceCloseAction::Stop
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kicked_and_terminated_stop() {
    assert_eq!(voice_close_action(Some(4014)), VoiceCloseAction::Stop);
    assert_eq!(voice_close_action(Some(4022)), VoiceCloseAction::Stop);
  }

  #[test]
  fn transient_codes_reconnect() {
    assert_eq!(voice_close_action(Some(1001)), VoiceCloseAction::Reconnect);
    assert_eq!(voice_close_action(Some(1006)), VoiceCloseAction::Reconnect);
    assert_eq!(voice_close_action(Some(4015)), VoiceCloseAction::Reconnect);
    assert_eq!(voice_close_action(None), VoiceCloseAction::Reconnect);
  }

  #[test]
  fn everything_else_stops() {
    assert_eq!(voice_close_action(Some(4001)), VoiceCloseAction::Stop);
    assert_eq!(voice_close_action(Some(1000)), VoiceCloseAction::Stop);
  }
}
