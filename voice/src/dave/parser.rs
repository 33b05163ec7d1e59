//! Binary DAVE message framing (§6): `u16 sequence_number (BE) || u8 opcode || body`,
//! and the opcode-dependent bodies for 25/27/29/30.

use thiserror::Error;

use crate::codec::{decode_vector, CodecError};
#[cfg(test)]
use crate::codec::encode_vector;

#[derive(Debug, Error)]
pub enum DaveParseError {
  #[error("message too short for header")]
  ShortHeader,
  #[error("unknown DAVE binary opcode {0}")]
  UnknownOpcode(u8),
  #[error("invalid operation_type {0} for MLS_PROPOSALS, expected 0 or 1")]
  InvalidProposalsOperationType(u8),
  #[error(transparent)]
  Codec(#[from] CodecError)
}

#[derive(Debug, Clone)]
pub struct ExternalSenderPackage {
  pub signature_key: Vec<u8>,
  pub credential_type: u16,
  pub identity: Vec<u8>
}

#[derive(Debug, Clone)]
pub enum MlsProposalsBody {
  Messages(Vec<u8>),
  Refs(Vec<u8>)
}

#[derive(Debug, Clone)]
pub struct AnnounceCommitTransition {
  pub transition_id: u16,
  pub commit_message: Vec<u8>
}

#[derive(Debug, Clone)]
pub struct MlsWelcome {
  pub transition_id: u16,
  pub welcome_message: Vec<u8>
}

#[derive(Debug, Clone)]
pub enum DaveBinaryBody {
  ExternalSender(ExternalSenderPackage),
  MlsProposals(MlsProposalsBody),
  AnnounceCommitTransition(AnnounceCommitTransition),
  MlsWelcome(MlsWelcome)
}

#[derive(Debug, Clone)]
pub struct DaveBinaryMessage {
  pub sequence_number: u16,
  pub opcode: u8,
  pub body: DaveBinaryBody
}

/// Parse a server -> client binary DAVE message.
pub fn parse_dave_message(buf: &[u8]) -> Result<DaveBinaryMessage, DaveParseError> {
  if buf.len() < 3 {
    return Err(DaveParseError::ShortHeader);
  }
  let sequence_number = u16::from_be_bytes([buf[0], buf[1]]);
  let opcode = buf[2];
  let rest = &buf[3..];

  let body = match opcode {
    25 => {
      let (signature_key, consumed) = decode_vector(rest)?;
      let signature_key = signature_key.to_vec();
      let rest = &rest[consumed..];
      if rest.len() < 2 {
        return Err(DaveParseError::ShortHeader);
      }
      let credential_type = u16::from_be_bytes([rest[0], rest[1]]);
      let (identity, _) = decode_vector(&rest[2..])?;
      DaveBinaryBody::ExternalSender(ExternalSenderPackage { signature_key, credential_type, identity: identity.to_vec() })
    }
    27 => {
      if rest.is_empty() {
        return Err(DaveParseError::ShortHeader);
      }
      let operation_type = rest[0];
      let (data, _) = decode_vector(&rest[1..])?;
      match operation_type {
        0 => DaveBinaryBody::MlsProposals(MlsProposalsBody::Messages(data.to_vec())),
        1 => DaveBinaryBody::MlsProposals(MlsProposalsBody::Refs(data.to_vec())),
        other => return Err(DaveParseError::InvalidProposalsOperationType(other))
      }
    }
    29 => {
      if rest.len() < 2 {
        return Err(DaveParseError::ShortHeader);
      }
      let transition_id = u16::from_be_bytes([rest[0], rest[1]]);
      DaveBinaryBody::AnnounceCommitTransition(AnnounceCommitTransition { transition_id, commit_message: rest[2..].to_vec() })
    }
    30 => {
      if rest.len() < 2 {
        return Err(DaveParseError::ShortHeader);
      }
      let transition_id = u16::from_be_bytes([rest[0], rest[1]]);
      DaveBinaryBody::MlsWelcome(MlsWelcome { transition_id, welcome_message: rest[2..].to_vec() })
    }
    other => return Err(DaveParseError::UnknownOpcode(other))
  };

  Ok(DaveBinaryMessage { sequence_number, opcode, body })
}

/// Build a client -> server binary message: `u8 opcode || body`.
pub fn build_key_package(key_package: &[u8]) -> Vec<u8> {
  let mut out = vec![26u8];
  out.extend_from_slice(key_package);
  out
}

pub fn build_commit_welcome(commit_and_welcome: &[u8]) -> Vec<u8> {
  let mut out = vec![28u8];
  out.extend_from_slice(commit_and_welcome);
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_external_sender_package() {
    let mut frame = vec![];
    frame.extend_from_slice(&42u16.to_be_bytes());
    frame.push(25);
    frame.extend_from_slice(&encode_vector(b"sigkey"));
    frame.extend_from_slice(&77u16.to_be_bytes());
    frame.extend_from_slice(&encode_vector(b"identity-bytes"));

    let parsed = parse_dave_message(&frame).unwrap();
    assert_eq!(parsed.sequence_number, 42);
    match parsed.body {
      DaveBinaryBody::ExternalSender(pkg) => {
        assert_eq!(pkg.signature_key, b"sigkey");
        assert_eq!(pkg.credential_type, 77);
        assert_eq!(pkg.identity, b"identity-bytes");
      }
      _ => panic!("wrong variant")
    }
  }

  #[test]
  fn parses_mls_proposals_messages_and_refs() {
    for (operation_type, expect_messages) in [(0u8, true), (1u8, false)] {
      let mut frame = vec![];
      frame.extend_from_slice(&1u16.to_be_bytes());
      frame.push(27);
      frame.push(operation_type);
      frame.extend_from_slice(&encode_vector(b"payload"));

      let parsed = parse_dave_message(&frame).unwrap();
      match parsed.body {
        DaveBinaryBody::MlsProposals(MlsProposalsBody::Messages(m)) if expect_messages => assert_eq!(m, b"payload"),
        DaveBinaryBody::MlsProposals(MlsProposalsBody::Refs(r)) if !expect_messages => assert_eq!(r, b"payload"),
        _ => panic!("wrong variant for operation_type {operation_type}")
      }
    }
  }

  #[test]
  fn rejects_invalid_operation_type() {
    let mut frame = vec![];
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.push(27);
    frame.push(2);
    frame.extend_from_slice(&encode_vector(b"x"));
    assert!(matches!(parse_dave_message(&frame), Err(DaveParseError::InvalidProposalsOperationType(2))));
  }

  #[test]
  fn parses_announce_commit_transition_and_welcome() {
    let mut frame = vec![];
    frame.extend_from_slice(&9u16.to_be_bytes());
    frame.push(29);
    frame.extend_from_slice(&5u16.to_be_bytes());
    frame.extend_from_slice(b"commit-bytes");
    let parsed = parse_dave_message(&frame).unwrap();
    match parsed.body {
      DaveBinaryBody::AnnounceCommitTransition(t) => {
        assert_eq!(t.transition_id, 5);
        assert_eq!(t.commit_message, b"commit-bytes");
      }
      _ => panic!("wrong variant")
    }

    let mut frame = vec![];
    frame.extend_from_slice(&9u16.to_be_bytes());
    frame.push(30);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(b"welcome-bytes");
    let parsed = parse_dave_message(&frame).unwrap();
    match parsed.body {
      DaveBinaryBody::MlsWelcome(w) => {
        assert_eq!(w.transition_id, 0);
        assert_eq!(w.welcome_message, b"welcome-bytes");
      }
      _ => panic!("wrong variant")
    }
  }
}
