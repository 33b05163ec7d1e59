//! Frame codec: JSON gateway envelope, the binary "Vector" varint used by DAVE
//! messages, and the 12-byte RTP header.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
  #[error("vector length header reserved bit pattern")]
  ReservedLengthPrefix,
  #[error("buffer too short: need {need} bytes, have {have}")]
  Truncated { need: usize, have: usize }
}

/// `{"op": int, "d": any, "s": int?, "t": string?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPacket {
  pub op: u8,
  #[serde(default)]
  pub d: serde_json::Value,
  #[serde(default)]
  pub s: Option<u64>,
  #[serde(default)]
  pub t: Option<String>
}

/// Encode `len` as a Vector length header (§6): top two bits of the first byte
/// select a 1/2/4-byte total width.
pub fn encode_vector_len(len: u32) -> Vec<u8> {
  if len < (1 << 6) {
    vec![len as u8]
  } else if len < (1 << 14) {
    let value = len as u16;
    vec![0b01_000000 | (value >> 8) as u8, (value & 0xFF) as u8]
  } else {
    assert!(len < (1 << 30), "vector length exceeds 2^30 - 1");
    let mut out = vec![0b10_000000 | (len >> 24) as u8];
    out.push(((len >> 16) & 0xFF) as u8);
    out.push(((len >> 8) & 0xFF) as u8);
    out.push((len & 0xFF) as u8);
    out
  }
}

/// Decode a Vector length header from the front of `buf`, returning
/// `(length, header_size)`.
pub fn decode_vector_len(buf: &[u8]) -> Result<(u32, usize), CodecError> {
  if buf.is_empty() {
    return Err(CodecError::Truncated { need: 1, have: 0 });
  }
  match buf[0] >> 6 {
    0b00 => Ok(((buf[0] & 0x3F) as u32, 1)),
    0b01 => {
      if buf.len() < 2 {
        return Err(CodecError::Truncated { need: 2, have: buf.len() });
      }
      let value = (((buf[0] & 0x3F) as u32) << 8) | buf[1] as u32;
      Ok((value, 2))
    }
    0b10 => {
      if buf.len() < 4 {
        return Err(CodecError::Truncated { need: 4, have: buf.len() });
      }
      let value = (((buf[0] & 0x3F) as u32) << 24) | ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | buf[3] as u32;
      Ok((value, 4))
    }
    _ => Err(CodecError::ReservedLengthPrefix)
  }
}

/// Encode `data` as a Vector: `length-header || data`.
pub fn encode_vector(data: &[u8]) -> Vec<u8> {
  let mut out = encode_vector_len(data.len() as u32);
  out.extend_from_slice(data);
  out
}

/// Decode a Vector from the front of `buf`, returning `(data, consumed)`.
pub fn decode_vector(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
  let (len, header_size) = decode_vector_len(buf)?;
  let len = len as usize;
  let rest = &buf[header_size..];
  if rest.len() < len {
    return Err(CodecError::Truncated { need: len, have: rest.len() });
  }
  Ok((&rest[..len], header_size + len))
}

/// Big-endian 12-byte RTP header: `0x80 0x78 seq(u16) timestamp(u32) ssrc(u32)`.
pub fn build_rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; 12] {
  let mut header = [0u8; 12];
  header[0] = 0x80;
  header[1] = 0x78;
  header[2..4].copy_from_slice(&sequence.to_be_bytes());
  header[4..8].copy_from_slice(&timestamp.to_be_bytes());
  header[8..12].copy_from_slice(&ssrc.to_be_bytes());
  header
}

/// ULEB128-encode `value`.
pub fn encode_uleb128(mut value: u32) -> Vec<u8> {
  let mut out = Vec::with_capacity(5);
  loop {
    let mut byte = (value & 0x7F) as u8;
    value >>= 7;
    if value != 0 {
      byte |= 0x80;
    }
    out.push(byte);
    if value == 0 {
      break;
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;

  #[test]
  fn vector_len_boundaries() {
    assert_eq!(encode_vector_len(0), vec![0]);
    assert_eq!(encode_vector_len(63), vec![0x3F]);
    assert_eq!(decode_vector_len(&[0x3F]).unwrap(), (63, 1));
    assert_eq!(decode_vector_len(&encode_vector_len(64)).unwrap(), (64, 2));
    assert_eq!(decode_vector_len(&encode_vector_len(16383)).unwrap(), (16383, 2));
    assert_eq!(decode_vector_len(&encode_vector_len(16384)).unwrap(), (16384, 4));
    assert_eq!(decode_vector_len(&encode_vector_len((1 << 30) - 1)).unwrap(), ((1 << 30) - 1, 4));
  }

  #[test]
  fn reserved_prefix_is_rejected() {
    assert!(matches!(decode_vector_len(&[0xC0]), Err(CodecError::ReservedLengthPrefix)));
  }

  #[test]
  fn rtp_header_layout() {
    let header = build_rtp_header(1, 960, 0xDEADBEEF);
    assert_eq!(header[0], 0x80);
    assert_eq!(header[1], 0x78);
    assert_eq!(&header[2..4], &1u16.to_be_bytes());
    assert_eq!(&header[4..8], &960u32.to_be_bytes());
    assert_eq!(&header[8..12], &0xDEADBEEFu32.to_be_bytes());
  }

  proptest! {
    #[test]
    fn vector_len_round_trips(len in 0u32..(1 << 30)) {
      let encoded = encode_vector_len(len);
      let (decoded, consumed) = decode_vector_len(&encoded).unwrap();
      prop_assert_eq!(decoded, len);
      prop_assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn vector_round_trips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
      let encoded = encode_vector(&data);
      let (decoded, consumed) = decode_vector(&encoded).unwrap();
      prop_assert_eq!(decoded, data.as_slice());
      prop_assert_eq!(consumed, encoded.len());
    }
  }
}
