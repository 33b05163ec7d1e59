//! AEAD primitives: the two RTP-size transport modes (outer layer) and the
//! AES-GCM-with-truncated-tag scheme used for the per-frame E2EE layer
//! (inner layer). Kept as two distinct pure functions over
//! `(key, nonce, aad, plaintext) -> ciphertext`, per the two-layer design
//! note: the outer and inner layers must never be fused into one call site.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key as AesKey};
use chacha20poly1305::{Key as ChaChaKey, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{encode_uleb128, CodecError};

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("AEAD encryption failed")]
  Encrypt,
  #[error("AEAD decryption failed (forged or corrupt ciphertext)")]
  Decrypt,
  #[error("frame codec error: {0}")]
  Codec(#[from] CodecError)
}

/// The transport (outer) AEAD mode negotiated during SELECT_PROTOCOL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
  #[serde(rename = "aead_xchacha20_poly1305_rtpsize")]
  XChaCha20Poly1305RtpSize,
  #[serde(rename = "aead_aes256_gcm_rtpsize")]
  Aes256GcmRtpSize
}

impl TransportMode {
  pub const fn as_wire_str(self) -> &'static str {
    match self {
      TransportMode::XChaCha20Poly1305RtpSize => "aead_xchacha20_poly1305_rtpsize",
      TransportMode::Aes256GcmRtpSize => "aead_aes256_gcm_rtpsize"
    }
  }

  /// Choose the preferred mode offered by the server; AES-GCM is preferred.
  pub fn select(offered: &[String]) -> Option<TransportMode> {
    if offered.iter().any(|m| m == TransportMode::Aes256GcmRtpSize.as_wire_str()) {
      Some(TransportMode::Aes256GcmRtpSize)
    } else if offered.iter().any(|m| m == TransportMode::XChaCha20Poly1305RtpSize.as_wire_str()) {
      Some(TransportMode::XChaCha20Poly1305RtpSize)
    } else {
      None
    }
  }
}

/// Build the 24-byte RTP-size nonce: `zeros(20B) || rtp_nonce(u32 LE)`.
fn rtp_size_nonce(rtp_nonce: u32) -> [u8; 24] {
  let mut nonce = [0u8; 24];
  nonce[20..24].copy_from_slice(&rtp_nonce.to_le_bytes());
  nonce
}

/// Outer-layer encrypt: returns `ciphertext || rtp_nonce(u32 LE)` (the 4-byte
/// nonce trailer is appended by the caller per §4.5; this function returns
/// just the ciphertext so the caller controls framing).
pub fn transport_encrypt(mode: TransportMode, key: &[u8; 32], rtp_nonce: u32, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
  let full_nonce = rtp_size_nonce(rtp_nonce);
  let payload = Payload { msg: plaintext, aad };
  match mode {
    TransportMode::XChaCha20Poly1305RtpSize => {
      let cipher = XChaCha20Poly1305::new(ChaChaKey::from_slice(key));
      cipher
        .encrypt(XNonce::from_slice(&full_nonce), payload)
        .map_err(|_| CryptoError::Encrypt)
    }
    TransportMode::Aes256GcmRtpSize => {
      let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
      cipher
        .encrypt(aes_gcm::Nonce::from_slice(&full_nonce[12..24]), payload)
        .map_err(|_| CryptoError::Encrypt)
    }
  }
}

pub fn transport_decrypt(mode: TransportMode, key: &[u8; 32], rtp_nonce: u32, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
  let full_nonce = rtp_size_nonce(rtp_nonce);
  let payload = Payload { msg: ciphertext, aad };
  match mode {
    TransportMode::XChaCha20Poly1305RtpSize => {
      let cipher = XChaCha20Poly1305::new(ChaChaKey::from_slice(key));
      cipher
        .decrypt(XNonce::from_slice(&full_nonce), payload)
        .map_err(|_| CryptoError::Decrypt)
    }
    TransportMode::Aes256GcmRtpSize => {
      let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
      cipher
        .decrypt(aes_gcm::Nonce::from_slice(&full_nonce[12..24]), payload)
        .map_err(|_| CryptoError::Decrypt)
    }
  }
}

const INNER_TAG_LEN: usize = 8;
const INNER_TRAILER: [u8; 2] = [0xFA, 0xFA];

/// Build the inner (E2EE) per-frame payload per §4.5:
/// `AES-GCM(key, nonce=zeros(8)||nonce(u32 BE), aad=none, plaintext) -> ciphertext || tag[..8] || ULEB128(nonce) || supplemental_size || 0xFA 0xFA`.
pub fn e2ee_encrypt_frame(media_key: &[u8; 16], media_nonce: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
  let mut nonce_bytes = [0u8; 12];
  nonce_bytes[8..12].copy_from_slice(&media_nonce.to_be_bytes());

  let cipher = Aes256Gcm128Key::new(media_key);
  let sealed = cipher
    .encrypt(aes_gcm::Nonce::from_slice(&nonce_bytes), plaintext)
    .map_err(|_| CryptoError::Encrypt)?;

  let tag_start = sealed.len() - 16;
  let (body, full_tag) = sealed.split_at(tag_start);
  let truncated_tag = &full_tag[..INNER_TAG_LEN];
  let nonce_enc = encode_uleb128(media_nonce);
  let supplemental_size = (INNER_TAG_LEN + nonce_enc.len() + 3) as u8;

  let mut out = Vec::with_capacity(body.len() + INNER_TAG_LEN + nonce_enc.len() + 1 + 2);
  out.extend_from_slice(body);
  out.extend_from_slice(truncated_tag);
  out.extend_from_slice(&nonce_enc);
  out.push(supplemental_size);
  out.extend_from_slice(&INNER_TRAILER);
  Ok(out)
}

/// AES-128-GCM (the media key ratchet derives a 16-byte key, so this is
/// AES-128, not AES-256 as used for the outer transport layer).
struct Aes256Gcm128Key {
  inner: aes_gcm::Aes128Gcm
}

impl Aes256Gcm128Key {
  fn new(key: &[u8; 16]) -> Self {
    Self {
      inner: aes_gcm::Aes128Gcm::new(aes_gcm::Key::<aes_gcm::Aes128Gcm>::from_slice(key))
    }
  }

  fn encrypt(&self, nonce: &aes_gcm::Nonce<<aes_gcm::Aes128Gcm as aes_gcm::aead::AeadCore>::NonceSize>, plaintext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
    self.inner.encrypt(nonce, plaintext)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn aes256_gcm_rtpsize_round_trips() {
    let key = [7u8; 32];
    let aad = crate::codec::build_rtp_header(1, 960, 42);
    let plaintext = b"opus frame bytes";
    let ciphertext = transport_encrypt(TransportMode::Aes256GcmRtpSize, &key, 5, &aad, plaintext).unwrap();
    let recovered = transport_decrypt(TransportMode::Aes256GcmRtpSize, &key, 5, &aad, &ciphertext).unwrap();
    assert_eq!(recovered, plaintext);
  }

  #[test]
  fn xchacha20_rtpsize_round_trips() {
    let key = [9u8; 32];
    let aad = crate::codec::build_rtp_header(2, 1920, 42);
    let plaintext = b"more opus frame bytes";
    let ciphertext = transport_encrypt(TransportMode::XChaCha20Poly1305RtpSize, &key, 99, &aad, plaintext).unwrap();
    let recovered = transport_decrypt(TransportMode::XChaCha20Poly1305RtpSize, &key, 99, &aad, &ciphertext).unwrap();
    assert_eq!(recovered, plaintext);
  }

  #[test]
  fn wrong_nonce_fails_to_decrypt() {
    let key = [3u8; 32];
    let aad = [0u8; 12];
    let ciphertext = transport_encrypt(TransportMode::Aes256GcmRtpSize, &key, 1, &aad, b"secret").unwrap();
    assert!(transport_decrypt(TransportMode::Aes256GcmRtpSize, &key, 2, &aad, &ciphertext).is_err());
  }

  #[test]
  fn e2ee_frame_has_expected_trailer_and_size_byte() {
    let key = [1u8; 16];
    let framed = e2ee_encrypt_frame(&key, 3, b"pcm-ish opus payload").unwrap();
    assert_eq!(&framed[framed.len() - 2..], &INNER_TRAILER);
    let supplemental_size = framed[framed.len() - 3];
    assert_eq!(supplemental_size as usize, INNER_TAG_LEN + 1 /* ULEB128(3) */ + 3);
  }

  #[test]
  fn transport_mode_prefers_aes_gcm() {
    let offered = vec!["aead_xchacha20_poly1305_rtpsize".to_string(), "aead_aes256_gcm_rtpsize".to_string()];
    assert_eq!(TransportMode::select(&offered), Some(TransportMode::Aes256GcmRtpSize));
    let offered = vec!["aead_xchacha20_poly1305_rtpsize".to_string()];
    assert_eq!(TransportMode::select(&offered), Some(TransportMode::XChaCha20Poly1305RtpSize));
    assert_eq!(TransportMode::select(&[]), None);
  }
}
