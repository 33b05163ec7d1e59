//! UDP sender (C5): IP discovery, RTP framing, double-layer AEAD, 20-ms
//! paced transmission with a cooperative stop flag.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket, MutableKeepalivePacket};
use rand::random;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::codec::build_rtp_header;
use crate::constants::{CHUNK_DURATION, OPUS_SILENCE_FRAME, OPUS_SILENCE_FRAME_COUNT, TIMESTAMP_STEP};
use crate::crypto::{transport_encrypt, TransportMode};
use crate::dave::session::MediaKey;
use crate::event::Ready;

#[derive(Debug)]
pub struct IpDiscoveryResult {
  pub address: String,
  pub port: u16
}

pub struct UdpVoiceConnection {
  pub socket: UdpSocket,
  pub ssrc: u32,
  pub sequence: u16,
  pub timestamp: u32,
  pub rtp_nonce: u32,
  pub heartbeat_time: Instant,
  pub deadline: Instant,
  /// Observed between packets: lets the player skip the remainder of an
  /// item without closing the socket.
  pub stop: AtomicBool
}

impl UdpVoiceConnection {
  pub async fn connect(ready: &Ready) -> Result<Self> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((ready.ip.as_str(), ready.port)).await?;

    Ok(Self {
      socket,
      ssrc: ready.ssrc,
      sequence: random(),
      timestamp: random(),
      rtp_nonce: random(),
      heartbeat_time: Instant::now(),
      deadline: Instant::now(),
      stop: AtomicBool::new(false)
    })
  }

  pub fn request_stop(&self) {
    self.stop.store(true, Ordering::Relaxed);
  }

  pub fn clear_stop(&self) {
    self.stop.store(false, Ordering::Relaxed);
  }

  pub async fn discover_ip(&self) -> Result<IpDiscoveryResult> {
    let mut buffer = [0u8; IpDiscoveryPacket::const_packet_size()];
    let mut view = MutableIpDiscoveryPacket::new(&mut buffer).context("build IP discovery packet")?;
    view.set_pkt_type(IpDiscoveryType::Request);
    view.set_length(70);
    view.set_ssrc(self.ssrc);
    self.socket.send(&buffer).await?;

    let (length, _address) = self.socket.recv_from(&mut buffer).await?;
    let view = IpDiscoveryPacket::new(&buffer[..length]).context("parse IP discovery response")?;
    if view.get_pkt_type() != IpDiscoveryType::Response {
      return Err(anyhow!("unexpected IP discovery packet type"));
    }

    let raw_address = view.get_address_raw();
    let null_index = raw_address.iter().position(|&b| b == 0).unwrap_or(raw_address.len());
    let address = std::str::from_utf8(&raw_address[..null_index])?;
    IpAddr::from_str(address)?;

    Ok(IpDiscoveryResult { address: address.to_owned(), port: view.get_port() })
  }

  pub async fn send_keepalive(&mut self) -> Result<()> {
    let mut buffer = [0u8; MutableKeepalivePacket::minimum_packet_size()];
    let mut view = MutableKeepalivePacket::new(&mut buffer).context("build keepalive packet")?;
    view.set_ssrc(self.ssrc);

    self.heartbeat_time = Instant::now();
    self.socket.send(&buffer).await?;
    debug!("sent UDP keepalive");
    Ok(())
  }

  /// Frames, encrypts and paces a single outbound packet. `media_key` is
  /// `Some` iff E2EE is active for this payload.
  async fn send_frame(&mut self, transport_mode: TransportMode, transport_key: &[u8; 32], payload: &[u8]) -> Result<()> {
    let header = build_rtp_header(self.sequence, self.timestamp, self.ssrc);
    self.sequence = self.sequence.wrapping_add(1);
    self.timestamp = self.timestamp.wrapping_add(TIMESTAMP_STEP);

    let rtp_nonce = self.rtp_nonce;
    self.rtp_nonce = self.rtp_nonce.wrapping_add(1);

    let ciphertext = transport_encrypt(transport_mode, transport_key, rtp_nonce, &header, payload)?;

    let mut datagram = Vec::with_capacity(header.len() + ciphertext.len() + 4);
    datagram.extend_from_slice(&header);
    datagram.extend_from_slice(&ciphertext);
    datagram.extend_from_slice(&rtp_nonce.to_le_bytes());

    spin_sleep::sleep(self.deadline.saturating_duration_since(Instant::now()));
    let delta = Instant::now().saturating_duration_since(self.deadline);
    self.deadline = Instant::now() + CHUNK_DURATION;

    match self.socket.send(&datagram).await {
      Ok(_) => {}
      Err(error) if error.kind() == std::io::ErrorKind::NotConnected || error.kind() == std::io::ErrorKind::ConnectionRefused => {
        // Socket torn down mid-stream is a normal end-of-stream, not an error.
        return Ok(());
      }
      Err(error) => return Err(error.into())
    }

    if delta > CHUNK_DURATION {
      warn!("voice packet deadline exceeded by {:?}", delta - CHUNK_DURATION);
    }

    Ok(())
  }

  /// Streams one item's frames, applying inner E2EE via `media_key_source`
  /// when it yields a key, then appends the trailing silence frames.
  /// Returns the number of real frames actually transmitted (excludes
  /// silence).
  pub async fn stream_item<F, M, MF>(
    &mut self,
    transport_mode: TransportMode,
    transport_key: &[u8; 32],
    mut frames: F,
    mut media_key_source: M
  ) -> Result<usize>
  where
    F: FnMut() -> Option<Vec<u8>>,
    M: FnMut() -> MF,
    MF: std::future::Future<Output = Option<MediaKey>>
  {
    self.clear_stop();
    self.deadline = Instant::now();

    let mut sent = 0usize;
    while let Some(frame) = frames() {
      if self.stop.load(Ordering::Relaxed) {
        break;
      }

      let payload = match media_key_source().await {
        Some(media_key) => crate::crypto::e2ee_encrypt_frame(&media_key.key, media_key.nonce, &frame)?,
        None => frame
      };

      self.send_frame(transport_mode, transport_key, &payload).await?;
      sent += 1;
    }

    for _ in 0..OPUS_SILENCE_FRAME_COUNT {
      self.send_frame(transport_mode, transport_key, &OPUS_SILENCE_FRAME).await?;
    }

    Ok(sent)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::TransportMode;

  async fn connected_pair() -> (UdpSocket, UdpSocket) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.connect(b.local_addr().unwrap()).await.unwrap();
    b.connect(a.local_addr().unwrap()).await.unwrap();
    (a, b)
  }

  /// §8: sequence/timestamp advance by exactly one step per transmitted
  /// packet (real or trailing silence), and wrap modularly rather than
  /// panicking at the integer boundary.
  #[tokio::test]
  async fn sequence_and_timestamp_advance_once_per_packet_and_wrap() {
    let (socket, _peer) = connected_pair().await;
    let start_sequence = u16::MAX - 1;
    let start_timestamp = u32::MAX - TIMESTAMP_STEP;
    let mut conn = UdpVoiceConnection {
      socket,
      ssrc: 1,
      sequence: start_sequence,
      timestamp: start_timestamp,
      rtp_nonce: 0,
      heartbeat_time: Instant::now(),
      deadline: Instant::now(),
      stop: AtomicBool::new(false)
    };

    let mut frames = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()].into_iter();
    let sent = conn.stream_item(TransportMode::XChaCha20Poly1305RtpSize, &[7u8; 32], || frames.next(), || async { None }).await.unwrap();

    assert_eq!(sent, 3);
    let total_packets = 3 + OPUS_SILENCE_FRAME_COUNT as u16;
    assert_eq!(conn.sequence, start_sequence.wrapping_add(total_packets));
    assert_eq!(conn.timestamp, start_timestamp.wrapping_add(TIMESTAMP_STEP * total_packets as u32));
  }

  /// §8: every transmitted packet, including silence, consumes a distinct
  /// `rtp_nonce` — strictly monotonic (mod 2^32), never reused.
  #[tokio::test]
  async fn rtp_nonce_is_unique_per_packet_and_wraps() {
    let (socket, _peer) = connected_pair().await;
    let start_nonce = u32::MAX - 2;
    let mut conn = UdpVoiceConnection {
      socket,
      ssrc: 1,
      sequence: 0,
      timestamp: 0,
      rtp_nonce: start_nonce,
      heartbeat_time: Instant::now(),
      deadline: Instant::now(),
      stop: AtomicBool::new(false)
    };

    let mut frames = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()].into_iter();
    conn.stream_item(TransportMode::XChaCha20Poly1305RtpSize, &[9u8; 32], || frames.next(), || async { None }).await.unwrap();

    let total_packets = 4 + OPUS_SILENCE_FRAME_COUNT as u32;
    assert_eq!(conn.rtp_nonce, start_nonce.wrapping_add(total_packets));
  }

  #[tokio::test]
  async fn request_stop_sets_flag_and_clear_stop_resets_it() {
    let (socket, _peer) = connected_pair().await;
    let conn = UdpVoiceConnection {
      socket,
      ssrc: 1,
      sequence: 0,
      timestamp: 0,
      rtp_nonce: 0,
      heartbeat_time: Instant::now(),
      deadline: Instant::now(),
      stop: AtomicBool::new(false)
    };

    assert!(!conn.stop.load(Ordering::Relaxed));
    conn.request_stop();
    assert!(conn.stop.load(Ordering::Relaxed));
    conn.clear_stop();
    assert!(!conn.stop.load(Ordering::Relaxed));
  }
}
