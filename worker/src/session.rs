//! Media queue + player loop (C8), per §4.7: one FIFO queue per
//! [`voice::VoiceConnection`], an idle timer, and a player loop that streams
//! items through the voice sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use flume::{Receiver, Sender};
use tracing::{info, warn};
use voice::{VoiceConnection, VoiceConnectionOptions};

use crate::media::MediaItem;

/// Per-guild voice session: the underlying gateway/UDP connection, plus the
/// queue and player loop that feed it.
pub struct GuildSession {
  pub connection: Arc<VoiceConnection>,
  pub channel_id: u64,
  queue_tx: Sender<MediaItem>,
  closed: AtomicBool
}

impl GuildSession {
  /// Connects the voice session and starts its receive and player loops.
  /// `on_close` is invoked once the session stops for any reason (§4.1's
  /// voice-join sub-protocol close-callback).
  pub async fn connect<F>(options: VoiceConnectionOptions, idle_timeout: std::time::Duration, on_close: F) -> Result<Arc<Self>>
  where
    F: FnOnce() + Send + 'static
  {
    let channel_id = options.channel_id;
    let user_id = options.user_id;
    let connection = Arc::new(VoiceConnection::new(user_id, options));
    connection.connect().await?;

    let (queue_tx, queue_rx) = flume::unbounded();
    let session = Arc::new(Self { connection: connection.clone(), channel_id, queue_tx, closed: AtomicBool::new(false) });

    tokio::spawn(connection.clone().run());
    tokio::spawn(player_loop(session.clone(), queue_rx, idle_timeout, on_close));

    Ok(session)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Relaxed)
  }

  pub fn enqueue(&self, item: MediaItem) -> Result<()> {
    self.queue_tx.send(item).map_err(|_| anyhow::anyhow!("player loop gone"))
  }

  /// §4.7 skip command: stop the item currently being streamed.
  pub fn skip(&self) -> bool {
    if self.connection.is_stopping() {
      return false;
    }
    self.connection.request_stop_playback();
    true
  }
}

async fn player_loop<F>(session: Arc<GuildSession>, queue_rx: Receiver<MediaItem>, idle_timeout: std::time::Duration, on_close: F)
where
  F: FnOnce() + Send + 'static
{
  loop {
    let item = tokio::select! {
      item = queue_rx.recv_async() => match item {
        Ok(item) => item,
        Err(_) => break
      },
      _ = tokio::time::sleep(idle_timeout) => {
        info!("voice session idle, closing");
        break;
      }
    };

    let MediaItem { title, mut source, .. } = item;
    if let Err(error) = source.wait_ready().await {
      warn!(%error, %title, "media item failed to become ready, skipping");
      continue;
    }

    session.connection.session_ready.wait_for(|ready| *ready).await;
    session.connection.dave_ready.wait_for(|ready| *ready).await;

    info!(%title, "streaming item");
    let result = session.connection.play_item(move || source.next_frame()).await;
    if let Err(error) = result {
      warn!(%error, %title, "failed to stream item");
    }
  }

  session.closed.store(true, Ordering::Relaxed);
  let _ = session.connection.disconnect().await;
  on_close();
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use voice::VoiceConnection;

  use super::*;

  fn test_options() -> VoiceConnectionOptions {
    VoiceConnectionOptions { guild_id: 1, channel_id: 2, user_id: 3, endpoint: "example.invalid".into(), token: "t".into(), session_id: "s".into() }
  }

  /// §4.7: a session whose queue stays empty for the whole idle timeout
  /// closes itself and invokes the close callback, without ever touching
  /// readiness gating or the voice sender.
  #[tokio::test]
  async fn player_loop_closes_after_idle_timeout_with_empty_queue() {
    let connection = Arc::new(VoiceConnection::new(3, test_options()));
    let (queue_tx, queue_rx) = flume::unbounded();
    let session = Arc::new(GuildSession { connection, channel_id: 2, queue_tx, closed: AtomicBool::new(false) });

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    player_loop(session.clone(), queue_rx, Duration::from_millis(20), move || {
      let _ = done_tx.send(());
    })
    .await;

    assert!(session.is_closed());
    assert!(done_rx.await.is_ok());
  }

  /// Dropping the sender side (as happens once the owning `GuildSession` is
  /// dropped elsewhere) also ends the loop, distinctly from the idle-timeout
  /// path, and still invokes the close callback exactly once.
  #[tokio::test]
  async fn player_loop_closes_when_queue_sender_is_dropped() {
    let connection = Arc::new(VoiceConnection::new(3, test_options()));
    let (queue_tx, queue_rx) = flume::unbounded();
    drop(queue_tx);
    let (unused_tx, _unused_rx) = flume::unbounded();
    let session = Arc::new(GuildSession { connection, channel_id: 2, queue_tx: unused_tx, closed: AtomicBool::new(false) });

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    player_loop(session.clone(), queue_rx, Duration::from_secs(300), move || {
      let _ = done_tx.send(());
    })
    .await;

    assert!(session.is_closed());
    assert!(done_rx.await.is_ok());
  }
}
