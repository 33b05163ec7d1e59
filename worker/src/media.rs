//! Media acquisition is a producer interface (Non-goal: no bundled
//! extractor/transcoder stack). `MediaSource` is the seam a real provider
//! plugs into; `FileMediaSource` is the one minimal, concrete implementation
//! this crate ships, reading pre-encoded Opus frames from a local file.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// A single 20-ms Opus frame, ready to hand to the voice sender (C5).
pub type MediaFrame = Vec<u8>;

#[async_trait]
pub trait MediaSource: Send + Sync {
  /// Resolves once the underlying media is ready to stream; a real provider
  /// awaits its download/transcode pipeline here.
  async fn wait_ready(&mut self) -> Result<()>;

  /// Pulls the next frame, or `None` once the item is exhausted.
  fn next_frame(&mut self) -> Option<MediaFrame>;
}

pub struct MediaItem {
  pub title: String,
  pub duration: Duration,
  pub source: Box<dyn MediaSource>
}

/// One 20ms Opus frame, per §4.5's RTP pacing interval.
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Reads `u16 LE length || frame bytes` records from a file of pre-encoded
/// Opus frames. Ready immediately: there is no download step for local files.
pub struct FileMediaSource {
  data: Vec<u8>,
  offset: usize
}

impl FileMediaSource {
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let mut data = Vec::new();
    File::open(path.as_ref()).with_context(|| format!("opening media file {:?}", path.as_ref()))?.read_to_end(&mut data)?;
    Ok(Self { data, offset: 0 })
  }

  /// Resolves `path` into a ready-to-enqueue [`MediaItem`], with `title` and
  /// `duration` derived from the file itself (one frame == 20ms, per §4.5).
  pub fn resolve(path: impl AsRef<Path>, title: impl Into<String>) -> Result<MediaItem> {
    let source = Self::open(path)?;
    let frame_count = source.count_frames();
    Ok(MediaItem { title: title.into(), duration: FRAME_DURATION * frame_count as u32, source: Box::new(source) })
  }

  fn count_frames(&self) -> usize {
    let mut offset = 0;
    let mut count = 0;
    while offset + 2 <= self.data.len() {
      let length = u16::from_le_bytes([self.data[offset], self.data[offset + 1]]) as usize;
      offset += 2;
      if offset + length > self.data.len() {
        break;
      }
      offset += length;
      count += 1;
    }
    count
  }
}

#[async_trait]
impl MediaSource for FileMediaSource {
  async fn wait_ready(&mut self) -> Result<()> {
    Ok(())
  }

  fn next_frame(&mut self) -> Option<MediaFrame> {
    if self.offset + 2 > self.data.len() {
      return None;
    }
    let length = u16::from_le_bytes([self.data[self.offset], self.data[self.offset + 1]]) as usize;
    self.offset += 2;
    if self.offset + length > self.data.len() {
      return None;
    }
    let frame = self.data[self.offset..self.offset + length].to_vec();
    self.offset += length;
    Some(frame)
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  #[tokio::test]
  async fn file_media_source_reads_length_prefixed_frames() {
    let mut file = tempfile_with(&[(3, b"abc"), (2, b"de")]);
    let mut source = FileMediaSource::open(file.path()).unwrap();
    source.wait_ready().await.unwrap();
    assert_eq!(source.next_frame(), Some(b"abc".to_vec()));
    assert_eq!(source.next_frame(), Some(b"de".to_vec()));
    assert_eq!(source.next_frame(), None);
    file.flush().unwrap();
  }

  #[test]
  fn resolve_derives_title_and_duration_from_frame_count() {
    let file = tempfile_with(&[(3, b"abc"), (2, b"de"), (1, b"f")]);
    let item = FileMediaSource::resolve(file.path(), "my track").unwrap();
    assert_eq!(item.title, "my track");
    assert_eq!(item.duration, Duration::from_millis(60));
  }

  fn tempfile_with(frames: &[(u16, &[u8])]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for (length, bytes) in frames {
      file.write_all(&length.to_le_bytes()).unwrap();
      file.write_all(bytes).unwrap();
    }
    file
  }
}
