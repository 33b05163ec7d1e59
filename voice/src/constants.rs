use std::time::Duration;

pub const CHANNEL_COUNT: usize = 2;
pub const SAMPLE_RATE: usize = 48000;
pub const CHUNK_DURATION: Duration = Duration::from_millis(20);
pub const TIMESTAMP_STEP: u32 = 960;

/// `F8 FF FE`, per §4.5: appended after the last real frame of an item to
/// flush the peer's jitter buffer.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
pub const OPUS_SILENCE_FRAME_COUNT: u8 = 5;
