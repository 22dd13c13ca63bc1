//! Playback of synthesized speech.

use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no audio output device: {0}")]
    Device(String),

    #[error("could not decode audio: {0}")]
    Decode(String),

    #[error("playback task failed: {0}")]
    Task(String),
}

/// Plays encoded audio (MP3/WAV) to completion
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, audio: Vec<u8>) -> Result<(), PlaybackError>;
}

/// Default output device through rodio.
///
/// `OutputStream` is not `Send`, so each clip opens the device on a blocking
/// thread and holds it until the sink drains.
#[derive(Debug, Default, Clone)]
pub struct RodioPlayer;

impl RodioPlayer {
    pub fn new() -> Self {
        Self
    }

    fn play_blocking(audio: Vec<u8>) -> Result<(), PlaybackError> {
        if audio.is_empty() {
            return Ok(());
        }
        let (_stream, handle) =
            OutputStream::try_default().map_err(|e| PlaybackError::Device(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| PlaybackError::Device(e.to_string()))?;
        let source = Decoder::new(Cursor::new(audio))
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        debug!(
            "Playing clip: {} Hz, {} channels",
            source.sample_rate(),
            source.channels()
        );
        sink.append(source.convert_samples::<f32>());
        sink.sleep_until_end();
        Ok(())
    }
}

#[async_trait]
impl AudioPlayer for RodioPlayer {
    async fn play(&self, audio: Vec<u8>) -> Result<(), PlaybackError> {
        tokio::task::spawn_blocking(move || Self::play_blocking(audio))
            .await
            .map_err(|e| PlaybackError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_clip_is_noop() {
        let player = RodioPlayer::new();
        assert!(player.play(Vec::new()).await.is_ok());
    }

    #[test]
    fn test_garbage_is_decode_or_device_error() {
        // Without an output device the device error wins; with one, decoding fails
        let err = RodioPlayer::play_blocking(vec![0u8; 64]).unwrap_err();
        assert!(matches!(err, PlaybackError::Device(_) | PlaybackError::Decode(_)));
    }
}
