//! Turn-taking: the system never listens while it speaks.
//!
//! Speaking closes the capture gate, waits out a quiet interval, drains the
//! frame queue, synthesizes and plays the text, waits again, drains again, and
//! only then reopens the gate.

use crate::audio::{AudioPlayer, CaptureGate, FrameQueue};
use crate::config::ConversationConfig;
use crate::services::{ServiceOutcome, SpeechSynthesizer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct TurnTaking {
    gate: Arc<CaptureGate>,
    queue: Arc<FrameQueue>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    player: Arc<dyn AudioPlayer>,
    quiet_before: Duration,
    quiet_after: Duration,
}

impl TurnTaking {
    pub fn new(
        gate: Arc<CaptureGate>,
        queue: Arc<FrameQueue>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        player: Arc<dyn AudioPlayer>,
        config: &ConversationConfig,
    ) -> Self {
        Self {
            gate,
            queue,
            synthesizer,
            player,
            quiet_before: config.quiet_before_speech(),
            quiet_after: config.quiet_after_speech(),
        }
    }

    /// Speak `text`. Synthesis and playback failures are logged; the gate is
    /// always reopened afterwards.
    pub async fn speak(&self, text: &str) {
        self.gate.close();
        tokio::time::sleep(self.quiet_before).await;
        let drained = self.queue.drain();

        match self.synthesizer.synthesize(text).await {
            ServiceOutcome::Ok(audio) => {
                if let Err(e) = self.player.play(audio).await {
                    warn!("Playback failed: {}", e);
                }
            }
            failed => warn!(
                "Speech synthesis failed ({}), skipping playback",
                failed.failure_reason().unwrap_or_default()
            ),
        }

        tokio::time::sleep(self.quiet_after).await;
        let drained_after = self.queue.drain();
        self.gate.open();
        debug!(
            "Turn complete: drained {} frames before and {} after speaking",
            drained, drained_after
        );
    }
}
