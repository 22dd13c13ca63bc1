//! Voice check-in session.
//!
//! Architecture:
//!   Microphone (cpal thread)
//!       → FrameSink (gate check, preprocessing)
//!       → FrameQueue (bounded)
//!       → send loop (silence suppression, backoff on a full socket) → recognition stream
//!   recognition stream → receive loop → Dialogue → TurnTaking / ActionResolver
//!
//! A session ends when the dialogue reaches a terminal decision, the stop
//! token is cancelled, or the recognition connection fails.

pub mod dialogue;
pub mod intent;
pub mod turn;

pub use dialogue::{ConversationState, DecisionSource, Dialogue, Step};
pub use intent::{classify, ContinueReason, Intent};

use crate::actions::{Action, ActionResolver};
use crate::activity_log;
use crate::alert::{ConversationLauncher, EscalationRequest, SessionControl};
use crate::audio::capture::mean_abs_pcm16;
use crate::audio::{AudioInput, AudioPlayer, AudioPreprocessor, CaptureGate, FrameQueue, FrameSink};
use crate::config::{ConversationConfig, PreprocessingConfig};
use crate::services::{
    OutboundMessage, RecognitionError, RecognitionEvent, SpeechRecognizer, SpeechSynthesizer,
    SuggestionGenerator,
};
use async_trait::async_trait;
use dialogue::{
    CALMING_FALLBACK, CONTACT_RESPONSE, CONTINUE_PROMPT, EMERGENCY_RESPONSE, INITIAL_PROMPT,
    NO_INPUT_REPROMPT, TIMEOUT_MESSAGE,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turn::TurnTaking;
use uuid::Uuid;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SessionOutcome {
    Resolved { action: Action, message: String },
    Failed { reason: String },
    Stopped,
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Resolved { action, .. } => action.as_str(),
            SessionOutcome::Failed { .. } => "ERROR",
            SessionOutcome::Stopped => "STOPPED",
        }
    }
}

/// Failures that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("recognition failed: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("audio capture failed: {0}")]
    Capture(String),

    #[error("recognition service reported an error: {0}")]
    Service(String),

    #[error("recognition connection lost")]
    ConnectionLost,
}

pub fn action_for(intent: Intent) -> Action {
    match intent {
        Intent::Emergency => Action::CallEmergencyServices,
        Intent::Contact => Action::CallContact,
        Intent::Neither => Action::SelfCalm,
        Intent::Continue(_) => Action::Continue,
    }
}

/// Collaborators a session talks to
#[derive(Clone)]
pub struct VoiceDeps {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
    pub generator: Arc<dyn SuggestionGenerator>,
    pub input: Arc<dyn AudioInput>,
    pub resolver: Arc<ActionResolver>,
}

/// Runs one voice check-in per escalation
pub struct VoiceAgent {
    config: ConversationConfig,
    preprocessing: PreprocessingConfig,
    deps: VoiceDeps,
}

impl VoiceAgent {
    pub fn new(config: ConversationConfig, preprocessing: PreprocessingConfig, deps: VoiceDeps) -> Self {
        Self {
            config,
            preprocessing,
            deps,
        }
    }

    async fn converse(
        &self,
        session_id: &str,
        request: &EscalationRequest,
        control: &SessionControl,
    ) -> Result<SessionOutcome, SessionError> {
        let link = self.deps.recognizer.connect().await?;
        let outbound = link.outbound;
        let mut inbound = link.inbound;

        let gate = Arc::new(CaptureGate::new());
        let queue = Arc::new(FrameQueue::new(self.config.frame_queue_capacity));
        let capture = match AudioPreprocessor::new(self.config.sample_rate, &self.preprocessing) {
            Ok(pp) => {
                let sink = FrameSink::new(gate.clone(), queue.clone(), pp, self.config.frame_size);
                let input = self.deps.input.clone();
                // Device setup blocks until the audio thread reports back
                match tokio::task::spawn_blocking(move || input.start(sink)).await {
                    Ok(started) => started,
                    Err(e) => Err(anyhow::anyhow!("capture start panicked: {}", e)),
                }
            }
            Err(e) => Err(e),
        };
        let mut capture = match capture {
            Ok(stream) => stream,
            Err(e) => {
                let _ = outbound.try_send(OutboundMessage::Close);
                return Err(SessionError::Capture(format!("{:#}", e)));
            }
        };

        let send_cancel = control.cancel.child_token();
        let sender = tokio::spawn(send_loop(
            queue.clone(),
            outbound.clone(),
            send_cancel.clone(),
            self.config.silence_floor,
            self.config.send_backoff(),
        ));

        let turn = TurnTaking::new(
            gate,
            queue,
            self.deps.synthesizer.clone(),
            self.deps.player.clone(),
            &self.config,
        );

        let result = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Ok(SessionOutcome::Stopped),
            result = self.receive_loop(session_id, request, &mut inbound, &turn, &control.state) => result,
        };

        // Teardown: stop sending, close the socket, release the microphone
        send_cancel.cancel();
        if sender.await.is_err() {
            warn!("Send loop panicked");
        }
        let _ = outbound.try_send(OutboundMessage::Close);
        inbound.close();
        if tokio::task::spawn_blocking(move || capture.stop()).await.is_err() {
            warn!("Capture shutdown panicked");
        }

        result
    }

    async fn receive_loop(
        &self,
        session_id: &str,
        request: &EscalationRequest,
        inbound: &mut mpsc::Receiver<Result<RecognitionEvent, RecognitionError>>,
        turn: &TurnTaking,
        state: &watch::Sender<ConversationState>,
    ) -> Result<SessionOutcome, SessionError> {
        let mut dialogue = Dialogue::new(self.config.hard_deadline(), self.config.max_unanswered_windows);

        loop {
            let deadline = dialogue.deadline_at();
            let step = tokio::select! {
                message = inbound.recv() => {
                    let event = match message {
                        None => return Err(SessionError::ConnectionLost),
                        Some(Err(RecognitionError::Closed)) => return Err(SessionError::ConnectionLost),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(event)) => event,
                    };
                    let step = Self::on_event(&mut dialogue, event)?;
                    if step == Step::Idle {
                        // Deadline is checked on every inbound message
                        dialogue.check_deadline(Instant::now())
                    } else {
                        step
                    }
                }
                _ = wait_until(deadline) => dialogue.check_deadline(Instant::now()),
            };

            if let Some(outcome) = self
                .apply(step, session_id, request, &mut dialogue, turn, state)
                .await
            {
                return Ok(outcome);
            }
        }
    }

    fn on_event(dialogue: &mut Dialogue, event: RecognitionEvent) -> Result<Step, SessionError> {
        match event {
            RecognitionEvent::SessionStarted => {
                info!("Recognition session started");
                Ok(dialogue.on_session_started())
            }
            RecognitionEvent::PartialTranscript { text } => {
                debug!("Partial: {}", text);
                Ok(dialogue.on_partial(&text))
            }
            RecognitionEvent::CommittedTranscript { text } => {
                debug!("Committed: {}", text);
                Ok(dialogue.on_committed(&text))
            }
            RecognitionEvent::InputError { error } => {
                warn!("Recognition input error: {}", error.unwrap_or_default());
                Ok(Step::Idle)
            }
            RecognitionEvent::Error { error } => Err(SessionError::Service(
                error.unwrap_or_else(|| "unspecified".to_string()),
            )),
            RecognitionEvent::Unknown => Ok(Step::Idle),
        }
    }

    async fn apply(
        &self,
        step: Step,
        session_id: &str,
        request: &EscalationRequest,
        dialogue: &mut Dialogue,
        turn: &TurnTaking,
        state: &watch::Sender<ConversationState>,
    ) -> Option<SessionOutcome> {
        match step {
            Step::Idle => None,
            Step::SpeakPrompt => {
                turn.speak(INITIAL_PROMPT).await;
                dialogue.begin_listening(Instant::now());
                set_state(session_id, state, dialogue.state());
                None
            }
            Step::Reprompt { heard_text } => {
                activity_log::log_deadline_forced(session_id, heard_text, dialogue.unanswered_windows());
                let prompt = if heard_text { CONTINUE_PROMPT } else { NO_INPUT_REPROMPT };
                turn.speak(prompt).await;
                dialogue.rearm(Instant::now());
                None
            }
            Step::GiveUp => {
                activity_log::log_deadline_forced(session_id, false, dialogue.unanswered_windows());
                dialogue.finish();
                set_state(session_id, state, dialogue.state());
                Some(SessionOutcome::Resolved {
                    action: Action::Timeout,
                    message: TIMEOUT_MESSAGE.to_string(),
                })
            }
            Step::Decide { intent, text, source } => {
                debug!("Decision from {:?} text: {}", source, text);
                info!(session_id, ?source, ?intent, "Decision made");
                let action = action_for(intent);
                // Dispatch before speaking so the call is not delayed by playback
                self.deps
                    .resolver
                    .dispatch_once(request.alert_id, action, &request.vitals);
                let message = self.response_for(intent).await;
                turn.speak(&message).await;
                dialogue.finish();
                set_state(session_id, state, dialogue.state());
                Some(SessionOutcome::Resolved { action, message })
            }
        }
    }

    async fn response_for(&self, intent: Intent) -> String {
        match intent {
            Intent::Emergency => EMERGENCY_RESPONSE.to_string(),
            Intent::Contact => CONTACT_RESPONSE.to_string(),
            Intent::Neither => self
                .deps
                .generator
                .calming_suggestion()
                .await
                .unwrap_or_fallback("generation", || CALMING_FALLBACK.to_string()),
            Intent::Continue(_) => CONTINUE_PROMPT.to_string(),
        }
    }
}

#[async_trait]
impl ConversationLauncher for VoiceAgent {
    async fn run(&self, request: EscalationRequest, control: SessionControl) -> SessionOutcome {
        let session_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        activity_log::log_session_started(&session_id, request.alert_id);
        control.state.send_replace(ConversationState::Initial);

        let outcome = match self.converse(&session_id, &request, &control).await {
            Ok(outcome) => outcome,
            Err(e) => {
                activity_log::log_session_error(&session_id, &e.to_string());
                SessionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        control.state.send_replace(ConversationState::Finished);
        activity_log::log_session_ended(
            &session_id,
            outcome.label(),
            started.elapsed().as_millis() as u64,
        );
        outcome
    }
}

fn set_state(session_id: &str, state: &watch::Sender<ConversationState>, next: ConversationState) {
    let previous = state.send_replace(next);
    if previous != next {
        activity_log::log_state_change(session_id, previous.as_str(), next.as_str());
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Forward captured frames to the recognizer until cancelled.
///
/// Near-silent frames are skipped. A full outbound channel is retried after
/// a short backoff rather than blocking.
async fn send_loop(
    queue: Arc<FrameQueue>,
    outbound: mpsc::Sender<OutboundMessage>,
    cancel: CancellationToken,
    silence_floor: f32,
    backoff: Duration,
) {
    let mut pending: Option<OutboundMessage> = None;
    let mut sent: u64 = 0;

    while !cancel.is_cancelled() {
        if pending.is_none() {
            let Some(frame) = queue.try_take() else {
                backoff_or_cancel(&cancel, backoff).await;
                continue;
            };
            let pcm = frame.to_pcm16();
            if mean_abs_pcm16(&pcm) <= silence_floor {
                continue;
            }
            pending = Some(OutboundMessage::Audio(
                pcm.into_iter().flat_map(|s| s.to_le_bytes()).collect(),
            ));
        }

        if let Some(message) = pending.take() {
            match outbound.try_send(message) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(message)) => {
                    pending = Some(message);
                    backoff_or_cancel(&cancel, backoff).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }
    debug!("Send loop finished after {} chunks", sent);
}

async fn backoff_or_cancel(cancel: &CancellationToken, backoff: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(backoff) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;

    #[test]
    fn test_action_for_intent() {
        assert_eq!(action_for(Intent::Emergency), Action::CallEmergencyServices);
        assert_eq!(action_for(Intent::Contact), Action::CallContact);
        assert_eq!(action_for(Intent::Neither), Action::SelfCalm);
        assert_eq!(
            action_for(Intent::Continue(ContinueReason::TooShort)),
            Action::Continue
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(SessionOutcome::Stopped.label(), "STOPPED");
        assert_eq!(
            SessionOutcome::Failed {
                reason: "x".to_string()
            }
            .label(),
            "ERROR"
        );
        let json = serde_json::to_value(SessionOutcome::Resolved {
            action: Action::CallContact,
            message: "ok".to_string(),
        })
        .unwrap();
        assert_eq!(json["result"], "resolved");
        assert_eq!(json["action"], "CALL_FAMILY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_loop_skips_silence_and_stops_on_cancel() {
        let queue = Arc::new(FrameQueue::new(8));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        queue.offer(AudioFrame::new(vec![0.0005; 160]));
        queue.offer(AudioFrame::new(vec![0.5; 160]));

        let handle = tokio::spawn(send_loop(
            queue.clone(),
            tx,
            cancel.clone(),
            50.0,
            Duration::from_millis(10),
        ));

        let message = rx.recv().await.unwrap();
        match message {
            OutboundMessage::Audio(bytes) => assert_eq!(bytes.len(), 320),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "silent frame must not be sent");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_loop_retries_when_full() {
        let queue = Arc::new(FrameQueue::new(8));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            queue.offer(AudioFrame::new(vec![0.5; 16]));
        }
        let handle = tokio::spawn(send_loop(
            queue.clone(),
            tx,
            cancel.clone(),
            50.0,
            Duration::from_millis(10),
        ));

        let mut received = 0;
        for _ in 0..3 {
            rx.recv().await.unwrap();
            received += 1;
        }
        assert_eq!(received, 3);
        cancel.cancel();
        handle.await.unwrap();
    }
}
