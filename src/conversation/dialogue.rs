//! Conversation state machine.
//!
//! Pure bookkeeping: the session driver feeds in recognition events and clock
//! readings, and gets back a [`Step`] describing what to say or do next. No
//! I/O happens here.

use super::intent::{classify, is_urgent_partial, Intent};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

pub const INITIAL_PROMPT: &str =
    "Your vitals are not normal. You have three options: call 911, call family, or neither.";
pub const EMERGENCY_RESPONSE: &str = "Calling 911 now. Emergency services are on their way.";
pub const CONTACT_RESPONSE: &str = "Calling your emergency contact now.";
pub const CONTINUE_PROMPT: &str =
    "I didn't quite catch that. Please say: call 911, call family, or neither.";
pub const NO_INPUT_REPROMPT: &str =
    "I didn't hear a clear response. Please say call 911, call family, or neither.";
pub const CALMING_FALLBACK: &str = "Try taking slow, deep breaths. Breathe in through your nose for 4 counts, hold for 4, then exhale through your mouth for 6 counts. This can help lower your heart rate.";
pub const TIMEOUT_MESSAGE: &str = "No clear response before the deadline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Initial,
    WaitingForChoice,
    Finished,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Initial => "initial",
            ConversationState::WaitingForChoice => "waiting_for_choice",
            ConversationState::Finished => "finished",
        }
    }
}

/// What produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Partial,
    Committed,
    Deadline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Idle,
    /// Play the opening prompt, then call [`Dialogue::begin_listening`]
    SpeakPrompt,
    /// A terminal intent was reached
    Decide {
        intent: Intent,
        text: String,
        source: DecisionSource,
    },
    /// Play a re-prompt, then call [`Dialogue::rearm`]. `heard_text` is set
    /// when an unclear partial was classified.
    Reprompt { heard_text: bool },
    /// Too many windows passed without a decision
    GiveUp,
}

#[derive(Debug)]
pub struct Dialogue {
    state: ConversationState,
    deadline: Duration,
    armed_at: Option<Instant>,
    last_partial: String,
    heard_in_window: bool,
    unanswered_windows: u32,
    max_unanswered_windows: u32,
    decided: Option<Intent>,
}

impl Dialogue {
    pub fn new(deadline: Duration, max_unanswered_windows: u32) -> Self {
        Self {
            state: ConversationState::Initial,
            deadline,
            armed_at: None,
            last_partial: String::new(),
            heard_in_window: false,
            unanswered_windows: 0,
            max_unanswered_windows: max_unanswered_windows.max(1),
            decided: None,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn decided(&self) -> Option<Intent> {
        self.decided
    }

    pub fn last_partial(&self) -> &str {
        &self.last_partial
    }

    /// Consecutive expired windows in which nothing was heard
    pub fn unanswered_windows(&self) -> u32 {
        self.unanswered_windows
    }

    /// When the current window expires, if one is armed
    pub fn deadline_at(&self) -> Option<Instant> {
        if self.is_listening() {
            self.armed_at.map(|t| t + self.deadline)
        } else {
            None
        }
    }

    fn is_listening(&self) -> bool {
        self.state == ConversationState::WaitingForChoice && self.decided.is_none()
    }

    pub fn on_session_started(&mut self) -> Step {
        if self.state == ConversationState::Initial {
            Step::SpeakPrompt
        } else {
            Step::Idle
        }
    }

    /// Prompt has been played; start the first window
    pub fn begin_listening(&mut self, now: Instant) {
        if self.state == ConversationState::Initial {
            self.state = ConversationState::WaitingForChoice;
            self.armed_at = Some(now);
        }
    }

    /// Start a fresh window after a re-prompt
    pub fn rearm(&mut self, now: Instant) {
        if self.is_listening() {
            self.armed_at = Some(now);
        }
    }

    pub fn on_partial(&mut self, text: &str) -> Step {
        if !self.is_listening() || text.trim().is_empty() {
            return Step::Idle;
        }
        self.heard_in_window = true;
        if text == self.last_partial {
            return Step::Idle;
        }
        self.last_partial = text.to_string();

        if is_urgent_partial(text) {
            let intent = classify(text);
            if intent.is_terminal() {
                return self.decide(intent, text, DecisionSource::Partial);
            }
        }
        Step::Idle
    }

    pub fn on_committed(&mut self, text: &str) -> Step {
        if !self.is_listening() || text.trim().is_empty() {
            return Step::Idle;
        }
        self.heard_in_window = true;
        let intent = classify(text);
        if intent.is_terminal() {
            self.decide(intent, text, DecisionSource::Committed)
        } else {
            Step::Idle
        }
    }

    /// Run on every inbound message and whenever the window timer fires.
    ///
    /// An expired window classifies the pending partial once; the partial is
    /// consumed so the next window cannot reuse it. The window is disarmed
    /// until the driver calls [`Dialogue::rearm`].
    ///
    /// Only silent windows count toward giving up. A window in which the
    /// patient said something unclear always re-prompts.
    pub fn check_deadline(&mut self, now: Instant) -> Step {
        let Some(due) = self.deadline_at() else {
            return Step::Idle;
        };
        if now < due {
            return Step::Idle;
        }

        self.armed_at = None;

        let partial = std::mem::take(&mut self.last_partial);
        let heard_text = std::mem::take(&mut self.heard_in_window) || !partial.trim().is_empty();
        if !partial.trim().is_empty() {
            let intent = classify(&partial);
            if intent.is_terminal() {
                return self.decide(intent, &partial, DecisionSource::Deadline);
            }
        }

        if heard_text {
            self.unanswered_windows = 0;
            return Step::Reprompt { heard_text };
        }

        self.unanswered_windows += 1;
        if self.unanswered_windows >= self.max_unanswered_windows {
            Step::GiveUp
        } else {
            Step::Reprompt { heard_text }
        }
    }

    fn decide(&mut self, intent: Intent, text: &str, source: DecisionSource) -> Step {
        self.decided = Some(intent);
        self.armed_at = None;
        Step::Decide {
            intent,
            text: text.to_string(),
            source,
        }
    }

    pub fn finish(&mut self) {
        self.state = ConversationState::Finished;
        self.armed_at = None;
    }
}
