//! External collaborators: recognition, synthesis, generation and dispatch.

pub mod dispatch;
pub mod gemini;
pub mod outcome;
pub mod scribe;
pub mod tts;

pub use dispatch::{CallRequest, Dispatcher, HttpDispatcher, Severity};
pub use gemini::{GeminiClient, SuggestionGenerator, UnconfiguredGenerator};
pub use outcome::ServiceOutcome;
pub use scribe::{
    OutboundMessage, RecognitionError, RecognitionEvent, RecognitionLink, ScribeRecognizer,
    SpeechRecognizer,
};
pub use tts::{ElevenLabsSynthesizer, SpeechSynthesizer, UnconfiguredSynthesizer};
