pub mod capture;
pub mod playback;
pub mod preprocessing;

pub use capture::{
    list_input_devices, AudioDevice, AudioFrame, AudioInput, CaptureGate, CaptureStream,
    FrameQueue, FrameSink, MicrophoneInput,
};
pub use playback::{AudioPlayer, PlaybackError, RodioPlayer};
pub use preprocessing::AudioPreprocessor;
