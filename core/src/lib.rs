// Verba Core Library
// Speech-synthesis session controller runtime

pub mod audio;
pub mod engine;
pub mod event;
pub mod init;
pub mod options;
pub mod queue;
pub mod session;

pub(crate) mod utils;

// Export core types
pub use audio::{AudioPriorityArbiter, AudioSessionHost, NoopAudioSession};
pub use engine::{
    EngineBinding, EngineEvent, EngineEventSink, EngineFactory, EngineInfo, SpeakParams,
    SubmissionMode, Voice, VoiceQuality,
};
pub use event::{DispatcherStats, EventDispatcher, SpeechEvent, SpeechEventKind};
pub use options::{SilentMode, SpeechOptions, SpeechOptionsUpdate};
pub use queue::{Utterance, UtteranceId, UtteranceQueue, UtteranceStatus};
pub use session::SpeechSession;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Initialization error: {0}")]
    Init(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, SpeechError>;
