//! The engine boundary: a synthesis backend consumed by the session
//! controller.
//!
//! Bindings are constructed asynchronously by an [`EngineFactory`] and report
//! per-utterance lifecycle callbacks as [`EngineEvent`] values through the
//! sink channel handed to them at construction. Callbacks must always go
//! through the sink; a binding must never call back into the session
//! synchronously from inside `speak`/`stop`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::queue::UtteranceId;
use crate::{Result, SpeechError};

/// How a submission interacts with engine-internal buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// Append after any in-flight engine work.
    Append,
    /// Replace in-flight and queued engine work immediately.
    Flush,
}

/// Per-submission parameters riding along with the text.
#[derive(Debug, Clone, Copy)]
pub struct SpeakParams {
    pub volume: f32,
}

/// Voice quality tier reported by the engine catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceQuality {
    Default,
    Enhanced,
}

/// One installed voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    pub identifier: String,
    /// Language tag of the voice (e.g. "en-US").
    pub language: String,
    pub quality: VoiceQuality,
}

/// One synthesis engine known to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    /// System identifier, used with `set_engine`.
    pub name: String,
    /// Human-readable display name.
    pub label: String,
    pub is_default: bool,
}

/// Lifecycle callback surface, correlated to queue entries by utterance id.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Start(UtteranceId),
    Done(UtteranceId),
    Error(UtteranceId),
    Stop { id: UtteranceId, interrupted: bool },
    /// Character range of the current submission being spoken.
    /// Offsets are relative to the submitted text, not the full utterance.
    Progress { id: UtteranceId, start: usize, end: usize },
}

/// Channel a binding reports lifecycle events through. Unbounded: losing a
/// terminal callback would stall the utterance queue.
pub type EngineEventSink = mpsc::UnboundedSender<EngineEvent>;

/// A live synthesis backend.
///
/// All methods are non-blocking: `speak` enqueues work and returns, with the
/// outcome reported through the event sink. Setters apply to submissions made
/// after the call.
pub trait EngineBinding: Send + Sync {
    fn speak(
        &self,
        text: &str,
        mode: SubmissionMode,
        params: SpeakParams,
        utterance_id: &UtteranceId,
    ) -> Result<()>;

    /// Interrupt in-flight and queued work. The interrupted utterance gets a
    /// `Stop` callback.
    fn stop(&self) -> Result<()>;

    /// Whether the engine holds in-flight or queued work.
    fn is_speaking(&self) -> bool;

    /// Whether the engine reports mid-utterance `Progress` ranges. Pausing
    /// and resuming are only available when it does.
    fn supports_progress(&self) -> bool;

    fn voices(&self) -> Result<Vec<Voice>>;

    fn set_voice(&self, identifier: &str) -> Result<()>;
    fn set_language(&self, tag: &str) -> Result<()>;
    fn set_pitch(&self, pitch: f32) -> Result<()>;
    fn set_rate(&self, rate: f32) -> Result<()>;

    /// Release engine resources. The binding is never used again afterwards.
    fn shutdown(&self);
}

/// Constructs engine bindings and answers catalog queries that do not need a
/// live binding.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Build a binding against `engine` (or the host default when `None`),
    /// reporting lifecycle events through `sink`. May take arbitrarily long;
    /// the caller enforces its own timeout.
    async fn create(
        &self,
        engine: Option<&str>,
        sink: EngineEventSink,
    ) -> Result<Arc<dyn EngineBinding>>;

    /// Engines installed on the host.
    fn engines(&self) -> Vec<EngineInfo>;

    /// Identifier of the host default engine, if any.
    fn default_engine(&self) -> Option<String>;

    /// Maximum characters a single submission may carry. `usize::MAX` when
    /// the platform imposes none.
    fn max_input_length(&self) -> usize {
        usize::MAX
    }

    /// Open the host UI for installing synthesis voice data.
    fn open_voice_data_installer(&self) -> Result<()> {
        Err(SpeechError::Unsupported(
            "no voice data installer on this host".into(),
        ))
    }
}
