//! Public session controller: composes the initialization supervisor, the
//! utterance queue, the audio priority arbiter and the event dispatcher.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::audio::{AudioPriorityArbiter, AudioSessionHost, NoopAudioSession};
use crate::engine::{EngineEvent, EngineFactory, EngineInfo, Voice};
use crate::event::{DispatcherStats, EventDispatcher, SpeechEvent, SpeechEventKind};
use crate::init::InitSupervisor;
use crate::options::{self, SpeechOptions, SpeechOptionsUpdate};
use crate::queue::{UtteranceId, UtteranceQueue};
use crate::{Result, SpeechError};

/// Speech-synthesis session controller.
///
/// Sequences text utterances through an [`EngineFactory`]-provided engine,
/// buffers operations across engine initialization (with bounded retry), and
/// raises [`SpeechEvent`]s driven by engine callbacks.
///
/// Construct inside a tokio runtime; engine initialization starts eagerly in
/// the background and the first operations simply buffer until it completes.
pub struct SpeechSession {
    factory: Arc<dyn EngineFactory>,
    supervisor: InitSupervisor,
    queue: Arc<UtteranceQueue>,
    arbiter: Arc<AudioPriorityArbiter>,
    events: Arc<EventDispatcher>,
    defaults: Arc<Mutex<SpeechOptions>>,
    max_input_length: usize,
    pump: JoinHandle<()>,
}

impl SpeechSession {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_audio_host(factory, Arc::new(NoopAudioSession))
    }

    pub fn with_audio_host(
        factory: Arc<dyn EngineFactory>,
        audio_host: Arc<dyn AudioSessionHost>,
    ) -> Self {
        let events = Arc::new(EventDispatcher::new());
        let arbiter = Arc::new(AudioPriorityArbiter::new(audio_host));
        let defaults = Arc::new(Mutex::new(SpeechOptions::default()));
        let queue = Arc::new(UtteranceQueue::new(
            Arc::clone(&events),
            Arc::clone(&arbiter),
            Arc::clone(&defaults),
        ));

        let (sink, mut engine_rx) = mpsc::unbounded_channel::<EngineEvent>();
        let supervisor = InitSupervisor::new(Arc::clone(&factory), sink, Arc::clone(&defaults));
        let max_input_length = factory.max_input_length();

        // Pump task: serializes engine callbacks into the queue's guarded
        // state, one at a time.
        let pump = tokio::spawn({
            let queue = Arc::clone(&queue);
            let supervisor = supervisor.clone();
            async move {
                while let Some(event) = engine_rx.recv().await {
                    match supervisor.engine() {
                        Some(engine) => queue.handle_engine_event(&engine, event),
                        None => {
                            debug!(target = "speech", "Dropping engine event with no live engine")
                        }
                    }
                }
            }
        });

        supervisor.start_initialization();

        Self {
            factory,
            supervisor,
            queue,
            arbiter,
            events,
            defaults,
            max_input_length,
            pump,
        }
    }

    /// Merge `update` into the session-wide defaults, applying them to the
    /// engine immediately when it is ready.
    pub fn configure(&self, update: SpeechOptionsUpdate) {
        let snapshot = {
            let mut defaults = match self.defaults.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            defaults.apply(&update);
            defaults.clone()
        };
        if let Some(engine) = self.supervisor.engine() {
            options::apply_to_engine(engine.as_ref(), &snapshot);
        }
    }

    /// Restore the built-in default options.
    pub fn reset(&self) {
        let snapshot = {
            let mut defaults = match self.defaults.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *defaults = SpeechOptions::default();
            defaults.clone()
        };
        if let Some(engine) = self.supervisor.engine() {
            options::apply_to_engine(engine.as_ref(), &snapshot);
        }
    }

    /// Queue `text` for synthesis with the current session defaults.
    /// Resolves with the utterance id once the utterance is queued.
    pub async fn speak(&self, text: &str) -> Result<UtteranceId> {
        self.speak_with_options(text, SpeechOptionsUpdate::default())
            .await
    }

    /// Queue `text` with per-utterance overrides merged over the session
    /// defaults. The defaults themselves are left untouched.
    pub async fn speak_with_options(
        &self,
        text: &str,
        update: SpeechOptionsUpdate,
    ) -> Result<UtteranceId> {
        if text.is_empty() {
            return Err(SpeechError::Validation("text cannot be empty".into()));
        }
        let max = self.max_input_length;
        if text.chars().count() > max {
            return Err(SpeechError::Validation(format!(
                "text exceeds the maximum input length of {max} characters"
            )));
        }

        let merged = {
            let defaults = match self.defaults.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            defaults.merged(&update)
        };

        let text = text.to_string();
        let queue = Arc::clone(&self.queue);
        let arbiter = Arc::clone(&self.arbiter);
        self.supervisor
            .with_engine(move |engine| {
                arbiter.configure(merged.ducking, merged.silent_mode);
                arbiter.activate();
                Ok(queue.enqueue(engine, text, merged))
            })
            .await
    }

    /// Stop any ongoing or queued speech and clear the session. Succeeds
    /// regardless of prior state.
    pub async fn stop(&self) -> Result<()> {
        let queue = Arc::clone(&self.queue);
        self.supervisor
            .with_engine(move |engine| {
                queue.stop(engine);
                Ok(())
            })
            .await
    }

    /// Pause the active utterance. Resolves `false` when there is nothing to
    /// pause or the engine cannot report a resume position.
    pub async fn pause(&self) -> Result<bool> {
        let queue = Arc::clone(&self.queue);
        self.supervisor
            .with_engine(move |engine| Ok(queue.pause(engine)))
            .await
    }

    /// Resume previously paused speech. Resolves `false` when nothing is
    /// paused.
    pub async fn resume(&self) -> Result<bool> {
        let queue = Arc::clone(&self.queue);
        self.supervisor
            .with_engine(move |engine| Ok(queue.resume(engine)))
            .await
    }

    /// Whether speech is active: the engine reports work in flight, or the
    /// session is paused mid-utterance.
    pub async fn is_speaking(&self) -> Result<bool> {
        let queue = Arc::clone(&self.queue);
        self.supervisor
            .with_engine(move |engine| Ok(engine.is_speaking() || queue.is_paused()))
            .await
    }

    /// Voices installed on the host, optionally filtered by a language-tag
    /// prefix (e.g. "en" or "en-US", case-insensitive).
    pub async fn available_voices(&self, language: Option<&str>) -> Result<Vec<Voice>> {
        let filter = language.map(|l| l.to_lowercase());
        self.supervisor
            .with_engine(move |engine| {
                let voices = engine.voices()?;
                Ok(match filter {
                    Some(prefix) => voices
                        .into_iter()
                        .filter(|v| v.language.to_lowercase().starts_with(&prefix))
                        .collect(),
                    None => voices,
                })
            })
            .await
    }

    /// Synthesis engines known to the host.
    pub async fn engines(&self) -> Result<Vec<EngineInfo>> {
        let factory = Arc::clone(&self.factory);
        self.supervisor
            .with_engine(move |_| Ok(factory.engines()))
            .await
    }

    /// Switch speech synthesis to the named engine. A no-op when it is
    /// already active; the session queue is cleared and the engine is
    /// reinitialized otherwise.
    pub async fn set_engine(&self, name: &str) -> Result<()> {
        if !self.factory.engines().iter().any(|e| e.name == name) {
            return Err(SpeechError::Validation(format!(
                "engine '{name}' is not available"
            )));
        }
        let active = self
            .supervisor
            .selected_engine()
            .or_else(|| self.factory.default_engine());
        if active.as_deref() == Some(name) {
            return Ok(());
        }
        self.queue.reset();
        self.arbiter.deactivate();
        self.supervisor.switch_engine(name).await
    }

    /// Open the host UI for installing synthesis voice data.
    pub fn open_voice_data_installer(&self) -> Result<()> {
        self.factory.open_voice_data_installer()
    }

    /// Subscribe to outward events; an empty filter receives everything.
    pub fn subscribe(
        &self,
        kinds: Vec<SpeechEventKind>,
    ) -> (String, mpsc::Receiver<SpeechEvent>) {
        self.events.subscribe(kinds)
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.events.unsubscribe(subscription_id);
    }

    /// Maximum characters accepted for a single utterance, as declared by
    /// the engine platform. `usize::MAX` when unbounded.
    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    pub fn event_stats(&self) -> DispatcherStats {
        self.events.stats()
    }

    /// Tear down the session: engine shut down, queue cleared, ducking claim
    /// released. Buffered operations are rejected; a later operation
    /// reinitializes the engine from scratch.
    pub fn shutdown(&self) {
        self.queue.reset();
        self.arbiter.deactivate();
        self.supervisor.shutdown();
    }
}

impl Drop for SpeechSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
