#![allow(dead_code)]
// Shared test doubles: a scripted engine whose lifecycle callbacks are
// driven by hand, and a factory with configurable construction behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use verba_core::engine::{
    EngineBinding, EngineEvent, EngineEventSink, EngineFactory, EngineInfo, SpeakParams,
    SubmissionMode, Voice, VoiceQuality,
};
use verba_core::options::SilentMode;
use verba_core::queue::UtteranceId;
use verba_core::{AudioSessionHost, Result, SpeechError, SpeechEvent};

/// One recorded `speak` submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: UtteranceId,
    pub text: String,
    pub mode: SubmissionMode,
    pub volume: f32,
}

/// Engine double: records submissions and applied settings; tests deliver
/// lifecycle callbacks through the helper methods.
pub struct ScriptedEngine {
    sink: EngineEventSink,
    progress: bool,
    speaking: AtomicBool,
    submissions: Mutex<Vec<Submission>>,
    applied: Mutex<Vec<(String, String)>>,
    fail_speak_texts: Mutex<Vec<String>>,
    stop_calls: AtomicUsize,
    shutdowns: AtomicUsize,
    voice_list: Vec<Voice>,
}

impl ScriptedEngine {
    fn new(sink: EngineEventSink, progress: bool, fail_speak_texts: Vec<String>) -> Self {
        Self {
            sink,
            progress,
            speaking: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            fail_speak_texts: Mutex::new(fail_speak_texts),
            stop_calls: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            voice_list: default_voices(),
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    // -- callback drivers --------------------------------------------------

    pub fn start(&self, id: &UtteranceId) {
        let _ = self.sink.send(EngineEvent::Start(id.clone()));
    }

    pub fn progress(&self, id: &UtteranceId, start: usize, end: usize) {
        let _ = self.sink.send(EngineEvent::Progress {
            id: id.clone(),
            start,
            end,
        });
    }

    pub fn finish(&self, id: &UtteranceId) {
        self.speaking.store(false, Ordering::SeqCst);
        let _ = self.sink.send(EngineEvent::Done(id.clone()));
    }

    pub fn fail(&self, id: &UtteranceId) {
        self.speaking.store(false, Ordering::SeqCst);
        let _ = self.sink.send(EngineEvent::Error(id.clone()));
    }

    pub fn stop_cb(&self, id: &UtteranceId, interrupted: bool) {
        let _ = self.sink.send(EngineEvent::Stop {
            id: id.clone(),
            interrupted,
        });
    }
}

impl EngineBinding for ScriptedEngine {
    fn speak(
        &self,
        text: &str,
        mode: SubmissionMode,
        params: SpeakParams,
        utterance_id: &UtteranceId,
    ) -> Result<()> {
        if self
            .fail_speak_texts
            .lock()
            .unwrap()
            .iter()
            .any(|t| t == text)
        {
            return Err(SpeechError::Engine("scripted submission failure".into()));
        }
        self.submissions.lock().unwrap().push(Submission {
            id: utterance_id.clone(),
            text: text.to_string(),
            mode,
            volume: params.volume,
        });
        self.speaking.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    fn supports_progress(&self) -> bool {
        self.progress
    }

    fn voices(&self) -> Result<Vec<Voice>> {
        Ok(self.voice_list.clone())
    }

    fn set_voice(&self, identifier: &str) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(("voice".into(), identifier.into()));
        Ok(())
    }

    fn set_language(&self, tag: &str) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(("language".into(), tag.into()));
        Ok(())
    }

    fn set_pitch(&self, pitch: f32) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(("pitch".into(), pitch.to_string()));
        Ok(())
    }

    fn set_rate(&self, rate: f32) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push(("rate".into(), rate.to_string()));
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn default_voices() -> Vec<Voice> {
    vec![
        Voice {
            name: "Aria".into(),
            identifier: "mock.voice.aria".into(),
            language: "en-US".into(),
            quality: VoiceQuality::Enhanced,
        },
        Voice {
            name: "Brian".into(),
            identifier: "mock.voice.brian".into(),
            language: "en-GB".into(),
            quality: VoiceQuality::Default,
        },
        Voice {
            name: "Chloé".into(),
            identifier: "mock.voice.chloe".into(),
            language: "fr-FR".into(),
            quality: VoiceQuality::Default,
        },
    ]
}

/// Factory double with configurable construction behavior.
pub struct ScriptedFactory {
    fail_creates: AtomicUsize,
    hang: bool,
    delay: Option<Duration>,
    progress: bool,
    max_input: usize,
    catalog: Vec<EngineInfo>,
    fail_speak_texts: Mutex<Vec<String>>,
    create_calls: AtomicUsize,
    last_requested: Mutex<Option<String>>,
    engine: Mutex<Option<Arc<ScriptedEngine>>>,
}

impl ScriptedFactory {
    /// A factory whose engine comes up on the first attempt.
    pub fn ready() -> Self {
        Self {
            fail_creates: AtomicUsize::new(0),
            hang: false,
            delay: None,
            progress: true,
            max_input: usize::MAX,
            catalog: vec![
                EngineInfo {
                    name: "mock.primary".into(),
                    label: "Mock Primary".into(),
                    is_default: true,
                },
                EngineInfo {
                    name: "mock.alt".into(),
                    label: "Mock Alternate".into(),
                    is_default: false,
                },
            ],
            fail_speak_texts: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            last_requested: Mutex::new(None),
            engine: Mutex::new(None),
        }
    }

    /// Fail the first `n` construction attempts, then succeed.
    pub fn failing(n: usize) -> Self {
        let factory = Self::ready();
        factory.fail_creates.store(n, Ordering::SeqCst);
        factory
    }

    /// Never complete construction; the init timeout has to fire.
    pub fn hanging() -> Self {
        let mut factory = Self::ready();
        factory.hang = true;
        factory
    }

    /// Take `delay` to complete construction.
    pub fn delayed(delay: Duration) -> Self {
        let mut factory = Self::ready();
        factory.delay = Some(delay);
        factory
    }

    pub fn with_max_input(mut self, max: usize) -> Self {
        self.max_input = max;
        self
    }

    pub fn without_progress(mut self) -> Self {
        self.progress = false;
        self
    }

    /// Submissions of exactly `text` will fail at the engine.
    pub fn failing_speak_on(self, text: &str) -> Self {
        self.fail_speak_texts.lock().unwrap().push(text.to_string());
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn last_requested(&self) -> Option<String> {
        self.last_requested.lock().unwrap().clone()
    }

    /// The most recently constructed engine.
    pub fn engine(&self) -> Arc<ScriptedEngine> {
        self.engine
            .lock()
            .unwrap()
            .clone()
            .expect("no engine constructed yet")
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(
        &self,
        engine: Option<&str>,
        sink: EngineEventSink,
    ) -> Result<Arc<dyn EngineBinding>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_requested.lock().unwrap() = engine.map(|e| e.to_string());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) > 0 {
            self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            return Err(SpeechError::Engine("scripted construction failure".into()));
        }
        let created = Arc::new(ScriptedEngine::new(
            sink,
            self.progress,
            self.fail_speak_texts.lock().unwrap().clone(),
        ));
        *self.engine.lock().unwrap() = Some(Arc::clone(&created));
        Ok(created)
    }

    fn engines(&self) -> Vec<EngineInfo> {
        self.catalog.clone()
    }

    fn default_engine(&self) -> Option<String> {
        self.catalog
            .iter()
            .find(|e| e.is_default)
            .map(|e| e.name.clone())
    }

    fn max_input_length(&self) -> usize {
        self.max_input
    }
}

/// Audio host double counting duck/release calls.
#[derive(Default)]
pub struct CountingAudioHost {
    pub ducks: AtomicUsize,
    pub releases: AtomicUsize,
}

impl AudioSessionHost for CountingAudioHost {
    fn request_duck(&self, _policy: SilentMode) -> Result<()> {
        self.ducks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Receive the next event or fail the test after a grace period.
pub async fn recv_event(rx: &mut mpsc::Receiver<SpeechEvent>) -> SpeechEvent {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("event channel closed")
}

/// Assert that no event arrives within a grace period.
pub async fn expect_no_event(rx: &mut mpsc::Receiver<SpeechEvent>) {
    let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "unexpected event: {:?}", result);
}
