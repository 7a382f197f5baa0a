//! Ordered utterance queue and the speak-next progression algorithm.
//!
//! All queue state lives behind one mutex; engine callbacks (serialized by
//! the session's pump task) and public API calls both go through it. At most
//! one utterance is Speaking at any time, and the cursor either points at it
//! or is `None` (idle).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::audio::AudioPriorityArbiter;
use crate::engine::{EngineBinding, EngineEvent, SpeakParams, SubmissionMode};
use crate::event::{EventDispatcher, SpeechEvent, SpeechEventKind};
use crate::options::{self, SpeechOptions};

/// Opaque utterance token, unique for the process lifetime. Correlates
/// engine callbacks to queue entries and outward events to caller-held
/// handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtteranceId(String);

impl UtteranceId {
    /// Mint a fresh id. Ids are unique for the process lifetime.
    pub fn generate() -> Self {
        Self(crate::utils::gen_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of one queued utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UtteranceStatus {
    Pending,
    Speaking,
    Paused,
    Completed,
    Error,
}

/// One queued unit of text with its merged options and resume bookkeeping.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub options: SpeechOptions,
    pub status: UtteranceStatus,
    /// Character index the current submission started from. 0 until the
    /// first pause.
    pub offset: usize,
    /// Last character position reported by the engine, absolute within
    /// `text` (`offset` + reported range start).
    pub position: usize,
}

#[derive(Default)]
struct QueueState {
    items: Vec<Utterance>,
    /// Index of the utterance currently owning the engine; `None` when idle.
    current: Option<usize>,
    paused: bool,
    /// Set between a resume submission and its Start callback, which is then
    /// reported as a Resume event instead of a Start event.
    resuming: bool,
}

/// Ordered utterance sequence driving "speak next" progression.
pub struct UtteranceQueue {
    state: Mutex<QueueState>,
    events: Arc<EventDispatcher>,
    arbiter: Arc<AudioPriorityArbiter>,
    defaults: Arc<Mutex<SpeechOptions>>,
}

impl UtteranceQueue {
    pub fn new(
        events: Arc<EventDispatcher>,
        arbiter: Arc<AudioPriorityArbiter>,
        defaults: Arc<Mutex<SpeechOptions>>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            events,
            arbiter,
            defaults,
        }
    }

    /// Append a new Pending utterance; when the engine is idle and the
    /// session is not paused, point the cursor at it and advance.
    pub fn enqueue(
        &self,
        engine: &Arc<dyn EngineBinding>,
        text: String,
        options: SpeechOptions,
    ) -> UtteranceId {
        let id = UtteranceId::generate();
        let mut state = self.lock();
        state.items.push(Utterance {
            id: id.clone(),
            text,
            options,
            status: UtteranceStatus::Pending,
            offset: 0,
            position: 0,
        });
        if !engine.is_speaking() && !state.paused {
            state.current = Some(state.items.len() - 1);
            self.advance_locked(&mut state, engine);
        }
        id
    }

    /// Pause the active utterance. Only possible when the engine reports
    /// progress (otherwise there is no resume position), speech is active and
    /// the session is not already paused. Returns whether a pause occurred.
    pub fn pause(&self, engine: &Arc<dyn EngineBinding>) -> bool {
        let mut state = self.lock();
        if !engine.supports_progress()
            || state.paused
            || !engine.is_speaking()
            || state.items.is_empty()
        {
            return false;
        }
        state.paused = true;
        // The Stop callback arriving with the paused flag set reclassifies
        // the interrupted item to Paused and reports a Pause event.
        if let Err(e) = engine.stop() {
            warn!(target = "speech", error = %e, "Engine stop for pause failed");
        }
        self.arbiter.deactivate();
        true
    }

    /// Resume the paused utterance from its recorded position. Returns
    /// whether a resumption occurred.
    pub fn resume(&self, engine: &Arc<dyn EngineBinding>) -> bool {
        let mut state = self.lock();
        if !engine.supports_progress()
            || !state.paused
            || state.items.is_empty()
            || state.current.is_none()
        {
            return false;
        }
        match state
            .items
            .iter()
            .position(|u| u.status == UtteranceStatus::Paused)
        {
            Some(idx) => {
                state.current = Some(idx);
                state.paused = false;
                self.arbiter.activate();
                self.advance_locked(&mut state, engine);
                true
            }
            None => {
                state.paused = false;
                false
            }
        }
    }

    /// Stop the session: interrupt the engine, emit a Stopped event for the
    /// indexed utterance and clear all queue state. Succeeds from any state;
    /// a no-op when already idle.
    pub fn stop(&self, engine: &Arc<dyn EngineBinding>) {
        let stopped = {
            let mut state = self.lock();
            if !engine.is_speaking() && !state.paused {
                return;
            }
            // Clear before requesting engine stop: the Stop callback racing
            // in must find nothing left to reclassify as Paused.
            let stopped = state
                .current
                .and_then(|idx| state.items.get(idx))
                .map(|item| item.id.clone());
            state.items.clear();
            state.current = None;
            state.paused = false;
            state.resuming = false;
            stopped
        };
        if let Err(e) = engine.stop() {
            warn!(target = "speech", error = %e, "Engine stop failed");
        }
        self.arbiter.deactivate();
        if let Some(id) = stopped {
            self.events
                .emit(SpeechEvent::new(SpeechEventKind::Stopped, &id));
        }
    }

    /// Clear all queue state without emitting events. Used on engine
    /// teardown and engine switches.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.items.clear();
        state.current = None;
        state.paused = false;
        state.resuming = false;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Current cursor position, `None` when idle.
    pub fn current_index(&self) -> Option<usize> {
        self.lock().current
    }

    /// Snapshot of (id, status) per queued utterance, in queue order.
    pub fn items(&self) -> Vec<(UtteranceId, UtteranceStatus)> {
        self.lock()
            .items
            .iter()
            .map(|u| (u.id.clone(), u.status))
            .collect()
    }

    /// Apply one engine lifecycle callback to queue state, emitting the
    /// corresponding outward event.
    pub fn handle_engine_event(&self, engine: &Arc<dyn EngineBinding>, event: EngineEvent) {
        let mut state = self.lock();
        match event {
            EngineEvent::Start(id) => {
                let Some(idx) = find(&state, &id) else {
                    debug!(target = "speech", id = %id, "Start for unknown utterance");
                    return;
                };
                state.items[idx].status = UtteranceStatus::Speaking;
                if state.resuming && state.items[idx].position > 0 {
                    state.resuming = false;
                    self.events
                        .emit(SpeechEvent::new(SpeechEventKind::Resume, &id));
                } else {
                    self.events
                        .emit(SpeechEvent::new(SpeechEventKind::Start, &id));
                }
            }
            EngineEvent::Done(id) => {
                let Some(idx) = find(&state, &id) else {
                    debug!(target = "speech", id = %id, "Done for unknown utterance");
                    return;
                };
                state.items[idx].status = UtteranceStatus::Completed;
                self.arbiter.deactivate();
                self.events
                    .emit(SpeechEvent::new(SpeechEventKind::Finish, &id));
                self.step_past_terminal(&mut state, engine);
            }
            EngineEvent::Error(id) => {
                let Some(idx) = find(&state, &id) else {
                    debug!(target = "speech", id = %id, "Error for unknown utterance");
                    return;
                };
                state.items[idx].status = UtteranceStatus::Error;
                self.arbiter.deactivate();
                self.events
                    .emit(SpeechEvent::new(SpeechEventKind::Error, &id));
                self.step_past_terminal(&mut state, engine);
            }
            EngineEvent::Stop { id, .. } => {
                let Some(idx) = find(&state, &id) else {
                    debug!(target = "speech", id = %id, "Stop for unknown utterance");
                    return;
                };
                if state.paused {
                    state.items[idx].status = UtteranceStatus::Paused;
                    self.events
                        .emit(SpeechEvent::new(SpeechEventKind::Pause, &id));
                } else {
                    state.items[idx].status = UtteranceStatus::Completed;
                    self.events
                        .emit(SpeechEvent::new(SpeechEventKind::Stopped, &id));
                }
            }
            EngineEvent::Progress { id, start, end } => {
                let Some(idx) = find(&state, &id) else {
                    return;
                };
                let position = state.items[idx].offset + start;
                state.items[idx].position = position;
                self.events.emit(SpeechEvent::progress(
                    &id,
                    end.saturating_sub(start),
                    position,
                ));
            }
        }
    }

    /// After a terminal callback: move the cursor past the finished item and
    /// keep the queue going, unless the session is paused.
    fn step_past_terminal(&self, state: &mut QueueState, engine: &Arc<dyn EngineBinding>) {
        if state.paused {
            return;
        }
        if let Some(idx) = state.current {
            state.current = Some(idx + 1);
            self.advance_locked(state, engine);
        }
    }

    /// Core progression loop: submit the item under the cursor, skipping
    /// terminal entries and items whose submission fails, until a submission
    /// sticks or the queue is exhausted.
    fn advance_locked(&self, state: &mut QueueState, engine: &Arc<dyn EngineBinding>) {
        if state.paused {
            return;
        }
        while let Some(idx) = state.current {
            if idx >= state.items.len() {
                // Queue exhausted: back to idle, and restore session-wide
                // defaults so the next ad-hoc call is unaffected by the last
                // utterance's overrides.
                state.current = None;
                let defaults = self
                    .defaults
                    .lock()
                    .map(|d| d.clone())
                    .unwrap_or_default();
                options::apply_to_engine(engine.as_ref(), &defaults);
                return;
            }
            let status = state.items[idx].status;
            match status {
                UtteranceStatus::Pending | UtteranceStatus::Paused => {
                    let resumed = status == UtteranceStatus::Paused;
                    let (text, mode, params, id, opts) = {
                        let item = &mut state.items[idx];
                        item.offset = if resumed { item.position } else { 0 };
                        let text = if resumed {
                            // A paused engine has no in-flight work left, so
                            // the resume submission uses flush semantics.
                            char_suffix(&item.text, item.offset)
                        } else {
                            item.text.clone()
                        };
                        let mode = if resumed {
                            SubmissionMode::Flush
                        } else {
                            SubmissionMode::Append
                        };
                        (
                            text,
                            mode,
                            SpeakParams {
                                volume: item.options.volume,
                            },
                            item.id.clone(),
                            item.options.clone(),
                        )
                    };
                    if resumed {
                        state.resuming = true;
                    }
                    options::apply_to_engine(engine.as_ref(), &opts);
                    match engine.speak(&text, mode, params, &id) {
                        Ok(()) => return,
                        Err(e) => {
                            // A failed submission must not stall the queue.
                            warn!(
                                target = "speech",
                                id = %id,
                                error = %e,
                                "Utterance submission failed; skipping"
                            );
                            state.items[idx].status = UtteranceStatus::Error;
                            if resumed {
                                state.resuming = false;
                            }
                            state.current = Some(idx + 1);
                        }
                    }
                }
                UtteranceStatus::Speaking
                | UtteranceStatus::Completed
                | UtteranceStatus::Error => {
                    state.current = Some(idx + 1);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn find(state: &QueueState, id: &UtteranceId) -> Option<usize> {
    state.items.iter().position(|u| &u.id == id)
}

/// Slice `text` from a character (not byte) offset.
fn char_suffix(text: &str, chars: usize) -> String {
    match text.char_indices().nth(chars) {
        Some((byte_idx, _)) => text[byte_idx..].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::char_suffix;

    #[test]
    fn char_suffix_slices_by_characters() {
        assert_eq!(char_suffix("hello world", 6), "world");
        assert_eq!(char_suffix("héllo wörld", 6), "wörld");
        assert_eq!(char_suffix("日本語 text", 4), "text");
    }

    #[test]
    fn char_suffix_past_end_is_empty() {
        assert_eq!(char_suffix("abc", 3), "");
        assert_eq!(char_suffix("abc", 10), "");
        assert_eq!(char_suffix("", 0), "");
    }
}
