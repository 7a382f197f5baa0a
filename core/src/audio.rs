//! Transient audio-output priority ("ducking") arbitration.
//!
//! The arbiter brackets each utterance's playback window with a duckable
//! claim on shared host audio output. The host primitive itself lives behind
//! [`AudioSessionHost`]; platforms without an audio-focus concept plug in
//! [`NoopAudioSession`].

use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::options::SilentMode;

/// Host audio-session boundary.
///
/// `request_duck` asks for a transient claim on shared audio output that
/// lowers ("ducks") other audio, scoped to an accessibility/speech usage
/// category. `release` abandons it.
#[cfg_attr(test, mockall::automock)]
pub trait AudioSessionHost: Send + Sync {
    fn request_duck(&self, policy: SilentMode) -> crate::Result<()>;
    fn release(&self);
}

/// Stub for hosts without an audio-focus primitive.
#[derive(Debug, Default)]
pub struct NoopAudioSession;

impl AudioSessionHost for NoopAudioSession {
    fn request_duck(&self, _policy: SilentMode) -> crate::Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

#[derive(Debug, Default)]
struct ArbiterState {
    /// Ducking preference of the utterance currently being played/enqueued.
    ducking: bool,
    policy: SilentMode,
    /// Whether a host claim is currently held.
    active: bool,
}

/// Requests and releases the ducking claim around utterance playback.
///
/// `activate`/`deactivate` are called in pairs bracketing each utterance;
/// every terminal and queue-clearing path deactivates, so a crashed or
/// erroring utterance still releases the claim.
pub struct AudioPriorityArbiter {
    host: Arc<dyn AudioSessionHost>,
    state: Mutex<ArbiterState>,
}

impl AudioPriorityArbiter {
    pub fn new(host: Arc<dyn AudioSessionHost>) -> Self {
        Self {
            host,
            state: Mutex::new(ArbiterState::default()),
        }
    }

    /// Record the ducking preference of the utterance being enqueued.
    pub fn configure(&self, ducking: bool, policy: SilentMode) {
        if let Ok(mut state) = self.state.lock() {
            state.ducking = ducking;
            state.policy = policy;
        }
    }

    /// Request the host claim. No-op unless the current utterance asked to
    /// duck, or when a claim is already held.
    pub fn activate(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.ducking || state.active {
            return;
        }
        match self.host.request_duck(state.policy) {
            Ok(()) => state.active = true,
            Err(e) => warn!(target = "speech", error = %e, "Audio duck request failed"),
        }
    }

    /// Release the host claim if one is held. Idempotent.
    pub fn deactivate(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.active {
            self.host.release();
            state.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_is_noop_without_ducking() {
        let mut host = MockAudioSessionHost::new();
        host.expect_request_duck().times(0);
        let arbiter = AudioPriorityArbiter::new(Arc::new(host));
        arbiter.configure(false, SilentMode::Obey);
        arbiter.activate();
    }

    #[test]
    fn activate_and_deactivate_pair_up() {
        let mut host = MockAudioSessionHost::new();
        host.expect_request_duck().times(1).returning(|_| Ok(()));
        host.expect_release().times(1).return_const(());
        let arbiter = AudioPriorityArbiter::new(Arc::new(host));
        arbiter.configure(true, SilentMode::Ignore);
        arbiter.activate();
        // Held claim is not re-requested.
        arbiter.activate();
        arbiter.deactivate();
        // Idempotent once released.
        arbiter.deactivate();
    }

    #[test]
    fn release_happens_even_after_preference_flips() {
        // A later utterance disabling ducking must not strand the claim the
        // previous one acquired.
        let mut host = MockAudioSessionHost::new();
        host.expect_request_duck().times(1).returning(|_| Ok(()));
        host.expect_release().times(1).return_const(());
        let arbiter = AudioPriorityArbiter::new(Arc::new(host));
        arbiter.configure(true, SilentMode::Obey);
        arbiter.activate();
        arbiter.configure(false, SilentMode::Obey);
        arbiter.deactivate();
    }

    #[test]
    fn failed_duck_request_leaves_claim_unheld() {
        let mut host = MockAudioSessionHost::new();
        host.expect_request_duck()
            .times(1)
            .returning(|_| Err(crate::SpeechError::Engine("focus denied".into())));
        host.expect_release().times(0);
        let arbiter = AudioPriorityArbiter::new(Arc::new(host));
        arbiter.configure(true, SilentMode::Obey);
        arbiter.activate();
        arbiter.deactivate();
    }
}
