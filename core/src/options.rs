//! Session-wide and per-utterance voice options.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::EngineBinding;

/// How speech audio interacts with the host's silent/ringer state.
///
/// Ignored by hosts without a silent switch; also ignored whenever ducking is
/// requested, which takes priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilentMode {
    /// Leave the host audio session untouched.
    #[default]
    Obey,
    /// Speech is silenced by the ringer switch.
    Respect,
    /// Speech plays even when the ringer is off.
    Ignore,
}

/// Resolved voice options. One instance holds the session-wide defaults;
/// every utterance carries its own merged copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechOptions {
    /// Speech rate multiplier, clamped to [0.1, 2.0].
    pub rate: f32,
    /// Pitch multiplier, clamped to [0.1, 2.0].
    pub pitch: f32,
    /// Volume level, clamped to [0.0, 1.0].
    pub volume: f32,
    /// Lower other audio output while this speech plays.
    pub ducking: bool,
    /// Language tag (e.g. "en-US"); None leaves the engine default.
    pub language: Option<String>,
    /// Voice identifier from the engine catalog.
    pub voice: Option<String>,
    pub silent_mode: SilentMode,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            ducking: false,
            language: None,
            voice: None,
            silent_mode: SilentMode::Obey,
        }
    }
}

/// Field-wise overrides. Unset fields retain the prior value when applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechOptionsUpdate {
    pub rate: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
    pub ducking: Option<bool>,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub silent_mode: Option<SilentMode>,
}

impl SpeechOptions {
    /// Apply an update in place. Numeric fields are clamped to their valid
    /// range rather than rejected.
    pub fn apply(&mut self, update: &SpeechOptionsUpdate) {
        if let Some(rate) = update.rate {
            self.rate = rate.clamp(0.1, 2.0);
        }
        if let Some(pitch) = update.pitch {
            self.pitch = pitch.clamp(0.1, 2.0);
        }
        if let Some(volume) = update.volume {
            self.volume = volume.clamp(0.0, 1.0);
        }
        if let Some(ducking) = update.ducking {
            self.ducking = ducking;
        }
        if let Some(ref language) = update.language {
            self.language = Some(language.clone());
        }
        if let Some(ref voice) = update.voice {
            self.voice = Some(voice.clone());
        }
        if let Some(silent_mode) = update.silent_mode {
            self.silent_mode = silent_mode;
        }
    }

    /// A copy of `self` with `update` applied, leaving `self` untouched.
    pub fn merged(&self, update: &SpeechOptionsUpdate) -> SpeechOptions {
        let mut merged = self.clone();
        merged.apply(update);
        merged
    }
}

/// Push the engine-facing fields of `opts` down into the binding.
/// Faults are logged, not propagated: a bad voice or language tag must not
/// take the surrounding utterance down.
pub(crate) fn apply_to_engine(engine: &dyn EngineBinding, opts: &SpeechOptions) {
    if let Some(ref language) = opts.language {
        if let Err(e) = engine.set_language(language) {
            warn!(target = "speech", language = %language, error = %e, "Failed to apply language");
        }
    }
    if let Err(e) = engine.set_pitch(opts.pitch) {
        warn!(target = "speech", error = %e, "Failed to apply pitch");
    }
    if let Err(e) = engine.set_rate(opts.rate) {
        warn!(target = "speech", error = %e, "Failed to apply rate");
    }
    if let Some(ref voice) = opts.voice {
        if let Err(e) = engine.set_voice(voice) {
            warn!(target = "speech", voice = %voice, error = %e, "Failed to apply voice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_clamp_instead_of_rejecting() {
        let mut opts = SpeechOptions::default();
        opts.apply(&SpeechOptionsUpdate {
            rate: Some(5.0),
            pitch: Some(0.0),
            volume: Some(-1.0),
            ..Default::default()
        });
        assert_eq!(opts.rate, 2.0);
        assert_eq!(opts.pitch, 0.1);
        assert_eq!(opts.volume, 0.0);
    }

    #[test]
    fn merged_leaves_defaults_untouched() {
        let defaults = SpeechOptions::default();
        let merged = defaults.merged(&SpeechOptionsUpdate {
            rate: Some(1.5),
            voice: Some("tessa".into()),
            ..Default::default()
        });
        assert_eq!(merged.rate, 1.5);
        assert_eq!(merged.voice.as_deref(), Some("tessa"));
        assert_eq!(defaults.rate, 1.0);
        assert_eq!(defaults.voice, None);
    }

    #[test]
    fn unset_fields_retain_prior_values() {
        let mut opts = SpeechOptions::default();
        opts.apply(&SpeechOptionsUpdate {
            language: Some("fr-FR".into()),
            ..Default::default()
        });
        opts.apply(&SpeechOptionsUpdate {
            pitch: Some(0.8),
            ..Default::default()
        });
        assert_eq!(opts.language.as_deref(), Some("fr-FR"));
        assert_eq!(opts.pitch, 0.8);
    }
}
