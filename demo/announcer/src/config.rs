use std::fs;
use std::path::Path;

use serde::Deserialize;
use verba_engines::CliEngineConfig;

use verba_core::options::SpeechOptionsUpdate;

/// High-level configuration for the announcer demo
#[derive(Clone, Debug)]
pub struct AnnouncerConfig {
    pub rate: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
    pub ducking: bool,
    pub voice: Option<String>,
    pub language: Option<String>,
    /// Explicit engine identifier ("piper" | "espeak-ng"); host default when
    /// unset.
    pub engine: Option<String>,
    pub player: Option<String>,
    pub sample_rate: u32,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            rate: env_f32("ANNOUNCER_RATE"),
            pitch: env_f32("ANNOUNCER_PITCH"),
            volume: env_f32("ANNOUNCER_VOLUME"),
            ducking: std::env::var("ANNOUNCER_DUCKING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            voice: env_string("ANNOUNCER_VOICE"),
            language: env_string("ANNOUNCER_LANGUAGE"),
            engine: env_string("ANNOUNCER_ENGINE"),
            player: env_string("ANNOUNCER_PLAYER"),
            sample_rate: std::env::var("ANNOUNCER_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(16_000),
        }
    }
}

impl AnnouncerConfig {
    /// Load configuration from a TOML file (path via ANNOUNCER_CONFIG or
    /// ./announcer.toml), overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("ANNOUNCER_CONFIG").unwrap_or_else(|_| "announcer.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "announcer", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<AnnouncerToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target = "announcer", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "announcer", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Session defaults derived from this configuration.
    pub fn voice_update(&self) -> SpeechOptionsUpdate {
        SpeechOptionsUpdate {
            rate: self.rate,
            pitch: self.pitch,
            volume: self.volume,
            ducking: Some(self.ducking),
            language: self.language.clone(),
            voice: self.voice.clone(),
            silent_mode: None,
        }
    }

    /// Engine-binding configuration derived from this configuration.
    pub fn engine_config(&self) -> CliEngineConfig {
        let mut cfg = CliEngineConfig::default();
        cfg.sample_rate = self.sample_rate;
        if self.player.is_some() {
            cfg.player = self.player.clone();
        }
        cfg
    }
}

/// TOML overlay mirroring AnnouncerConfig with every field optional.
#[derive(Debug, Deserialize, Default)]
struct AnnouncerToml {
    rate: Option<f32>,
    pitch: Option<f32>,
    volume: Option<f32>,
    ducking: Option<bool>,
    voice: Option<String>,
    language: Option<String>,
    engine: Option<String>,
    player: Option<String>,
    sample_rate: Option<u32>,
}

impl AnnouncerToml {
    fn overlay(self, mut base: AnnouncerConfig) -> AnnouncerConfig {
        if self.rate.is_some() {
            base.rate = self.rate;
        }
        if self.pitch.is_some() {
            base.pitch = self.pitch;
        }
        if self.volume.is_some() {
            base.volume = self.volume;
        }
        if let Some(ducking) = self.ducking {
            base.ducking = ducking;
        }
        if self.voice.is_some() {
            base.voice = self.voice;
        }
        if self.language.is_some() {
            base.language = self.language;
        }
        if self.engine.is_some() {
            base.engine = self.engine;
        }
        if self.player.is_some() {
            base.player = self.player;
        }
        if let Some(sample_rate) = self.sample_rate {
            base.sample_rate = sample_rate;
        }
        base
    }
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse::<f32>().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}
