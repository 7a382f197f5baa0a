//! CLI synthesizer bindings: drive local Piper / espeak-ng binaries.
//!
//! Each binding runs a sequential worker task: utterances are synthesized to
//! a temporary WAV with the selected binary, then played back through the
//! first available player (aplay | paplay | ffplay). Lifecycle callbacks go
//! out through the engine event sink:
//! - Start when synthesis begins
//! - Done after playback completes
//! - Stop { interrupted: true } when a flush or stop cuts the utterance off
//! - Error when synthesis or playback fails
//!
//! Neither binary reports mid-utterance character ranges, so these bindings
//! declare no progress support and the session cannot pause them.
//!
//! Env overrides:
//! - PIPER_BIN, PIPER_VOICE, PIPER_VOICE_DIR
//! - ESPEAK_BIN
//! - VERBA_TTS_TEMP_DIR, VERBA_TTS_PLAYER

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

use verba_core::engine::{
    EngineBinding, EngineEvent, EngineEventSink, EngineFactory, EngineInfo, SpeakParams,
    SubmissionMode, Voice, VoiceQuality,
};
use verba_core::queue::UtteranceId;
use verba_core::{Result, SpeechError};

use crate::utils::{bin_from_env_or_path, bin_from_path};

/// Which local synthesizer a binding drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliEngineKind {
    Piper,
    Espeak,
}

impl CliEngineKind {
    fn name(self) -> &'static str {
        match self {
            CliEngineKind::Piper => "piper",
            CliEngineKind::Espeak => "espeak-ng",
        }
    }

    fn label(self) -> &'static str {
        match self {
            CliEngineKind::Piper => "Piper",
            CliEngineKind::Espeak => "eSpeak NG",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CliEngineConfig {
    pub temp_dir: PathBuf,
    pub sample_rate: u32,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub piper_voice_dir: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
    /// Preferred playback binary name; the aplay/paplay/ffplay fallback
    /// chain is used when unset or missing.
    pub player: Option<String>,
}

impl Default for CliEngineConfig {
    fn default() -> Self {
        let temp_dir = std::env::var("VERBA_TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        Self {
            temp_dir,
            sample_rate: 16_000,
            piper_bin: bin_from_env_or_path("PIPER_BIN", "piper"),
            piper_voice: std::env::var("PIPER_VOICE").ok().map(PathBuf::from),
            piper_voice_dir: std::env::var("PIPER_VOICE_DIR").ok().map(PathBuf::from),
            espeak_bin: bin_from_env_or_path("ESPEAK_BIN", "espeak-ng")
                .or_else(|| bin_from_path("espeak")),
            player: std::env::var("VERBA_TTS_PLAYER").ok(),
        }
    }
}

/// Builds [`CliEngine`] bindings for the synthesizers detected on this host.
/// The catalog prefers Piper (higher quality, needs a voice model) over
/// espeak-ng.
pub struct CliEngineFactory {
    cfg: CliEngineConfig,
}

impl CliEngineFactory {
    pub fn new(cfg: CliEngineConfig) -> Self {
        // Log detected engines once
        if let Some(ref bin) = cfg.piper_bin {
            info!(target = "tts", bin = ?bin, "Detected Piper binary");
        }
        if let Some(ref bin) = cfg.espeak_bin {
            info!(target = "tts", bin = ?bin, "Detected espeak-ng binary");
        }
        Self { cfg }
    }

    fn detected(&self) -> Vec<CliEngineKind> {
        let mut kinds = Vec::new();
        if self.cfg.piper_bin.is_some() {
            kinds.push(CliEngineKind::Piper);
        }
        if self.cfg.espeak_bin.is_some() {
            kinds.push(CliEngineKind::Espeak);
        }
        kinds
    }
}

impl Default for CliEngineFactory {
    fn default() -> Self {
        Self::new(CliEngineConfig::default())
    }
}

#[async_trait]
impl EngineFactory for CliEngineFactory {
    async fn create(
        &self,
        engine: Option<&str>,
        sink: EngineEventSink,
    ) -> Result<Arc<dyn EngineBinding>> {
        let detected = self.detected();
        let kind = match engine {
            Some(name) => detected
                .iter()
                .copied()
                .find(|kind| kind.name() == name)
                .ok_or_else(|| {
                    SpeechError::Validation(format!("engine '{name}' is not available"))
                })?,
            None => detected.first().copied().ok_or_else(|| {
                SpeechError::Init(
                    "no local synthesizer found (piper or espeak-ng required)".into(),
                )
            })?,
        };

        // Voice enumeration shells out; keep it off the async path.
        let cfg = self.cfg.clone();
        let voices = task::spawn_blocking({
            let cfg = cfg.clone();
            move || enumerate_voices(kind, &cfg)
        })
        .await
        .map_err(|e| SpeechError::Engine(e.to_string()))?;

        Ok(Arc::new(CliEngine::spawn(kind, cfg, voices, sink)))
    }

    fn engines(&self) -> Vec<EngineInfo> {
        self.detected()
            .iter()
            .enumerate()
            .map(|(idx, kind)| EngineInfo {
                name: kind.name().to_string(),
                label: kind.label().to_string(),
                is_default: idx == 0,
            })
            .collect()
    }

    fn default_engine(&self) -> Option<String> {
        self.detected().first().map(|kind| kind.name().to_string())
    }
}

/// Voice parameters accumulated through the setter surface; snapshotted into
/// each submission.
#[derive(Clone, Debug)]
struct VoiceSettings {
    voice: Option<String>,
    language: Option<String>,
    pitch: f32,
    rate: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: None,
            language: None,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

struct SpeakJob {
    id: UtteranceId,
    text: String,
    volume: f32,
    settings: VoiceSettings,
    /// Flush generation this job belongs to; jobs from older generations are
    /// skipped by the worker.
    generation: u64,
}

enum WorkerCmd {
    Speak(SpeakJob),
    Shutdown,
}

/// A live CLI synthesizer binding.
pub struct CliEngine {
    tx: mpsc::UnboundedSender<WorkerCmd>,
    outstanding: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
    player_slot: Arc<Mutex<Option<Child>>>,
    settings: Mutex<VoiceSettings>,
    voices: Vec<Voice>,
}

impl CliEngine {
    fn spawn(
        kind: CliEngineKind,
        cfg: CliEngineConfig,
        voices: Vec<Voice>,
        sink: EngineEventSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let generation = Arc::new(AtomicU64::new(0));
        let player_slot = Arc::new(Mutex::new(None));

        let worker = Worker {
            kind,
            cfg,
            sink,
            outstanding: Arc::clone(&outstanding),
            generation: Arc::clone(&generation),
            player_slot: Arc::clone(&player_slot),
        };
        tokio::spawn(worker.run(rx));

        Self {
            tx,
            outstanding,
            generation,
            player_slot,
            settings: Mutex::new(VoiceSettings::default()),
            voices,
        }
    }

    fn kill_player(&self) {
        let mut slot = match self.player_slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(child) = slot.as_mut() {
            if let Err(e) = child.kill() {
                debug!(target = "tts", error = %e, "Player kill failed");
            }
        }
    }

    fn settings_snapshot(&self) -> VoiceSettings {
        match self.settings.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_settings(&self, f: impl FnOnce(&mut VoiceSettings)) {
        let mut settings = match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut settings);
    }
}

impl EngineBinding for CliEngine {
    fn speak(
        &self,
        text: &str,
        mode: SubmissionMode,
        params: SpeakParams,
        utterance_id: &UtteranceId,
    ) -> Result<()> {
        if mode == SubmissionMode::Flush {
            // Strand queued jobs and cut the current playback short.
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.kill_player();
        }
        let job = SpeakJob {
            id: utterance_id.clone(),
            text: text.to_string(),
            volume: params.volume,
            settings: self.settings_snapshot(),
            generation: self.generation.load(Ordering::SeqCst),
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(WorkerCmd::Speak(job)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(SpeechError::Engine("engine worker is gone".into()));
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.kill_player();
        Ok(())
    }

    fn is_speaking(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) > 0
    }

    fn supports_progress(&self) -> bool {
        false
    }

    fn voices(&self) -> Result<Vec<Voice>> {
        Ok(self.voices.clone())
    }

    fn set_voice(&self, identifier: &str) -> Result<()> {
        let identifier = identifier.to_string();
        self.update_settings(|s| s.voice = Some(identifier));
        Ok(())
    }

    fn set_language(&self, tag: &str) -> Result<()> {
        let tag = tag.to_string();
        self.update_settings(|s| s.language = Some(tag));
        Ok(())
    }

    fn set_pitch(&self, pitch: f32) -> Result<()> {
        self.update_settings(|s| s.pitch = pitch);
        Ok(())
    }

    fn set_rate(&self, rate: f32) -> Result<()> {
        self.update_settings(|s| s.rate = rate);
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.stop();
        let _ = self.tx.send(WorkerCmd::Shutdown);
    }
}

enum PlayOutcome {
    Completed,
    Interrupted,
}

/// Sequential utterance worker: one synthesis + playback at a time.
#[derive(Clone)]
struct Worker {
    kind: CliEngineKind,
    cfg: CliEngineConfig,
    sink: EngineEventSink,
    outstanding: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
    player_slot: Arc<Mutex<Option<Child>>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WorkerCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WorkerCmd::Shutdown => break,
                WorkerCmd::Speak(job) => {
                    if job.generation != self.generation.load(Ordering::SeqCst) {
                        debug!(target = "tts", id = %job.id, "Skipping flushed utterance");
                        self.outstanding.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    self.speak_one(job).await;
                }
            }
        }
    }

    async fn speak_one(&self, job: SpeakJob) {
        let id = job.id.clone();
        let _ = self.sink.send(EngineEvent::Start(id.clone()));

        let worker = self.clone();
        let outcome = task::spawn_blocking(move || worker.synth_and_play(&job)).await;

        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let event = match outcome {
            Ok(Ok(PlayOutcome::Completed)) => EngineEvent::Done(id),
            Ok(Ok(PlayOutcome::Interrupted)) => EngineEvent::Stop {
                id,
                interrupted: true,
            },
            Ok(Err(e)) => {
                warn!(target = "tts", id = %id, error = %e, "Synthesis failed");
                EngineEvent::Error(id)
            }
            Err(e) => {
                warn!(target = "tts", id = %id, error = %e, "Synthesis task failed");
                EngineEvent::Error(id)
            }
        };
        let _ = self.sink.send(event);
    }

    fn synth_and_play(&self, job: &SpeakJob) -> Result<PlayOutcome> {
        let wav_path = self.cfg.temp_dir.join(format!("verba_{}.wav", job.id));

        match self.kind {
            CliEngineKind::Piper => self.synth_with_piper(job, &wav_path)?,
            CliEngineKind::Espeak => self.synth_with_espeak(job, &wav_path)?,
        }
        if job.generation != self.generation.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(&wav_path);
            return Ok(PlayOutcome::Interrupted);
        }

        // Post-process volume for Piper only (espeak handles it via flag)
        if self.kind == CliEngineKind::Piper && (job.volume - 1.0).abs() > f32::EPSILON {
            if let Err(e) = scale_wav_pcm16_inplace(&wav_path, job.volume) {
                warn!(target = "tts", error = %e, "Failed to scale volume for WAV");
            }
        }

        let played = self.play_wav(&wav_path)?;
        let interrupted = job.generation != self.generation.load(Ordering::SeqCst);
        if played {
            let _ = std::fs::remove_file(&wav_path);
        }
        Ok(if interrupted {
            PlayOutcome::Interrupted
        } else {
            PlayOutcome::Completed
        })
    }

    fn synth_with_piper(&self, job: &SpeakJob, out_wav: &Path) -> Result<()> {
        let piper = self
            .cfg
            .piper_bin
            .as_ref()
            .ok_or_else(|| SpeechError::Engine("Piper binary not found".into()))?;
        let voice_path = resolve_piper_voice_path(&self.cfg, job.settings.voice.as_deref())
            .ok_or_else(|| {
                SpeechError::Engine("Piper voice not found; set PIPER_VOICE or a voice".into())
            })?;

        let mut cmd = Command::new(piper);
        cmd.arg("-m").arg(voice_path);
        cmd.arg("-f").arg(out_wav);
        let length_scale = (1.0f32 / job.settings.rate).clamp(0.5, 2.0);
        cmd.arg("--length_scale").arg(format!("{:.2}", length_scale));
        cmd.arg("--sample_rate").arg(self.cfg.sample_rate.to_string());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(target = "tts", command = ?cmd, "Running piper");
        let mut child = cmd.spawn().map_err(SpeechError::Io)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(job.text.as_bytes())
                .map_err(SpeechError::Io)?;
        }
        let output = child.wait_with_output().map_err(SpeechError::Io)?;
        if !output.status.success() {
            return Err(SpeechError::Engine(format!(
                "Piper failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn synth_with_espeak(&self, job: &SpeakJob, out_wav: &Path) -> Result<()> {
        let espeak = self
            .cfg
            .espeak_bin
            .as_ref()
            .ok_or_else(|| SpeechError::Engine("espeak-ng not found".into()))?;
        let mut cmd = Command::new(espeak);
        if let Some(voice) = job
            .settings
            .voice
            .as_deref()
            .or(job.settings.language.as_deref())
        {
            cmd.arg("-v").arg(voice);
        }
        cmd.arg("-s").arg(espeak_wpm(job.settings.rate).to_string());
        cmd.arg("-a").arg(espeak_amp(job.volume).to_string());
        cmd.arg("-p").arg(espeak_pitch(job.settings.pitch).to_string());
        cmd.arg("-w").arg(out_wav);
        cmd.arg(&job.text);

        debug!(target = "tts", command = ?cmd, "Running espeak-ng");
        let output = cmd.output().map_err(SpeechError::Io)?;
        if !output.status.success() {
            return Err(SpeechError::Engine(format!(
                "espeak-ng failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Play the WAV through the configured or first available player.
    /// Returns false when no player exists (the WAV is kept on disk).
    fn play_wav(&self, wav_path: &Path) -> Result<bool> {
        let Some(player) = select_player(self.cfg.player.as_deref()) else {
            info!(target = "tts", path = ?wav_path, "No audio player found; kept WAV on disk");
            return Ok(false);
        };
        let name = player.file_name().and_then(|s| s.to_str()).unwrap_or("");
        let mut cmd = Command::new(&player);
        if name == "ffplay" {
            cmd.arg("-autoexit").arg("-nodisp");
        }
        cmd.arg(wav_path);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd.spawn().map_err(SpeechError::Io)?;
        self.wait_in_player_slot(child).map_err(SpeechError::Io)?;
        Ok(true)
    }

    /// Park the child in the shared slot while waiting so `stop()` can kill
    /// it from another task.
    fn wait_in_player_slot(&self, child: Child) -> std::io::Result<()> {
        {
            let mut slot = match self.player_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(child);
        }
        loop {
            let mut slot = match self.player_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slot.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(_status)) => {
                        slot.take();
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        slot.take();
                        return Err(e);
                    }
                },
                None => return Ok(()),
            }
            drop(slot);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }
}

fn enumerate_voices(kind: CliEngineKind, cfg: &CliEngineConfig) -> Vec<Voice> {
    match kind {
        CliEngineKind::Espeak => {
            let Some(espeak) = cfg.espeak_bin.as_ref() else {
                return Vec::new();
            };
            match Command::new(espeak).arg("--voices").output() {
                Ok(output) if output.status.success() => {
                    parse_espeak_voices(&String::from_utf8_lossy(&output.stdout))
                }
                Ok(output) => {
                    warn!(
                        target = "tts",
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "espeak-ng --voices failed"
                    );
                    Vec::new()
                }
                Err(e) => {
                    warn!(target = "tts", error = %e, "Failed to run espeak-ng --voices");
                    Vec::new()
                }
            }
        }
        CliEngineKind::Piper => {
            let mut voices = Vec::new();
            let Some(dir) = cfg.piper_voice_dir.as_ref() else {
                return voices;
            };
            let Ok(entries) = std::fs::read_dir(dir) else {
                return voices;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("onnx") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        voices.push(voice_from_piper_filename(stem));
                    }
                }
            }
            voices
        }
    }
}

/// Parse `espeak-ng --voices` tabular output into the voice catalog.
fn parse_espeak_voices(output: &str) -> Vec<Voice> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let language = fields[1];
            Some(Voice {
                name: fields[3].replace('_', " "),
                identifier: language.to_string(),
                language: language.to_string(),
                quality: VoiceQuality::Default,
            })
        })
        .collect()
}

/// Piper voice models are named `<lang>-<voice>-<quality>.onnx`,
/// e.g. `en_US-amy-medium.onnx`.
fn voice_from_piper_filename(stem: &str) -> Voice {
    let mut parts = stem.splitn(3, '-');
    let language = parts.next().unwrap_or("").replace('_', "-");
    let name = parts.next().unwrap_or(stem).to_string();
    let quality = if stem.ends_with("-high") {
        VoiceQuality::Enhanced
    } else {
        VoiceQuality::Default
    };
    Voice {
        name,
        identifier: stem.to_string(),
        language,
        quality,
    }
}

fn resolve_piper_voice_path(cfg: &CliEngineConfig, voice: Option<&str>) -> Option<PathBuf> {
    if let Some(configured) = &cfg.piper_voice {
        return Some(configured.clone());
    }
    let voice = voice?;
    let direct = PathBuf::from(voice);
    if direct.exists() {
        return Some(direct);
    }
    if let Some(dir) = &cfg.piper_voice_dir {
        let candidate = dir.join(voice);
        if candidate.exists() {
            return Some(candidate);
        }
        for ext in ["onnx", "onnx.gz"] {
            let candidate = dir.join(format!("{voice}.{ext}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

fn select_player(pref: Option<&str>) -> Option<PathBuf> {
    if let Some(name) = pref {
        if let Some(bin) = bin_from_path(name) {
            return Some(bin);
        }
    }
    bin_from_path("aplay")
        .or_else(|| bin_from_path("paplay"))
        .or_else(|| bin_from_path("ffplay"))
}

fn espeak_wpm(rate: f32) -> i32 {
    (160.0 * rate).round().clamp(80.0, 450.0) as i32
}

fn espeak_amp(volume: f32) -> i32 {
    (100.0 * volume).round().clamp(0.0, 200.0) as i32
}

fn espeak_pitch(pitch: f32) -> i32 {
    (50.0 * pitch).round().clamp(0.0, 99.0) as i32
}

fn scale_wav_pcm16_inplace(path: &Path, gain: f32) -> std::io::Result<()> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;

    if buf.len() < 12 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Ok(());
    }
    let mut idx = 12;
    let mut data_start = None;
    let mut data_len = 0usize;
    while idx + 8 <= buf.len() {
        let chunk_id = &buf[idx..idx + 4];
        let sz =
            u32::from_le_bytes([buf[idx + 4], buf[idx + 5], buf[idx + 6], buf[idx + 7]]) as usize;
        if chunk_id == b"data" {
            data_start = Some(idx + 8);
            data_len = sz;
            break;
        }
        idx += 8 + sz;
    }
    if let Some(start) = data_start {
        let end = (start + data_len).min(buf.len());
        let data = &mut buf[start..end];
        for chunk in data.chunks_exact_mut(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            let scaled = (sample as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            let bytes = scaled.to_le_bytes();
            chunk[0] = bytes[0];
            chunk[1] = bytes[1];
        }
        let mut out = File::create(path)?;
        out.write_all(&buf)?;
    }
    Ok(())
}
