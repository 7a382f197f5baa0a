//! Engine initialization state machine with bounded retry and backoff.
//!
//! The supervisor owns engine construction: operations submitted before the
//! engine is ready are buffered and replayed in order once it is, or rejected
//! en masse when retries are exhausted. Construction is raced against a fixed
//! timeout; failures back off exponentially (1s, 2s, 4s) up to
//! [`MAX_INIT_RETRIES`] attempts before giving up. Timers and in-flight
//! constructions carry an attempt generation so superseded completions are
//! discarded rather than applied.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::{EngineBinding, EngineEventSink, EngineFactory};
use crate::options::{self, SpeechOptions};
use crate::{Result, SpeechError};

pub(crate) const MAX_INIT_RETRIES: u32 = 3;
pub(crate) const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Externally observable supervisor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

enum Phase {
    Uninitialized,
    Initializing,
    Ready(Arc<dyn EngineBinding>),
    Failed,
}

type PendingOp = Box<dyn FnOnce(Result<Arc<dyn EngineBinding>>) + Send>;

struct InitState {
    phase: Phase,
    retry_count: u32,
    /// Attempt generation; bumped per construction launch and on teardown.
    attempt: u64,
    pending: Vec<PendingOp>,
    selected_engine: Option<String>,
    /// Timeout watchdog or backoff timer for the current attempt. Aborted
    /// whenever it is superseded.
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    factory: Arc<dyn EngineFactory>,
    sink: EngineEventSink,
    defaults: Arc<Mutex<SpeechOptions>>,
    state: Mutex<InitState>,
}

/// Owns [`EngineBinding`] construction and readiness. Cheap to clone; all
/// clones share the same state.
#[derive(Clone)]
pub struct InitSupervisor {
    inner: Arc<Inner>,
}

impl InitSupervisor {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        sink: EngineEventSink,
        defaults: Arc<Mutex<SpeechOptions>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                sink,
                defaults,
                state: Mutex::new(InitState {
                    phase: Phase::Uninitialized,
                    retry_count: 0,
                    attempt: 0,
                    pending: Vec::new(),
                    selected_engine: None,
                    timer: None,
                }),
            }),
        }
    }

    /// Run `f` against the live engine, buffering it until readiness while
    /// initialization is in flight. Resolves exactly once: with `f`'s result,
    /// or with an initialization error if the engine never becomes ready.
    pub async fn with_engine<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Arc<dyn EngineBinding>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        Inner::submit(
            &self.inner,
            Box::new(move |ready| {
                let _ = tx.send(ready.and_then(|engine| f(&engine)));
            }),
        );
        rx.await
            .map_err(|_| SpeechError::Init("initialization task dropped".into()))?
    }

    /// Begin initialization unless one is already in flight.
    pub fn start_initialization(&self) {
        let mut state = self.inner.lock();
        if matches!(state.phase, Phase::Initializing) {
            return;
        }
        Inner::launch_attempt_locked(&self.inner, &mut state);
    }

    /// Switch to a different engine: tear down the current binding and rerun
    /// the whole initialization cycle against the new identifier. Resolves
    /// once the new engine is ready.
    pub async fn switch_engine(&self, name: &str) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if let Phase::Ready(engine) = &state.phase {
                if let Err(e) = engine.stop() {
                    warn!(target = "speech", error = %e, "Engine stop during switch failed");
                }
                engine.shutdown();
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.attempt += 1;
            state.phase = Phase::Uninitialized;
            state.retry_count = 0;
            state.selected_engine = Some(name.to_string());
        }
        // The switch's own completion rides the pending-op queue.
        self.with_engine(|_| Ok(())).await
    }

    /// Tear down the live binding and all timers. Buffered operations are
    /// rejected; a later operation re-initializes from scratch.
    pub fn shutdown(&self) {
        let rejected = {
            let mut state = self.inner.lock();
            if let Phase::Ready(engine) = &state.phase {
                if let Err(e) = engine.stop() {
                    warn!(target = "speech", error = %e, "Engine stop during shutdown failed");
                }
                engine.shutdown();
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.attempt += 1;
            state.phase = Phase::Uninitialized;
            state.retry_count = 0;
            std::mem::take(&mut state.pending)
        };
        for op in rejected {
            op(Err(SpeechError::Init("session shut down".into())));
        }
    }

    /// The live binding, when ready.
    pub fn engine(&self) -> Option<Arc<dyn EngineBinding>> {
        match &self.inner.lock().phase {
            Phase::Ready(engine) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    pub fn phase(&self) -> InitPhase {
        match &self.inner.lock().phase {
            Phase::Uninitialized => InitPhase::Uninitialized,
            Phase::Initializing => InitPhase::Initializing,
            Phase::Ready(_) => InitPhase::Ready,
            Phase::Failed => InitPhase::Failed,
        }
    }

    /// Explicitly selected engine identifier, `None` when on the host
    /// default.
    pub fn selected_engine(&self) -> Option<String> {
        self.inner.lock().selected_engine.clone()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, InitState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn submit(this: &Arc<Self>, op: PendingOp) {
        let mut state = this.lock();
        match &state.phase {
            Phase::Ready(engine) => {
                let engine = Arc::clone(engine);
                // Run outside the supervisor lock; ops take the queue lock.
                drop(state);
                op(Ok(engine));
            }
            Phase::Initializing => state.pending.push(op),
            Phase::Uninitialized | Phase::Failed => {
                state.pending.push(op);
                Self::launch_attempt_locked(this, &mut state);
            }
        }
    }

    /// Launch one construction attempt: bump the generation, arm the timeout
    /// watchdog and spawn the factory call. Caller holds the state lock.
    fn launch_attempt_locked(this: &Arc<Self>, state: &mut MutexGuard<'_, InitState>) {
        // Discard any prior binding before constructing a new one.
        if let Phase::Ready(engine) = &state.phase {
            engine.shutdown();
        }
        state.phase = Phase::Initializing;
        state.attempt += 1;
        let attempt = state.attempt;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let engine_id = state.selected_engine.clone();

        info!(
            target = "speech",
            attempt,
            engine = engine_id.as_deref().unwrap_or("default"),
            "Initializing synthesis engine"
        );

        let watchdog = Arc::clone(this);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(INIT_TIMEOUT).await;
            Self::on_init_failure(&watchdog, attempt, "engine initialization timed out");
        }));

        let constructor = Arc::clone(this);
        tokio::spawn(async move {
            let sink = constructor.sink.clone();
            match constructor.factory.create(engine_id.as_deref(), sink).await {
                Ok(engine) => Self::on_init_success(&constructor, attempt, engine),
                Err(e) => Self::on_init_failure(&constructor, attempt, &e.to_string()),
            }
        });
    }

    fn on_init_success(this: &Arc<Self>, attempt: u64, engine: Arc<dyn EngineBinding>) {
        let pending = {
            let mut state = this.lock();
            if state.attempt != attempt || !matches!(state.phase, Phase::Initializing) {
                // Superseded attempt; this binding will never be used.
                debug!(target = "speech", attempt, "Discarding stale engine binding");
                engine.shutdown();
                return;
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.phase = Phase::Ready(Arc::clone(&engine));
            state.retry_count = 0;
            std::mem::take(&mut state.pending)
        };

        info!(target = "speech", "Synthesis engine ready");
        let defaults = this.defaults.lock().map(|d| d.clone()).unwrap_or_default();
        options::apply_to_engine(engine.as_ref(), &defaults);

        for op in pending {
            op(Ok(Arc::clone(&engine)));
        }
    }

    fn on_init_failure(this: &Arc<Self>, attempt: u64, reason: &str) {
        let rejected = {
            let mut state = this.lock();
            if state.attempt != attempt || !matches!(state.phase, Phase::Initializing) {
                return;
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.retry_count += 1;
            if state.retry_count <= MAX_INIT_RETRIES {
                let delay = Duration::from_millis(1000u64 << (state.retry_count - 1));
                warn!(
                    target = "speech",
                    retry = state.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "Engine initialization failed; retrying"
                );
                // Phase stays Initializing through the backoff window so new
                // operations keep buffering instead of racing a second cycle.
                let backoff = Arc::clone(this);
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::retry(&backoff, attempt);
                }));
                return;
            }
            warn!(
                target = "speech",
                reason, "Engine initialization failed; retries exhausted"
            );
            state.retry_count = 0;
            state.phase = Phase::Failed;
            std::mem::take(&mut state.pending)
        };

        for op in rejected {
            op(Err(SpeechError::Init("engine failed to initialize".into())));
        }
    }

    fn retry(this: &Arc<Self>, scheduled_at: u64) {
        let mut state = this.lock();
        // The attempt counter has not moved during the backoff window; if it
        // has, something superseded this retry.
        if state.attempt != scheduled_at {
            return;
        }
        Self::launch_attempt_locked(this, &mut state);
    }
}
