// Outward session events and their fan-out to subscribers
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::queue::UtteranceId;
use crate::utils::now_ms;

/// Discriminant of an outward event, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeechEventKind {
    Start,
    Finish,
    Pause,
    Resume,
    Stopped,
    Error,
    Progress,
}

/// One outward session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechEvent {
    pub kind: SpeechEventKind,
    pub id: UtteranceId,
    pub timestamp_ms: i64,
    /// Progress only: count of characters in the range being spoken.
    pub length: Option<usize>,
    /// Progress only: character position within the utterance text.
    pub location: Option<usize>,
}

impl SpeechEvent {
    pub fn new(kind: SpeechEventKind, id: &UtteranceId) -> Self {
        Self {
            kind,
            id: id.clone(),
            timestamp_ms: now_ms(),
            length: None,
            location: None,
        }
    }

    pub fn progress(id: &UtteranceId, length: usize, location: usize) -> Self {
        Self {
            kind: SpeechEventKind::Progress,
            id: id.clone(),
            timestamp_ms: now_ms(),
            length: Some(length),
            location: Some(location),
        }
    }
}

/// Subscription information
struct Subscription {
    kinds: Vec<SpeechEventKind>,
    sender: mpsc::Sender<SpeechEvent>,
}

/// Delivery statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub total_emitted: u64,
    pub total_delivered: u64,
    pub dropped_events: u64,
    pub active_subscriptions: usize,
}

/// Fans session events out to subscribers, filtering by kind.
///
/// Emission never blocks the callback path that produced the event: a slow
/// subscriber with a full channel gets events dropped, accounted in the
/// stats.
pub struct EventDispatcher {
    subscriptions: DashMap<String, Subscription>,
    stats: Mutex<DispatcherStats>,
    next_sub: AtomicU64,
}

const SUBSCRIPTION_CAPACITY: usize = 256;

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            stats: Mutex::new(DispatcherStats::default()),
            next_sub: AtomicU64::new(0),
        }
    }

    /// Subscribe to events of the given kinds. An empty filter receives
    /// everything.
    pub fn subscribe(
        &self,
        kinds: Vec<SpeechEventKind>,
    ) -> (String, mpsc::Receiver<SpeechEvent>) {
        let subscription_id = format!("sub_{}", self.next_sub.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        self.subscriptions
            .insert(subscription_id.clone(), Subscription { kinds, sender: tx });
        self.update_stats(|stats| stats.active_subscriptions += 1);

        debug!(
            target = "speech",
            subscription = %subscription_id,
            "Created event subscription"
        );
        (subscription_id, rx)
    }

    /// Drop a subscription; its receiver's channel closes.
    pub fn unsubscribe(&self, subscription_id: &str) {
        if self.subscriptions.remove(subscription_id).is_some() {
            self.update_stats(|stats| {
                stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
            });
            debug!(target = "speech", subscription = %subscription_id, "Unsubscribed");
        }
    }

    /// Deliver `event` to every matching subscriber without blocking.
    pub fn emit(&self, event: SpeechEvent) {
        let mut delivered = 0u64;
        let mut dropped = 0u64;

        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if !sub.kinds.is_empty() && !sub.kinds.contains(&event.kind) {
                continue;
            }
            if sub.sender.try_send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
                warn!(
                    target = "speech",
                    subscription = %entry.key(),
                    kind = ?event.kind,
                    "Dropped event for slow subscriber"
                );
            }
        }

        self.update_stats(|stats| {
            stats.total_emitted += 1;
            stats.total_delivered += delivered;
            stats.dropped_events += dropped;
        });
    }

    /// Get delivery stats
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut DispatcherStats),
    {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
