// Pipeline events, sinks and tracing setup
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::pipeline::{Outcome, PipelineState};
use crate::provider::{DeliveryMode, ProviderError};
use crate::route::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
}

/// Something observable that happened while handling one message.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Transition {
        message_id: String,
        from: PipelineState,
        to: PipelineState,
    },
    /// No route for the platform; the message is dropped
    RouteMissing {
        message_id: String,
        platform: String,
    },
    /// Synthesis wanted but no provider is enabled
    NoProvider {
        message_id: String,
        platform: String,
    },
    SynthesisFailed {
        message_id: String,
        platform: String,
        provider: String,
        error: ProviderError,
        /// Chunks already delivered before the failure
        chunks_sent: u64,
    },
    DispatchFailed {
        message_id: String,
        platform: String,
        error: DispatchError,
    },
    Finished {
        message_id: String,
        platform: String,
        outcome: Outcome,
        provider: Option<String>,
        mode: Option<DeliveryMode>,
        chunks: u64,
    },
}

impl PipelineEvent {
    pub fn severity(&self) -> Severity {
        match self {
            PipelineEvent::Transition { .. } => Severity::Debug,
            PipelineEvent::Finished { .. } => Severity::Info,
            PipelineEvent::RouteMissing { .. }
            | PipelineEvent::NoProvider { .. }
            | PipelineEvent::SynthesisFailed { .. }
            | PipelineEvent::DispatchFailed { .. } => Severity::Warn,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            PipelineEvent::Transition { message_id, .. }
            | PipelineEvent::RouteMissing { message_id, .. }
            | PipelineEvent::NoProvider { message_id, .. }
            | PipelineEvent::SynthesisFailed { message_id, .. }
            | PipelineEvent::DispatchFailed { message_id, .. }
            | PipelineEvent::Finished { message_id, .. } => message_id,
        }
    }
}

/// Receives pipeline events. Called inline from the pipeline, so
/// implementations must be cheap and must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &PipelineEvent);
}

/// Renders events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Transition {
                message_id,
                from,
                to,
            } => {
                debug!(target: "pipeline", message_id = %message_id, from = ?from, to = ?to, "State transition")
            }
            PipelineEvent::RouteMissing {
                message_id,
                platform,
            } => {
                warn!(target: "pipeline", message_id = %message_id, platform = %platform, "No route configured; dropping message")
            }
            PipelineEvent::NoProvider {
                message_id,
                platform,
            } => {
                warn!(target: "pipeline", message_id = %message_id, platform = %platform, "No enabled TTS provider; forwarding text")
            }
            PipelineEvent::SynthesisFailed {
                message_id,
                provider,
                error,
                chunks_sent,
                ..
            } => {
                warn!(target: "pipeline", message_id = %message_id, provider = %provider, chunks_sent, error = %error, "Synthesis failed; falling back to text")
            }
            PipelineEvent::DispatchFailed {
                message_id,
                platform,
                error,
            } => {
                warn!(target: "pipeline", message_id = %message_id, platform = %platform, error = %error, "Dispatch failed")
            }
            PipelineEvent::Finished {
                message_id,
                platform,
                outcome,
                provider,
                mode,
                chunks,
            } => info!(
                target: "pipeline",
                message_id = %message_id,
                platform = %platform,
                outcome = outcome.as_str(),
                provider = provider.as_deref().unwrap_or("-"),
                mode = mode.map(|m| m.as_str()).unwrap_or("-"),
                chunks,
                "Message handled"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    pub event: PipelineEvent,
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct MemorySink {
    events: Mutex<VecDeque<RecordedEvent>>,
    max_size: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RecordedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recorded events, oldest first.
    pub fn records(&self) -> Vec<RecordedEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.lock().iter().map(|r| r.event.clone()).collect()
    }

    pub fn events_for(&self, message_id: &str) -> Vec<PipelineEvent> {
        self.lock()
            .iter()
            .filter(|r| r.event.message_id() == message_id)
            .map(|r| r.event.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<PipelineEvent> {
        self.lock()
            .iter()
            .filter(|r| r.event.severity() == Severity::Warn)
            .map(|r| r.event.clone())
            .collect()
    }

    /// States visited by a message in order, starting at `Idle`.
    pub fn states_for(&self, message_id: &str) -> Vec<PipelineState> {
        let mut states = vec![PipelineState::Idle];
        for event in self.events_for(message_id) {
            if let PipelineEvent::Transition { to, .. } = event {
                states.push(to);
            }
        }
        states
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &PipelineEvent) {
        let mut events = self.lock();
        if events.len() >= self.max_size {
            events.pop_front();
        }
        events.push_back(RecordedEvent {
            at: Utc::now(),
            event: event.clone(),
        });
    }
}

#[derive(Debug, Default)]
struct PlatformCounters {
    synthesized: AtomicU64,
    pass_through: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub synthesized: u64,
    pub pass_through: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub handled: u64,
    pub synthesized: u64,
    pub pass_through: u64,
    pub failed: u64,
    pub dropped: u64,
    pub chunks: u64,
    pub provider_failures: u64,
    pub dispatch_failures: u64,
    pub platforms: BTreeMap<String, PlatformStats>,
}

/// Bucket counting messages for platforms without a configured route.
pub const UNROUTED_PLATFORM: &str = "unrouted";

/// Counters derived from events, safe to update from many tasks.
///
/// Per-platform counters exist only for the platforms given at construction;
/// every other platform is counted under [`UNROUTED_PLATFORM`].
#[derive(Debug)]
pub struct PipelineStats {
    started_at: DateTime<Utc>,
    handled: AtomicU64,
    synthesized: AtomicU64,
    pass_through: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    chunks: AtomicU64,
    provider_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    platforms: HashMap<String, PlatformCounters>,
}

impl PipelineStats {
    pub fn new<I, S>(platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut platforms: HashMap<String, PlatformCounters> = platforms
            .into_iter()
            .map(|p| (p.into(), PlatformCounters::default()))
            .collect();
        platforms
            .entry(UNROUTED_PLATFORM.to_string())
            .or_default();
        Self {
            started_at: Utc::now(),
            handled: AtomicU64::new(0),
            synthesized: AtomicU64::new(0),
            pass_through: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            provider_failures: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            platforms,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let platforms = self
            .platforms
            .iter()
            .map(|(platform, c)| {
                (
                    platform.clone(),
                    PlatformStats {
                        synthesized: c.synthesized.load(Ordering::Relaxed),
                        pass_through: c.pass_through.load(Ordering::Relaxed),
                        failed: c.failed.load(Ordering::Relaxed),
                        dropped: c.dropped.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        StatsSnapshot {
            started_at: Some(self.started_at),
            handled: self.handled.load(Ordering::Relaxed),
            synthesized: self.synthesized.load(Ordering::Relaxed),
            pass_through: self.pass_through.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            platforms,
        }
    }

    fn count_outcome(&self, platform: &str, outcome: Outcome, chunks: u64) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.chunks.fetch_add(chunks, Ordering::Relaxed);

        let Some(counters) = self
            .platforms
            .get(platform)
            .or_else(|| self.platforms.get(UNROUTED_PLATFORM))
        else {
            return;
        };
        let (total, per_platform) = match outcome {
            Outcome::Synthesized => (&self.synthesized, &counters.synthesized),
            Outcome::PassThrough => (&self.pass_through, &counters.pass_through),
            Outcome::Failed => (&self.failed, &counters.failed),
            Outcome::Dropped => (&self.dropped, &counters.dropped),
        };
        total.fetch_add(1, Ordering::Relaxed);
        per_platform.fetch_add(1, Ordering::Relaxed);
    }
}

impl EventSink for PipelineStats {
    fn record(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Finished {
                platform,
                outcome,
                chunks,
                ..
            } => self.count_outcome(platform, *outcome, *chunks),
            PipelineEvent::SynthesisFailed { .. } => {
                self.provider_failures.fetch_add(1, Ordering::Relaxed);
            }
            PipelineEvent::DispatchFailed { .. } => {
                self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(platform: &str, outcome: Outcome, chunks: u64) -> PipelineEvent {
        PipelineEvent::Finished {
            message_id: "m".into(),
            platform: platform.into(),
            outcome,
            provider: None,
            mode: None,
            chunks,
        }
    }

    #[test]
    fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for id in ["a", "b", "c"] {
            sink.record(&PipelineEvent::RouteMissing {
                message_id: id.into(),
                platform: "qq".into(),
            });
        }
        let ids: Vec<String> = sink
            .events()
            .iter()
            .map(|e| e.message_id().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn memory_sink_records_are_timestamped_in_order() {
        let sink = MemorySink::new();
        sink.record(&finished("qq", Outcome::Synthesized, 1));
        sink.record(&finished("qq", Outcome::Failed, 0));
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].at <= records[1].at);
        assert!(matches!(
            records[1].event,
            PipelineEvent::Finished {
                outcome: Outcome::Failed,
                ..
            }
        ));
    }

    #[test]
    fn stats_count_outcomes_per_platform() {
        let stats = PipelineStats::new(["qq", "discord"]);
        stats.record(&finished("qq", Outcome::Synthesized, 3));
        stats.record(&finished("qq", Outcome::PassThrough, 0));
        stats.record(&finished("discord", Outcome::Dropped, 0));

        let snap = stats.snapshot();
        assert_eq!(snap.handled, 3);
        assert_eq!(snap.chunks, 3);
        assert_eq!(snap.platforms["qq"].synthesized, 1);
        assert_eq!(snap.platforms["qq"].pass_through, 1);
        assert_eq!(snap.platforms["discord"].dropped, 1);
    }

    #[test]
    fn unknown_platforms_share_one_bucket() {
        let stats = PipelineStats::new(["qq"]);
        for i in 0..10_000 {
            stats.record(&finished(&format!("bogus-{}", i), Outcome::Dropped, 0));
        }
        stats.record(&finished("qq", Outcome::Synthesized, 0));

        let snap = stats.snapshot();
        assert_eq!(snap.platforms.len(), 2);
        assert_eq!(snap.platforms[UNROUTED_PLATFORM].dropped, 10_000);
        assert_eq!(snap.platforms["qq"].synthesized, 1);
        assert_eq!(snap.dropped, 10_000);
        assert_eq!(snap.handled, 10_001);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        fanout.record(&finished("qq", Outcome::Failed, 0));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
