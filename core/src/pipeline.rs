//! Per-message synthesis orchestration.
//!
//! One `handle` call drives a message through
//! `Idle -> Gating -> Resolving -> Dispatching -> {Streaming | Batching} -> Completed | Failed`
//! and never returns an error: provider failures fall back to the original text.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::RelayConfig;
use crate::gate::ProbabilityGate;
use crate::message::Message;
use crate::preset::Preset;
use crate::provider::{DeliveryMode, ProviderError};
use crate::providers;
use crate::registry::{ProviderRegistry, RegisteredProvider};
use crate::route::{Destination, Outbound, RouteDispatcher, RouteTable, StreamStatus};
use crate::telemetry::{EventSink, PipelineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Gating,
    Resolving,
    Dispatching,
    Streaming,
    Batching,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Gating)
                | (Idle, Failed)
                | (Gating, Resolving)
                | (Gating, Completed)
                | (Gating, Failed)
                | (Resolving, Dispatching)
                | (Resolving, Completed)
                | (Resolving, Failed)
                | (Dispatching, Streaming)
                | (Dispatching, Batching)
                | (Streaming, Completed)
                | (Streaming, Failed)
                | (Batching, Completed)
                | (Batching, Failed)
        )
    }
}

/// How a message left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Audio was delivered
    Synthesized,
    /// Original text forwarded without synthesis
    PassThrough,
    /// Synthesis or delivery failed; text fallback sent where possible
    Failed,
    /// No route for the platform, nothing sent
    Dropped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Synthesized => "synthesized",
            Outcome::PassThrough => "pass_through",
            Outcome::Failed => "failed",
            Outcome::Dropped => "dropped",
        }
    }
}

/// State of one `handle` call.
struct Invocation<'a> {
    message: Arc<Message>,
    state: PipelineState,
    provider: Option<String>,
    mode: Option<DeliveryMode>,
    chunks: u64,
    sink: &'a dyn EventSink,
}

impl<'a> Invocation<'a> {
    fn new(message: Arc<Message>, sink: &'a dyn EventSink) -> Self {
        Self {
            message,
            state: PipelineState::Idle,
            provider: None,
            mode: None,
            chunks: 0,
            sink,
        }
    }

    fn advance(&mut self, to: PipelineState) {
        if !self.state.can_transition_to(to) {
            error!(target: "pipeline", message_id = %self.message.id, from = ?self.state, to = ?to, "Illegal state transition");
        }
        self.sink.record(&PipelineEvent::Transition {
            message_id: self.message.id.clone(),
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn finish(self, outcome: Outcome) -> Outcome {
        self.sink.record(&PipelineEvent::Finished {
            message_id: self.message.id.clone(),
            platform: self.message.platform.clone(),
            outcome,
            provider: self.provider,
            mode: self.mode,
            chunks: self.chunks,
        });
        outcome
    }
}

/// Orchestrates gate, preset resolution, provider selection, synthesis and dispatch.
///
/// All collaborators are shared read-only, so one pipeline serves any number of
/// concurrent `handle` calls.
pub struct SynthesisPipeline {
    registry: Arc<ProviderRegistry>,
    routes: Arc<RouteTable>,
    gate: ProbabilityGate,
    dispatcher: Arc<dyn RouteDispatcher>,
    sink: Arc<dyn EventSink>,
}

impl SynthesisPipeline {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        routes: Arc<RouteTable>,
        gate: ProbabilityGate,
        dispatcher: Arc<dyn RouteDispatcher>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            routes,
            gate,
            dispatcher,
            sink,
        }
    }

    /// Build registry, routes and gate from a validated configuration.
    pub fn from_config(
        cfg: &RelayConfig,
        dispatcher: Arc<dyn RouteDispatcher>,
        sink: Arc<dyn EventSink>,
    ) -> crate::Result<Self> {
        cfg.validate()?;
        let registry = providers::build_registry(cfg)?;
        let gate = ProbabilityGate::new(cfg.probability.voice_probability)?;
        Ok(Self::new(
            Arc::new(registry),
            Arc::new(RouteTable::from_config(cfg)),
            gate,
            dispatcher,
            sink,
        ))
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn gate(&self) -> ProbabilityGate {
        self.gate
    }

    /// Flush responses accepted by the dispatcher but not yet delivered.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    /// Process one outbound bot response.
    pub async fn handle(&self, message: Message) -> Outcome {
        let message = Arc::new(message);
        let mut run = Invocation::new(Arc::clone(&message), self.sink.as_ref());

        // Routing first so an unroutable message costs no synthesis
        let destination = match self.routes.destination_for(&message.platform) {
            Ok(destination) => destination,
            Err(_) => {
                self.sink.record(&PipelineEvent::RouteMissing {
                    message_id: message.id.clone(),
                    platform: message.platform.clone(),
                });
                run.advance(PipelineState::Failed);
                return run.finish(Outcome::Dropped);
            }
        };

        run.advance(PipelineState::Gating);
        let text = match message.text() {
            Some(text) => text,
            None => {
                debug!(target: "pipeline", message_id = %message.id, "No text to synthesize");
                return self.pass_through(run, destination).await;
            }
        };
        if message.is_forced_tts() {
            debug!(target: "pipeline", message_id = %message.id, "tts_text segment; skipping gate");
        } else if !self.gate.should_synthesize() {
            return self.pass_through(run, destination).await;
        }

        run.advance(PipelineState::Resolving);
        let provider = match self.registry.select(message.provider_hint()) {
            Some(provider) => provider,
            None => {
                self.sink.record(&PipelineEvent::NoProvider {
                    message_id: message.id.clone(),
                    platform: message.platform.clone(),
                });
                return self.pass_through(run, destination).await;
            }
        };
        let preset = provider.presets().resolve(&message.platform);
        run.provider = Some(provider.name().to_string());
        run.mode = Some(provider.mode());
        debug!(target: "pipeline", message_id = %message.id, provider = %provider.name(), preset = %preset.name, "Preset resolved");

        run.advance(PipelineState::Dispatching);
        match provider.mode() {
            DeliveryMode::Streaming => {
                self.run_streaming(run, destination, &provider, &preset, text)
                    .await
            }
            DeliveryMode::Batch => {
                self.run_batch(run, destination, &provider, &preset, text)
                    .await
            }
        }
    }

    async fn pass_through(&self, mut run: Invocation<'_>, destination: &Destination) -> Outcome {
        let item = Outbound::Text(Arc::clone(&run.message));
        match self.dispatcher.dispatch(destination, item).await {
            Ok(()) => {
                run.advance(PipelineState::Completed);
                run.finish(Outcome::PassThrough)
            }
            Err(error) => {
                self.dispatch_failed(&run, error);
                run.advance(PipelineState::Failed);
                run.finish(Outcome::Failed)
            }
        }
    }

    async fn run_batch(
        &self,
        mut run: Invocation<'_>,
        destination: &Destination,
        provider: &RegisteredProvider,
        preset: &Preset,
        text: String,
    ) -> Outcome {
        run.advance(PipelineState::Batching);
        let audio = match provider.adapter().synthesize_batch(&text, preset).await {
            Ok(audio) if audio.is_empty() => {
                let error = ProviderError::Rejected("empty audio payload".into());
                return self.fall_back(run, destination, provider, error).await;
            }
            Ok(audio) => audio,
            Err(error) => return self.fall_back(run, destination, provider, error).await,
        };

        let item = Outbound::Audio {
            message: Arc::clone(&run.message),
            text,
            audio,
        };
        match self.dispatcher.dispatch(destination, item).await {
            Ok(()) => {
                run.advance(PipelineState::Completed);
                run.finish(Outcome::Synthesized)
            }
            Err(error) => {
                self.dispatch_failed(&run, error);
                run.advance(PipelineState::Failed);
                run.finish(Outcome::Failed)
            }
        }
    }

    async fn run_streaming(
        &self,
        mut run: Invocation<'_>,
        destination: &Destination,
        provider: &RegisteredProvider,
        preset: &Preset,
        text: String,
    ) -> Outcome {
        run.advance(PipelineState::Streaming);
        let mut stream = match provider.adapter().synthesize_stream(&text, preset).await {
            Ok(stream) => stream,
            Err(error) => return self.fall_back(run, destination, provider, error).await,
        };

        while let Some(item) = stream.next().await {
            let chunk: Bytes = match item {
                Ok(chunk) => chunk,
                Err(error) => {
                    drop(stream);
                    return self.fall_back(run, destination, provider, error).await;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            let item = Outbound::Chunk {
                message: Arc::clone(&run.message),
                text: text.clone(),
                seq: run.chunks,
                data: chunk,
            };
            if let Err(error) = self.dispatcher.dispatch(destination, item).await {
                // Release the provider connection and stop emitting for this message
                drop(stream);
                self.dispatch_failed(&run, error);
                run.advance(PipelineState::Failed);
                return run.finish(Outcome::Failed);
            }
            run.chunks += 1;
        }

        if run.chunks == 0 {
            let error = ProviderError::Rejected("stream produced no audio".into());
            return self.fall_back(run, destination, provider, error).await;
        }

        let end = Outbound::EndOfStream {
            message: Arc::clone(&run.message),
            text,
            status: StreamStatus::Completed,
            chunks: run.chunks,
        };
        match self.dispatcher.dispatch(destination, end).await {
            Ok(()) => {
                run.advance(PipelineState::Completed);
                run.finish(Outcome::Synthesized)
            }
            Err(error) => {
                self.dispatch_failed(&run, error);
                run.advance(PipelineState::Failed);
                run.finish(Outcome::Failed)
            }
        }
    }

    /// Provider failure: report it, close any partial stream with a failed
    /// marker, then forward the original text.
    async fn fall_back(
        &self,
        mut run: Invocation<'_>,
        destination: &Destination,
        provider: &RegisteredProvider,
        error: ProviderError,
    ) -> Outcome {
        self.sink.record(&PipelineEvent::SynthesisFailed {
            message_id: run.message.id.clone(),
            platform: run.message.platform.clone(),
            provider: provider.name().to_string(),
            error,
            chunks_sent: run.chunks,
        });
        run.advance(PipelineState::Failed);

        if run.chunks > 0 {
            let end = Outbound::EndOfStream {
                message: Arc::clone(&run.message),
                text: run.message.text().unwrap_or_default(),
                status: StreamStatus::Failed,
                chunks: run.chunks,
            };
            if let Err(error) = self.dispatcher.dispatch(destination, end).await {
                self.dispatch_failed(&run, error);
                return run.finish(Outcome::Failed);
            }
        }

        let fallback = Outbound::Text(Arc::clone(&run.message));
        if let Err(error) = self.dispatcher.dispatch(destination, fallback).await {
            self.dispatch_failed(&run, error);
        }
        run.finish(Outcome::Failed)
    }

    fn dispatch_failed(&self, run: &Invocation<'_>, error: crate::route::DispatchError) {
        self.sink.record(&PipelineEvent::DispatchFailed {
            message_id: run.message.id.clone(),
            platform: run.message.platform.clone(),
            error,
        });
    }
}
