// Relay Core Library
// Speech synthesis relay between a chat-platform adapter and a bot core

pub mod audio;
pub mod config;
pub mod gate;
pub mod message;
pub mod pipeline;
pub mod preset;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod route;
pub mod telemetry;
mod utils;

// Export core types
pub use config::{ConfigError, RelayConfig};
pub use gate::ProbabilityGate;
pub use message::{FormatInfo, Message, Segment};
pub use pipeline::{Outcome, PipelineState, SynthesisPipeline};
pub use preset::{Preset, PresetResolver};
pub use provider::{
    AudioStream, DeliveryMode, ModeSupport, ProviderAdapter, ProviderError, ProviderResult,
};
pub use registry::{ProviderNotFound, ProviderRegistry, RegisteredProvider};
pub use route::{
    ChannelDispatcher, Destination, DispatchError, Outbound, RouteDispatcher, RouteError,
    RouteTable, StreamStatus, Transport,
};
pub use telemetry::{
    init_tracing, EventSink, FanoutSink, MemorySink, PipelineEvent, PipelineStats, StatsSnapshot,
    TracingSink, UNROUTED_PLATFORM,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Registry error: {0}")]
    ProviderNotFound(#[from] ProviderNotFound),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
