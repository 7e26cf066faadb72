pub mod client;
pub mod orchestrator;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testing;

pub use client::{
    GeminiClient, GenerateResponse, GenerationClient, GenerationConfig, UsageMetadata,
    DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL,
};
pub use orchestrator::{
    CityDataBundle, CityDataRequest, GenerationError, GenerationOrchestrator, MessageReply,
    OrchestratorConfig, OrchestratorError, PersonalizedItinerary, ReplyOutcome, WorkerFailure,
    WorkerKind, WorkerOutput, WorkerResult,
};
pub use session::{SessionReply, SESSION_TTL_HOURS};
pub use stream::{deliver_with_timeout, DeliveryError, DEFAULT_SEND_TIMEOUT};
