pub mod error;
pub mod types;
pub mod config;
pub mod provider;
pub mod registry;
pub mod ratelimit;
pub mod breaker;
pub mod router;
pub mod orchestrator;
pub mod util;

pub use error::{AiError, Result};
pub use orchestrator::Orchestrator;
pub use types::{ChatMessage, ChatRequest, ChatResponse, ProviderId, Role, StreamChunk};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
