//! The opaque engine capability.
//!
//! The rest of the service only ever talks to an engine through
//! [`ChatEngine`]: hand it a conversation plus generation parameters and get
//! back either one complete result or a lazy sequence of fragments. Results
//! are raw JSON in the llama.cpp chat-completion shape; interpreting them is
//! the job of [`crate::server::assembler`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::inference::handle::EngineConfig;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine refused the resolved arguments.
    #[error("{0}")]
    InvalidRequest(String),

    /// No engine could be built for the requested configuration.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Anything else that went wrong inside the engine.
    #[error("Engine failure: {0}")]
    Failed(String),
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Arguments for a single generation call.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Lazy fragment sequence produced by a streaming call.
///
/// Borrows the engine, so it can only be drained while the caller still
/// holds the engine lock.
pub type FragmentIter<'a> = Box<dyn Iterator<Item = Result<Value, EngineError>> + Send + 'a>;

/// A stateful, non-thread-safe inference engine.
pub trait ChatEngine: Send {
    /// Run generation to completion and return the raw result.
    fn create_chat_completion(&mut self, params: &CompletionParams) -> Result<Value, EngineError>;

    /// Start an incremental generation.
    fn stream_chat_completion<'a>(
        &'a mut self,
        params: &CompletionParams,
    ) -> Result<FragmentIter<'a>, EngineError>;
}

/// Builds engine instances for the handle.
pub trait EngineFactory: Send + Sync {
    fn build(&self, config: &EngineConfig) -> Result<Box<dyn ChatEngine>, EngineError>;
}
