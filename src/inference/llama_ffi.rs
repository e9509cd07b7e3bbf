//! llama.cpp-style engine.
//!
//! The raw bindings are stubbed so the service can be exercised end to end
//! without the C library: tokenization splits on whitespace, and the sampler
//! replays a scripted reply that echoes the last user turn. The engine
//! surface on top ([`LlamaEngine`]) produces the same chat-completion
//! dictionaries llama.cpp does, which is all the rest of the crate sees.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::inference::backend::{
    ChatEngine, ChatMessage, CompletionParams, EngineError, EngineFactory, FragmentIter, Role,
};
use crate::inference::handle::EngineConfig;
use crate::inference::model_loader::{load_metadata, ModelMetadata};

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),
}

impl From<LlamaError> for EngineError {
    fn from(e: LlamaError) -> Self {
        match e {
            LlamaError::ModelLoadFailed(msg) => EngineError::Unavailable(msg),
            other => EngineError::Failed(other.to_string()),
        }
    }
}

/// Token ID type.
pub type TokenId = i32;

/// End-of-sequence token.
pub const TOKEN_EOS: TokenId = 2;

const FIRST_TEXT_TOKEN: TokenId = 3;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_threads: 4,
        }
    }
}

/// Stub model handle.
///
/// In a real implementation, this would wrap `*mut llama_model`.
pub struct LlamaModel {
    pub metadata: ModelMetadata,
    vocab: Vec<String>,
    ids: HashMap<String, TokenId>,
}

/// Stub context handle.
///
/// In a real implementation, this would wrap `*mut llama_context`.
pub struct LlamaContext {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    pub pos: usize,
    script: VecDeque<TokenId>,
}

impl LlamaModel {
    /// Load a model from a GGUF file (stub).
    pub fn load(path: &std::path::Path, params: ModelParams) -> Result<Self, LlamaError> {
        let metadata =
            load_metadata(path).map_err(|e| LlamaError::ModelLoadFailed(e.to_string()))?;
        debug!(
            path = %path.display(),
            architecture = %metadata.architecture,
            quantization = %metadata.quantization,
            use_mmap = params.use_mmap,
            use_mlock = params.use_mlock,
            "Model loaded"
        );
        Ok(Self {
            metadata,
            vocab: Vec::new(),
            ids: HashMap::new(),
        })
    }

    /// Create a new context for this model (stub).
    pub fn new_context(&self, params: ContextParams) -> Result<LlamaContext, LlamaError> {
        if params.n_ctx == 0 {
            return Err(LlamaError::ContextFailed("n_ctx must be positive".into()));
        }
        if params.n_batch == 0 || params.n_threads == 0 {
            return Err(LlamaError::ContextFailed(
                "n_batch and n_threads must be positive".into(),
            ));
        }
        debug!(
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            "Context created"
        );
        Ok(LlamaContext {
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            n_threads: params.n_threads,
            pos: 0,
            script: VecDeque::new(),
        })
    }

    /// Tokenize a string into token IDs (stub: one token per word, trailing
    /// whitespace included).
    pub fn tokenize(&mut self, text: &str) -> Vec<TokenId> {
        text.split_inclusive(char::is_whitespace)
            .map(|piece| match self.ids.get(piece) {
                Some(id) => *id,
                None => {
                    let id = FIRST_TEXT_TOKEN + self.vocab.len() as TokenId;
                    self.vocab.push(piece.to_string());
                    self.ids.insert(piece.to_string(), id);
                    id
                }
            })
            .collect()
    }

    /// Forget every interned piece. Token ids are only meaningful within
    /// one generation.
    pub fn reset_vocab(&mut self) {
        self.vocab.clear();
        self.ids.clear();
    }

    pub fn vocab_len(&self) -> usize {
        self.vocab.len()
    }

    /// Text for a single token; control tokens render as nothing.
    pub fn token_to_piece(&self, token: TokenId) -> String {
        usize::try_from(token - FIRST_TEXT_TOKEN)
            .ok()
            .and_then(|idx| self.vocab.get(idx))
            .cloned()
            .unwrap_or_default()
    }
}

impl LlamaContext {
    /// Process tokens in batches of at most `n_batch` (stub). Returns the
    /// number of batches submitted.
    pub fn decode(&mut self, tokens: &[TokenId]) -> Result<usize, LlamaError> {
        if self.pos + tokens.len() > self.n_ctx as usize {
            return Err(LlamaError::DecodeFailed(format!(
                "context window of {} tokens exhausted",
                self.n_ctx
            )));
        }
        let mut batches = 0;
        for batch in tokens.chunks(self.n_batch as usize) {
            self.pos += batch.len();
            batches += 1;
        }
        Ok(batches)
    }

    /// Queue the tokens the stub sampler will return.
    pub fn script_reply(&mut self, tokens: Vec<TokenId>) {
        self.script = tokens.into();
    }

    /// Sample the next token (stub: replays the scripted reply, then EOS).
    pub fn sample(&mut self, _temperature: f32) -> TokenId {
        self.script.pop_front().unwrap_or(TOKEN_EOS)
    }

    /// Clear the KV cache.
    pub fn kv_cache_clear(&mut self) {
        self.pos = 0;
        self.script.clear();
    }
}

/// Prompt template applied to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatFormat {
    #[default]
    Chatml,
    Llama2,
}

impl ChatFormat {
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        match self {
            ChatFormat::Chatml => {
                for m in messages {
                    prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role.as_str(), m.content));
                }
                prompt.push_str("<|im_start|>assistant\n");
            }
            ChatFormat::Llama2 => {
                for m in messages {
                    match m.role {
                        Role::System => prompt.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", m.content)),
                        Role::User => prompt.push_str(&format!("[INST] {} [/INST]", m.content)),
                        Role::Assistant => prompt.push_str(&format!(" {} ", m.content)),
                    }
                }
            }
        }
        prompt
    }
}

/// Builds [`LlamaEngine`]s.
#[derive(Debug, Clone, Default)]
pub struct LlamaFactory {
    pub chat_format: ChatFormat,
}

impl LlamaFactory {
    pub fn new(chat_format: ChatFormat) -> Self {
        Self { chat_format }
    }
}

impl EngineFactory for LlamaFactory {
    fn build(&self, config: &EngineConfig) -> Result<Box<dyn ChatEngine>, EngineError> {
        let model = LlamaModel::load(&config.path, ModelParams::default())?;
        let ctx = model.new_context(ContextParams {
            n_ctx: u32::try_from(config.context_size).unwrap_or(u32::MAX),
            n_threads: u32::try_from(config.n_threads).unwrap_or(u32::MAX),
            ..Default::default()
        })?;
        Ok(Box::new(LlamaEngine {
            model_name: config.path.display().to_string(),
            model,
            ctx,
            chat_format: self.chat_format,
        }))
    }
}

/// Engine over the llama bindings.
pub struct LlamaEngine {
    model_name: String,
    model: LlamaModel,
    ctx: LlamaContext,
    chat_format: ChatFormat,
}

impl LlamaEngine {
    /// Validate arguments, run the prompt through the context and prime the
    /// sampler. Returns the prompt length in tokens.
    fn prefill(&mut self, params: &CompletionParams) -> Result<usize, EngineError> {
        if !params.temperature.is_finite() || params.temperature < 0.0 {
            return Err(EngineError::InvalidRequest(format!(
                "temperature must be a non-negative number, got {}",
                params.temperature
            )));
        }
        if params.max_tokens == 0 {
            return Err(EngineError::InvalidRequest("max_tokens must be positive".into()));
        }

        self.model.reset_vocab();
        let prompt = self.chat_format.render(&params.messages);
        let prompt_tokens = self.model.tokenize(&prompt);
        let requested = prompt_tokens.len() + params.max_tokens as usize;
        if requested > self.ctx.n_ctx as usize {
            return Err(EngineError::InvalidRequest(format!(
                "Requested tokens ({requested}) exceed context window of {}",
                self.ctx.n_ctx
            )));
        }

        self.ctx.kv_cache_clear();
        let batches = self.ctx.decode(&prompt_tokens)?;

        let reply = echo_reply(&params.messages);
        let reply_tokens = self.model.tokenize(&reply);
        self.ctx.script_reply(reply_tokens);

        debug!(
            prompt_tokens = prompt_tokens.len(),
            batches,
            n_threads = self.ctx.n_threads,
            max_tokens = params.max_tokens,
            "Prefill complete"
        );
        Ok(prompt_tokens.len())
    }

    /// Sample and decode one token. `None` once EOS is reached.
    fn next_piece(&mut self, temperature: f32) -> Result<Option<String>, EngineError> {
        let token = self.ctx.sample(temperature);
        if token == TOKEN_EOS {
            return Ok(None);
        }
        self.ctx.decode(&[token])?;
        Ok(Some(self.model.token_to_piece(token)))
    }
}

/// Placeholder reply the stub sampler produces.
fn echo_reply(messages: &[ChatMessage]) -> String {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .unwrap_or("");
    if last_user.is_empty() {
        return "I'm online and ready to chat once you send a message.".to_string();
    }
    if messages.len() > 1 {
        format!("Echoing your last prompt (history has {} entries): {last_user}", messages.len())
    } else {
        format!("Echoing your last prompt: {last_user}")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

impl ChatEngine for LlamaEngine {
    fn create_chat_completion(&mut self, params: &CompletionParams) -> Result<Value, EngineError> {
        let prompt_tokens = self.prefill(params)?;

        let mut text = String::new();
        let mut completion_tokens = 0;
        let mut finish_reason = "stop";
        while let Some(piece) = self.next_piece(params.temperature)? {
            text.push_str(&piece);
            completion_tokens += 1;
            if completion_tokens >= params.max_tokens as usize {
                finish_reason = "length";
                break;
            }
        }

        Ok(json!({
            "id": completion_id(),
            "object": "chat.completion",
            "created": unix_now(),
            "model": self.model_name,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": finish_reason,
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens,
            },
        }))
    }

    fn stream_chat_completion<'a>(
        &'a mut self,
        params: &CompletionParams,
    ) -> Result<FragmentIter<'a>, EngineError> {
        self.prefill(params)?;
        Ok(Box::new(LlamaStream {
            id: completion_id(),
            created: unix_now(),
            temperature: params.temperature,
            max_tokens: params.max_tokens as usize,
            generated: 0,
            state: StreamState::Start,
            engine: self,
        }))
    }
}

enum StreamState {
    Start,
    Tokens,
    Finish(&'static str),
    Done,
}

/// Chunk iterator for a streaming completion.
struct LlamaStream<'a> {
    engine: &'a mut LlamaEngine,
    id: String,
    created: u64,
    temperature: f32,
    max_tokens: usize,
    generated: usize,
    state: StreamState,
}

impl LlamaStream<'_> {
    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.engine.model_name,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }
}

impl Iterator for LlamaStream<'_> {
    type Item = Result<Value, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            StreamState::Start => {
                self.state = StreamState::Tokens;
                Some(Ok(self.chunk(json!({"role": "assistant"}), None)))
            }
            StreamState::Tokens => {
                if self.generated >= self.max_tokens {
                    self.state = StreamState::Done;
                    return Some(Ok(self.chunk(json!({}), Some("length"))));
                }
                match self.engine.next_piece(self.temperature) {
                    Ok(Some(piece)) => {
                        self.generated += 1;
                        Some(Ok(self.chunk(json!({"content": piece}), None)))
                    }
                    Ok(None) => {
                        self.state = StreamState::Finish("stop");
                        self.next()
                    }
                    Err(e) => {
                        self.state = StreamState::Done;
                        Some(Err(e))
                    }
                }
            }
            StreamState::Finish(reason) => {
                self.state = StreamState::Done;
                Some(Ok(self.chunk(json!({}), Some(reason))))
            }
            StreamState::Done => None,
        }
    }
}
