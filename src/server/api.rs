//! HTTP API.
//!
//! - POST /chat
//! - POST /chat/stream
//! - GET /healthz
//! - GET /metrics

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{panic_response, ChatError};
use crate::gate::AdmissionGate;
use crate::inference::backend::{ChatMessage, CompletionParams};
use crate::inference::handle::{EngineConfig, SharedEngine};
use crate::metrics::Metrics;
use crate::server::assembler::{extract_reply, sse_event};
use crate::server::bridge::{open_stream, StreamEvent};

pub const MAX_TOKENS_RANGE: (i64, i64) = (32, 1024);
pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
pub const DEFAULT_MAX_TOKENS: i64 = 512;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: SharedEngine,
    pub engine_config: EngineConfig,
    pub gate: AdmissionGate,
    pub metrics: Metrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        engine: SharedEngine,
        engine_config: EngineConfig,
        gate: AdmissionGate,
    ) -> prometheus::Result<Self> {
        let metrics = Metrics::new(&gate, &engine)?;
        Ok(Self {
            engine,
            engine_config,
            gate,
            metrics,
            start_time: Instant::now(),
        })
    }

    /// Admit, run one complete generation on a blocking thread, and extract
    /// the reply. The permit is released when the blocking call returns,
    /// even if this future is dropped first.
    pub async fn complete(&self, params: CompletionParams) -> Result<String, ChatError> {
        let permit = self.gate.acquire().await?;
        let engine = self.engine.clone();
        let config = self.engine_config.clone();

        let completion = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.with_engine(&config, |engine| engine.create_chat_completion(&params))
        })
        .await??;

        extract_reply(&completion)
    }

    /// Admit and start a streaming generation. Rejection happens here,
    /// before any frame is produced.
    pub async fn stream(
        &self,
        params: CompletionParams,
        request_id: String,
    ) -> Result<BoxStream<'static, StreamEvent>, ChatError> {
        let permit = self.gate.acquire().await?;
        Ok(open_stream(
            self.engine.clone(),
            self.engine_config.clone(),
            params,
            permit,
            request_id,
        ))
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));

    let router = match &server.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(not_found),
    };

    router
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors_layer(&server.allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Chat request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

fn issue(loc: Value, msg: String, kind: &str) -> Value {
    json!({"loc": loc, "msg": msg, "type": kind})
}

impl ChatRequest {
    /// Check shape and range constraints, collecting every violation.
    pub fn validate(&self) -> Vec<Value> {
        let mut issues = Vec::new();

        if self.messages.is_empty() {
            issues.push(issue(
                json!(["body", "messages"]),
                "List should have at least 1 item after validation, not 0".into(),
                "too_short",
            ));
        }
        for (i, message) in self.messages.iter().enumerate() {
            if message.content.trim().is_empty() {
                issues.push(issue(
                    json!(["body", "messages", i, "content"]),
                    "Value error, Message content must be a non-empty string.".into(),
                    "value_error",
                ));
            }
        }

        if let Some(max_tokens) = self.max_tokens {
            let (lo, hi) = MAX_TOKENS_RANGE;
            if max_tokens < lo {
                issues.push(issue(
                    json!(["body", "max_tokens"]),
                    format!("Input should be greater than or equal to {lo}"),
                    "greater_than_equal",
                ));
            } else if max_tokens > hi {
                issues.push(issue(
                    json!(["body", "max_tokens"]),
                    format!("Input should be less than or equal to {hi}"),
                    "less_than_equal",
                ));
            }
        }

        if let Some(temperature) = self.temperature {
            let (lo, hi) = TEMPERATURE_RANGE;
            if temperature < lo {
                issues.push(issue(
                    json!(["body", "temperature"]),
                    format!("Input should be greater than or equal to {lo}"),
                    "greater_than_equal",
                ));
            } else if temperature > hi {
                issues.push(issue(
                    json!(["body", "temperature"]),
                    format!("Input should be less than or equal to {hi}"),
                    "less_than_equal",
                ));
            }
        }

        issues
    }

    /// Validate and resolve defaults.
    pub fn into_params(self) -> Result<CompletionParams, ChatError> {
        let details = self.validate();
        if !details.is_empty() {
            return Err(ChatError::Validation { details });
        }
        Ok(CompletionParams {
            messages: self.messages,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS) as u32,
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE) as f32,
        })
    }
}

/// JSON body extractor whose rejections are `validation_error`s.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let kind = match &rejection {
                    JsonRejection::JsonDataError(_) => "value_error",
                    JsonRejection::JsonSyntaxError(_) => "json_invalid",
                    JsonRejection::MissingJsonContentType(_) => "missing_content_type",
                    _ => "body_error",
                };
                Err(ChatError::Validation {
                    details: vec![issue(json!(["body"]), rejection.body_text(), kind)],
                })
            }
        }
    }
}

fn outcome<T>(result: &Result<T, ChatError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<ChatRequest>,
) -> Result<Json<ChatResponse>, ChatError> {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id = %request_id, messages = req.messages.len(), "Chat request");

    let result = match req.into_params() {
        Ok(params) => state.complete(params).await,
        Err(e) => Err(e),
    };
    state.metrics.observe("chat", outcome(&result));

    let reply = result?;
    info!(request_id = %request_id, reply_chars = reply.chars().count(), "Chat reply ready");
    Ok(Json(ChatResponse { reply }))
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<ChatRequest>,
) -> Result<Response, ChatError> {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id = %request_id, messages = req.messages.len(), "Chat stream request");

    let result = match req.into_params() {
        Ok(params) => state.stream(params, request_id).await,
        Err(e) => Err(e),
    };
    let events = match result {
        Ok(events) => events,
        Err(e) => {
            state.metrics.observe("chat_stream", e.code());
            return Err(e);
        }
    };

    let mut outcome = StreamOutcome {
        metrics: state.metrics.clone(),
        recorded: false,
    };
    let frames = events.map(move |event| {
        match &event {
            StreamEvent::Done => outcome.record("ok"),
            StreamEvent::Error { code, .. } => outcome.record(code),
            StreamEvent::Delta(_) => {}
        }
        Ok::<_, Infallible>(sse_event(&event))
    });

    let mut response = Sse::new(frames).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// Counts a stream exactly once: by its terminal event, or as `cancelled`
/// if the body is dropped before one was sent.
struct StreamOutcome {
    metrics: Metrics,
    recorded: bool,
}

impl StreamOutcome {
    fn record(&mut self, outcome: &str) {
        if !self.recorded {
            self.recorded = true;
            self.metrics.observe("chat_stream", outcome);
        }
    }
}

impl Drop for StreamOutcome {
    fn drop(&mut self) {
        self.record("cancelled");
    }
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn not_found() -> ChatError {
    ChatError::Http {
        status: StatusCode::NOT_FOUND,
        message: "Not Found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::Role;

    fn request(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let params = request(json!({"messages": [{"role": "user", "content": "Hello"}]}))
            .into_params()
            .unwrap();
        assert_eq!(params.max_tokens, 512);
        assert!((params.temperature - 0.7).abs() < 1e-6);
        assert_eq!(params.messages[0].role, Role::User);
    }

    #[test]
    fn test_null_fields_use_defaults() {
        let params = request(json!({
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": null,
            "temperature": null,
        }))
        .into_params()
        .unwrap();
        assert_eq!(params.max_tokens, 512);
    }

    #[test]
    fn test_empty_messages_rejected() {
        let issues = request(json!({"messages": []})).validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0]["type"], "too_short");
    }

    #[test]
    fn test_blank_content_rejected() {
        let issues = request(json!({"messages": [
            {"role": "system", "content": "be nice"},
            {"role": "user", "content": "   \n"},
        ]}))
        .validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0]["loc"], json!(["body", "messages", 1, "content"]));
    }

    #[test]
    fn test_ranges() {
        let base = |extra: Value| {
            let mut body = json!({"messages": [{"role": "user", "content": "x"}]});
            for (k, v) in extra.as_object().unwrap() {
                body[k] = v.clone();
            }
            request(body).validate()
        };
        assert!(base(json!({"max_tokens": 32, "temperature": 0.0})).is_empty());
        assert!(base(json!({"max_tokens": 1024, "temperature": 2.0})).is_empty());
        assert_eq!(base(json!({"max_tokens": 31}))[0]["type"], "greater_than_equal");
        assert_eq!(base(json!({"max_tokens": 1025}))[0]["type"], "less_than_equal");
        assert_eq!(base(json!({"temperature": -0.1}))[0]["type"], "greater_than_equal");
        assert_eq!(base(json!({"temperature": 2.5}))[0]["type"], "less_than_equal");
        assert_eq!(base(json!({"max_tokens": 0, "temperature": 9.0})).len(), 2);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome::<()>(&Ok(())), "ok");
        assert_eq!(outcome::<()>(&Err(ChatError::ServerBusy)), "server_busy");
    }
}
