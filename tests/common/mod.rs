//! Shared fixtures: a scripted engine and a router wired around it.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use llm_chat_gate::config::ServerConfig;
use llm_chat_gate::gate::AdmissionGate;
use llm_chat_gate::inference::backend::{
    ChatEngine, CompletionParams, EngineError, EngineFactory, FragmentIter,
};
use llm_chat_gate::inference::handle::{EngineConfig, SharedEngine};
use llm_chat_gate::server::api::{build_router, AppState};

/// Call counters shared by every engine a factory builds.
#[derive(Default)]
pub struct Stats {
    pub builds: AtomicUsize,
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Stats {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

struct ActiveGuard(Arc<Stats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// What a scripted engine does when called.
#[derive(Clone)]
pub enum Script {
    /// Return this raw completion; stream it as these chunks.
    Reply { completion: Value, chunks: Vec<String> },
    /// Refuse the arguments.
    Invalid(String),
    /// Fail internally.
    Fail(String),
    /// Panic inside the engine call.
    Panic,
}

#[derive(Clone)]
pub struct ScriptedFactory {
    pub script: Script,
    pub delay: Duration,
    pub stats: Arc<Stats>,
}

impl ScriptedFactory {
    pub fn reply(text: &str) -> Self {
        Self::new(Script::Reply {
            completion: json!({"choices": [{"message": {"role": "assistant", "content": text}}]}),
            chunks: vec![text.to_string()],
        })
    }

    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct ScriptedEngine {
    script: Script,
    delay: Duration,
    stats: Arc<Stats>,
}

impl ScriptedEngine {
    fn check(&self) -> Result<(), EngineError> {
        match &self.script {
            Script::Invalid(msg) => Err(EngineError::InvalidRequest(msg.clone())),
            Script::Fail(msg) => Err(EngineError::Failed(msg.clone())),
            Script::Panic => panic!("engine exploded"),
            Script::Reply { .. } => Ok(()),
        }
    }
}

impl ChatEngine for ScriptedEngine {
    fn create_chat_completion(&mut self, _: &CompletionParams) -> Result<Value, EngineError> {
        self.stats.enter();
        std::thread::sleep(self.delay);
        self.stats.exit();
        self.check()?;
        match &self.script {
            Script::Reply { completion, .. } => Ok(completion.clone()),
            _ => unreachable!(),
        }
    }

    fn stream_chat_completion<'a>(
        &'a mut self,
        _: &CompletionParams,
    ) -> Result<FragmentIter<'a>, EngineError> {
        // Counted as active until the iterator is dropped.
        self.stats.enter();
        let active = ActiveGuard(self.stats.clone());
        self.check()?;
        let chunks = match &self.script {
            Script::Reply { chunks, .. } => chunks.clone(),
            _ => unreachable!(),
        };
        let delay = self.delay;
        let opener = json!({"choices": [{"delta": {"role": "assistant"}}]});
        let closer = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        let fragments = std::iter::once(opener)
            .chain(
                chunks
                    .into_iter()
                    .map(|c| json!({"choices": [{"delta": {"content": c}}]})),
            )
            .chain(std::iter::once(closer));
        Ok(Box::new(fragments.map(move |f| {
            let _active = &active;
            std::thread::sleep(delay);
            Ok(f)
        })))
    }
}

impl EngineFactory for ScriptedFactory {
    fn build(&self, _: &EngineConfig) -> Result<Box<dyn ChatEngine>, EngineError> {
        self.stats.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
            delay: self.delay,
            stats: self.stats.clone(),
        }))
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub weights: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(factory: Arc<dyn EngineFactory>, capacity: usize, queue_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("model.gguf");
        std::fs::write(&weights, "pretend weights").unwrap();
        Self::with_weights(factory, capacity, queue_timeout, dir, weights)
    }

    /// Point the engine at a path that does not exist.
    pub fn without_weights(factory: Arc<dyn EngineFactory>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("missing.gguf");
        Self::with_weights(factory, 1, Duration::from_millis(100), dir, weights)
    }

    fn with_weights(
        factory: Arc<dyn EngineFactory>,
        capacity: usize,
        queue_timeout: Duration,
        dir: tempfile::TempDir,
        weights: PathBuf,
    ) -> Self {
        let engine = SharedEngine::new(factory);
        let gate = AdmissionGate::new(capacity, queue_timeout);
        let state =
            Arc::new(AppState::new(engine, EngineConfig::new(&weights, 1), gate).unwrap());
        let router = build_router(state.clone(), &ServerConfig::default());
        Self {
            router,
            state,
            weights,
            _dir: dir,
        }
    }

    pub async fn post(&self, uri: &str, body: Value) -> Response<Body> {
        self.post_raw(uri, body.to_string()).await
    }

    pub async fn post_raw(&self, uri: &str, body: String) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub fn hello() -> Value {
    json!({"messages": [{"role": "user", "content": "Hello"}]})
}

pub async fn body_text(resp: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    serde_json::from_str(&body_text(resp).await).unwrap()
}

/// One parsed SSE frame: event name (if any) and decoded data.
#[derive(Debug, PartialEq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: Value,
}

pub fn parse_sse(text: &str) -> Vec<Frame> {
    text.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut event = None;
            let mut data = String::new();
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload.trim_start());
                }
            }
            Frame {
                event,
                data: serde_json::from_str(&data).unwrap(),
            }
        })
        .collect()
}
