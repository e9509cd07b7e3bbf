//! Streaming bridge: blocking fragment generator → cancellable async events.
//!
//! One blocking worker per stream takes the engine lock, ensures the engine
//! is loaded and pulls fragments for the whole generation. Each fragment's
//! text goes through an unbounded channel to the async consumer, in order.
//! The worker emits zero or more `Delta`s followed by exactly one terminal
//! `Error` or `Done`.
//!
//! The admission permit is owned by the worker and dropped when it exits,
//! after the engine lock has been released. The consumer cancels the worker
//! when it sees a terminal event or is dropped (client disconnect), and on
//! the normal path awaits the worker before finishing.
//!
//! An engine call that is stuck inside a single fragment cannot be
//! interrupted: cancellation is only observed between fragments. Such a
//! worker keeps its permit (and the lock) until the engine call returns; it
//! is never abandoned.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::gate::Permit;
use crate::inference::backend::{ChatEngine, CompletionParams};
use crate::inference::handle::{EngineConfig, SharedEngine};
use crate::server::assembler::extract_delta;

/// One item of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental reply text.
    Delta(String),
    /// Terminal failure.
    Error {
        code: String,
        message: String,
        status: u16,
        detail: Option<String>,
    },
    /// Terminal success.
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta(_))
    }
}

impl From<ChatError> for StreamEvent {
    fn from(e: ChatError) -> Self {
        StreamEvent::Error {
            code: e.code().to_string(),
            message: e.to_string(),
            status: e.status().as_u16(),
            detail: e.detail().map(str::to_string),
        }
    }
}

/// How the fragment loop ended, short of an error.
enum Pumped {
    Finished,
    Cancelled,
}

/// Start streaming a generation.
///
/// `permit` is held until the worker exits.
pub fn open_stream(
    engine: SharedEngine,
    config: EngineConfig,
    params: CompletionParams,
    permit: Permit,
    request_id: String,
) -> BoxStream<'static, StreamEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let worker = {
        let cancel = cancel.clone();
        let request_id = request_id.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_worker(&engine, &config, &params, &tx, &cancel, &request_id);
        })
    };

    let consumer = Consumer {
        rx,
        cancel,
        worker: Some(worker),
        finished: false,
        request_id,
    };

    stream::unfold(consumer, |mut c| async move {
        if c.finished {
            c.shutdown().await;
            return None;
        }
        let event = match c.rx.recv().await {
            Some(event) => event,
            // The worker died without a terminal event (panicked engine).
            None => ChatError::internal("stream worker exited without a result").into(),
        };
        if event.is_terminal() {
            c.finished = true;
        }
        Some((event, c))
    })
    .boxed()
}

/// Worker body: runs on a blocking thread, holds the engine lock throughout.
fn run_worker(
    engine: &SharedEngine,
    config: &EngineConfig,
    params: &CompletionParams,
    tx: &mpsc::UnboundedSender<StreamEvent>,
    cancel: &CancellationToken,
    request_id: &str,
) {
    let pump = |engine: &mut dyn ChatEngine| -> Result<(Pumped, usize), ChatError> {
        let mut fragments = engine.stream_chat_completion(params)?;
        let mut deltas = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok((Pumped::Cancelled, deltas));
            }
            let Some(fragment) = fragments.next() else {
                return Ok((Pumped::Finished, deltas));
            };
            if let Some(text) = extract_delta(&fragment?)? {
                if tx.send(StreamEvent::Delta(text)).is_err() {
                    return Ok((Pumped::Cancelled, deltas));
                }
                deltas += 1;
            }
        }
    };

    let terminal = match engine.with_engine(config, pump) {
        Ok((Pumped::Finished, deltas)) => {
            info!(request_id, deltas, "Stream complete");
            StreamEvent::Done
        }
        Ok((Pumped::Cancelled, deltas)) => {
            info!(request_id, deltas, "Stream cancelled by consumer");
            return;
        }
        Err(e) => {
            warn!(request_id, code = e.code(), error = %e, detail = e.detail(), "Stream failed");
            StreamEvent::from(e)
        }
    };
    let _ = tx.send(terminal);
}

/// Consumer side of one stream.
struct Consumer {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    finished: bool,
    request_id: String,
}

impl Consumer {
    /// Stop the worker and wait for it to exit (and so release its permit).
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(request_id = %self.request_id, error = %e, "Stream worker failed");
            }
        }
        debug!(request_id = %self.request_id, "Stream closed");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Client went away before the terminal event; the worker notices at
        // its next fragment and exits, releasing the permit.
        if self.worker.is_some() {
            debug!(request_id = %self.request_id, "Stream consumer dropped, cancelling worker");
        }
        self.cancel.cancel();
    }
}
