//! llm-chat-gate: admission-controlled chat service over a local LLM.
//!
//! One engine instance serves every request. An admission gate bounds how
//! many requests may be in flight, a lock serializes engine calls, and a
//! bridge turns the engine's blocking token iterator into an SSE stream.

pub mod config;
pub mod error;
pub mod gate;
pub mod inference;
pub mod metrics;
pub mod server;
