//! Local LLM inference.
//!
//! - [`backend`]: Engine capability and chat types
//! - [`handle`]: Lazily loaded, serialized engine instance
//! - [`llama_ffi`]: llama.cpp-style engine
//! - [`model_loader`]: GGUF file inspection

pub mod backend;
pub mod handle;
pub mod llama_ffi;
pub mod model_loader;
