//! HTTP front end for the chat service.
//!
//! - [`api`]: Request types, validation and route handlers
//! - [`bridge`]: Blocking engine iterator to async event stream
//! - [`assembler`]: Engine output to reply text and SSE frames

pub mod api;
pub mod assembler;
pub mod bridge;
