//! RxConnect API Library Crate
//!
//! This library contains the web service side of the pharmacy voice
//! assistant: configuration, shared state, routing, the WebSocket voice
//! session and its speech providers. The `api` binary is a thin wrapper
//! around this library.

pub mod audio_utils;
pub mod config;
pub mod router;
pub mod state;
pub mod ws;
