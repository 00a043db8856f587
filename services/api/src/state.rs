//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the read-only
//! resources every voice session draws on: the order store and the injected
//! dialogue, transcription and synthesis clients.

use crate::{
    config::Config,
    ws::provider::{Synthesizer, Transcriber},
};
use rxconnect_core::{llm_client::DialogueConnector, store::OrderStore};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// No session mutates it.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<OrderStore>,
    pub dialogue: Arc<dyn DialogueConnector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub system_prompt: Arc<String>,
}
