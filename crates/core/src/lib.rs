//! Domain core of the pharmacy voice assistant: identifier normalization, the
//! read-only order store, the closed tool set the dialogue engine may call,
//! conversation history, and the dialogue engine client.

pub mod conversation;
pub mod identifier;
pub mod llm_client;
pub mod store;
pub mod tools;
