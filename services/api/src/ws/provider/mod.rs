//! Speech providers: streaming transcription of the caller's audio and
//! synthesis of the assistant's replies.
//!
//! The session only sees the [`Transcriber`] and [`Synthesizer`] traits; the
//! Deepgram implementations live in [`deepgram`] and the SageMaker-hosted
//! transcriber in [`sagemaker`].

pub mod deepgram;
pub mod sagemaker;

use super::protocol::{PCM_ENCODING, PCM_SAMPLE_RATE};
use crate::config::{Config, SttMode};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;

/// Parameters of a streaming transcription session.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionConfig {
    pub model: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl TranscriptionConfig {
    /// Mono 16 kHz linear PCM, matching the audio the client streams.
    pub fn pcm16(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            encoding: PCM_ENCODING.to_string(),
            sample_rate: PCM_SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// Events produced by an open transcription session.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    Opened,
    /// A completed (non-interim) transcript.
    FinalTranscript(String),
    Error(String),
}

/// The caller-facing half of an open transcription session.
#[async_trait]
pub trait TranscriptionStream: Send {
    async fn send_audio(&mut self, chunk: Bytes) -> Result<()>;

    /// Flushes pending audio and terminates the session.
    async fn close(&mut self) -> Result<()>;
}

/// An open transcription session: the audio sink plus its event feed.
pub struct TranscriptionSession {
    pub stream: Box<dyn TranscriptionStream>,
    pub events: mpsc::Receiver<TranscriptionEvent>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn open(&self, config: &TranscriptionConfig) -> Result<TranscriptionSession>;
}

/// Builds the transcriber selected by `config.stt_mode`.
pub async fn transcriber_for(config: &Config) -> Result<Arc<dyn Transcriber>> {
    info!(mode = %config.stt_mode, "Selecting speech-to-text backend.");
    match config.stt_mode {
        SttMode::Cloud => Ok(Arc::new(deepgram::DeepgramTranscriber::new(
            config.deepgram_api_key.clone(),
            config.deepgram_stt_url.clone(),
        ))),
        SttMode::SageMaker => sagemaker_transcriber(config).await,
    }
}

#[cfg(feature = "sagemaker")]
async fn sagemaker_transcriber(config: &Config) -> Result<Arc<dyn Transcriber>> {
    info!(
        endpoint = %config.sagemaker_endpoint_name,
        region = %config.aws_region,
        "Using SageMaker-hosted transcription."
    );
    Ok(Arc::new(
        sagemaker::SageMakerTranscriber::new(
            config.sagemaker_endpoint_name.clone(),
            config.aws_region.clone(),
        )
        .await,
    ))
}

#[cfg(not(feature = "sagemaker"))]
async fn sagemaker_transcriber(_config: &Config) -> Result<Arc<dyn Transcriber>> {
    anyhow::bail!("USE_SAGEMAKER_STT is set but this build lacks the `sagemaker` feature")
}

/// Parameters of one synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub encoding: String,
    pub sample_rate: u32,
}

impl SynthesisRequest {
    pub fn pcm16(text: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: voice.into(),
            encoding: PCM_ENCODING.to_string(),
            sample_rate: PCM_SAMPLE_RATE,
        }
    }
}

/// A finite, single-use stream of synthesized audio chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioStream>;
}
