//! Deepgram streaming speech-to-text and text-to-speech.

use super::{
    AudioStream, SynthesisRequest, Synthesizer, Transcriber, TranscriptionConfig,
    TranscriptionEvent, TranscriptionSession, TranscriptionStream,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{Message as WsMessage, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

type DeepgramSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// --- Listen (STT) wire types ---

#[derive(Deserialize, Debug)]
struct ListenMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    channel: Option<ListenChannel>,
    #[serde(default)]
    is_final: bool,
    description: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ListenChannel {
    alternatives: Vec<ListenAlternative>,
}

#[derive(Deserialize, Debug)]
struct ListenAlternative {
    transcript: String,
}

/// Maps one text message from the listen API to a session event.
/// Interim results, metadata and blank transcripts yield `None`.
pub(super) fn parse_listen_message(text: &str) -> Option<TranscriptionEvent> {
    let msg: ListenMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Unparseable message from Deepgram listen socket");
            return None;
        }
    };
    match msg.kind.as_deref() {
        Some("Results") if msg.is_final => {
            let transcript = msg.channel?.alternatives.into_iter().next()?.transcript;
            if transcript.trim().is_empty() {
                None
            } else {
                Some(TranscriptionEvent::FinalTranscript(transcript))
            }
        }
        Some("Error") => Some(TranscriptionEvent::Error(
            msg.description
                .or(msg.message)
                .unwrap_or_else(|| "unknown transcription error".to_string()),
        )),
        _ => None,
    }
}

/// Query parameters selecting the model and audio format of a listen session.
pub(super) fn listen_query(config: &TranscriptionConfig) -> String {
    format!(
        "model={}&encoding={}&sample_rate={}&channels={}&interim_results=false",
        config.model, config.encoding, config.sample_rate, config.channels,
    )
}

/// Builds the listen URL for a session.
fn listen_url(base_url: &str, config: &TranscriptionConfig) -> String {
    format!(
        "{}/v1/listen?{}",
        base_url.trim_end_matches('/'),
        listen_query(config)
    )
}

/// Streaming transcription over Deepgram's `/v1/listen` WebSocket.
pub struct DeepgramTranscriber {
    api_key: String,
    base_url: String,
}

impl DeepgramTranscriber {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url }
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn open(&self, config: &TranscriptionConfig) -> Result<TranscriptionSession> {
        let mut request = listen_url(&self.base_url, config).into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Token {}", self.api_key).parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to Deepgram listen socket")?;
        let (sink, stream) = ws_stream.split();
        info!(model = %config.model, "Connected to Deepgram STT.");

        let (events_tx, events) = mpsc::channel(32);
        let _ = events_tx.send(TranscriptionEvent::Opened).await;
        let reader = tokio::spawn(read_listen_socket(stream, events_tx));

        Ok(TranscriptionSession {
            stream: Box::new(DeepgramListenStream { sink, reader }),
            events,
        })
    }
}

async fn read_listen_socket(
    mut stream: SplitStream<DeepgramSocket>,
    events: mpsc::Sender<TranscriptionEvent>,
) {
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => {
                if let Some(event) = parse_listen_message(&text) {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }
            Ok(WsMessage::Close(close_frame)) => {
                debug!(?close_frame, "Deepgram listen socket closed by server.");
                if let Some(frame) = close_frame.filter(|f| f.code != CloseCode::Normal) {
                    let message = format!("{}: {}", frame.code, frame.reason.as_str());
                    let _ = events.send(TranscriptionEvent::Error(message)).await;
                }
                break;
            }
            Err(e) => {
                let _ = events.send(TranscriptionEvent::Error(e.to_string())).await;
                break;
            }
            _ => {}
        }
    }
    debug!("Deepgram listen reader finished.");
}

struct DeepgramListenStream {
    sink: SplitSink<DeepgramSocket, WsMessage>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl TranscriptionStream for DeepgramListenStream {
    async fn send_audio(&mut self, chunk: Bytes) -> Result<()> {
        self.sink.send(WsMessage::Binary(chunk)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let result = async {
            self.sink
                .send(WsMessage::Text(r#"{"type":"Finalize"}"#.to_string().into()))
                .await?;
            self.sink
                .send(WsMessage::Text(r#"{"type":"CloseStream"}"#.to_string().into()))
                .await?;
            self.sink.close().await?;
            anyhow::Ok(())
        }
        .await;
        self.reader.abort();
        result
    }
}

impl Drop for DeepgramListenStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// --- Speak (TTS) ---

/// Text-to-speech over Deepgram's `/v1/speak` REST endpoint, streamed as raw
/// PCM chunks.
pub struct DeepgramSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl DeepgramSynthesizer {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl Synthesizer for DeepgramSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioStream> {
        let url = format!("{}/v1/speak", self.base_url.trim_end_matches('/'));
        let sample_rate = request.sample_rate.to_string();
        let response = self
            .client
            .post(url)
            .query(&[
                ("model", request.voice.as_str()),
                ("encoding", request.encoding.as_str()),
                ("sample_rate", sample_rate.as_str()),
                ("container", "none"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": request.text }))
            .send()
            .await
            .context("Deepgram speak request failed")?
            .error_for_status()?;

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(anyhow::Error::from)),
        ))
    }
}
