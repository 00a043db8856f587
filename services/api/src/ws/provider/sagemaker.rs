//! Streaming transcription through a Deepgram model hosted on a SageMaker
//! endpoint.
//!
//! The endpoint speaks the same listen protocol as Deepgram's hosted API,
//! carried over a bidirectional event stream: audio goes up as binary payload
//! parts, control messages as UTF-8 parts, and every listen message comes back
//! as one or more response payload parts. The AWS client itself is built only
//! with the `sagemaker` feature.

/// Path of the listen route inside the hosted model container.
pub const INVOCATION_PATH: &str = "v1/listen";

pub const DATA_TYPE_BINARY: &str = "BINARY";
pub const DATA_TYPE_UTF8: &str = "UTF8";

/// Marks a response payload part that is continued by the next one.
const COMPLETION_PARTIAL: &str = "PARTIAL";

pub const FINALIZE_MESSAGE: &str = r#"{"type":"Finalize"}"#;
pub const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// Reassembles response payload parts into whole listen messages.
#[derive(Debug, Default)]
pub struct PayloadAssembler {
    buffer: Vec<u8>,
}

impl PayloadAssembler {
    /// Buffers one payload part. Returns the complete message once a part
    /// arrives that is not marked partial.
    pub fn push(&mut self, bytes: &[u8], completion_state: Option<&str>) -> Option<String> {
        self.buffer.extend_from_slice(bytes);
        if completion_state == Some(COMPLETION_PARTIAL) {
            return None;
        }
        let message = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        (!message.trim().is_empty()).then_some(message)
    }
}

#[cfg(feature = "sagemaker")]
mod client {
    use super::{
        super::{
            Transcriber, TranscriptionConfig, TranscriptionEvent, TranscriptionSession,
            TranscriptionStream,
            deepgram::{listen_query, parse_listen_message},
        },
        CLOSE_STREAM_MESSAGE, DATA_TYPE_BINARY, DATA_TYPE_UTF8, FINALIZE_MESSAGE,
        INVOCATION_PATH, PayloadAssembler,
    };
    use anyhow::{Context, Result, anyhow};
    use async_trait::async_trait;
    use aws_config::{BehaviorVersion, Region};
    use aws_sdk_sagemakerruntime::{
        Client,
        error::DisplayErrorContext,
        operation::invoke_endpoint_with_bidirectional_stream as bidirectional,
        primitives::{Blob, event_stream::EventStreamSender},
        types::{
            RequestPayloadPart, RequestStreamEvent, ResponseStreamEvent,
            error::RequestStreamEventError,
        },
    };
    use bytes::Bytes;
    use tokio::{sync::mpsc, task::JoinHandle};
    use tracing::{debug, info};

    /// Streaming transcription over a SageMaker bidirectional stream.
    pub struct SageMakerTranscriber {
        client: Client,
        endpoint_name: String,
    }

    impl SageMakerTranscriber {
        /// Builds the runtime client from the default AWS credential chain.
        pub async fn new(endpoint_name: String, region: String) -> Self {
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region))
                .load()
                .await;
            Self {
                client: Client::new(&sdk_config),
                endpoint_name,
            }
        }
    }

    fn payload_part(bytes: Vec<u8>, data_type: &str) -> RequestStreamEvent {
        RequestStreamEvent::PayloadPart(
            RequestPayloadPart::builder()
                .bytes(Blob::new(bytes))
                .data_type(data_type)
                .build(),
        )
    }

    #[async_trait]
    impl Transcriber for SageMakerTranscriber {
        async fn open(&self, config: &TranscriptionConfig) -> Result<TranscriptionSession> {
            let (parts_tx, parts_rx) = mpsc::channel::<RequestStreamEvent>(64);
            let body = futures::stream::unfold(parts_rx, |mut rx| async move {
                let part = rx.recv().await?;
                Some((Ok::<_, RequestStreamEventError>(part), rx))
            });

            let output = self
                .client
                .invoke_endpoint_with_bidirectional_stream()
                .endpoint_name(&self.endpoint_name)
                .model_invocation_path(INVOCATION_PATH)
                .model_query_string(listen_query(config))
                .body(EventStreamSender::from(body))
                .send()
                .await
                .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))
                .context("Failed to open SageMaker transcription stream")?;
            info!(
                endpoint = %self.endpoint_name,
                model = %config.model,
                "Connected to SageMaker STT."
            );

            let (events_tx, events) = mpsc::channel(32);
            let _ = events_tx.send(TranscriptionEvent::Opened).await;
            let reader = tokio::spawn(read_response_stream(output, events_tx));

            Ok(TranscriptionSession {
                stream: Box::new(SageMakerListenStream {
                    parts: Some(parts_tx),
                    reader,
                }),
                events,
            })
        }
    }

    async fn read_response_stream(
        mut output: bidirectional::InvokeEndpointWithBidirectionalStreamOutput,
        events: mpsc::Sender<TranscriptionEvent>,
    ) {
        let mut assembler = PayloadAssembler::default();
        loop {
            match output.body.recv().await {
                Ok(Some(ResponseStreamEvent::PayloadPart(part))) => {
                    let Some(bytes) = part.bytes() else {
                        continue;
                    };
                    let Some(text) = assembler.push(bytes.as_ref(), part.completion_state())
                    else {
                        continue;
                    };
                    if let Some(event) = parse_listen_message(&text) {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Some(other)) => debug!(?other, "Ignoring SageMaker stream event."),
                Ok(None) => break,
                Err(e) => {
                    let message = DisplayErrorContext(&e).to_string();
                    let _ = events.send(TranscriptionEvent::Error(message)).await;
                    break;
                }
            }
        }
        debug!("SageMaker response reader finished.");
    }

    struct SageMakerListenStream {
        parts: Option<mpsc::Sender<RequestStreamEvent>>,
        reader: JoinHandle<()>,
    }

    impl SageMakerListenStream {
        async fn send_part(&self, bytes: Vec<u8>, data_type: &str) -> Result<()> {
            let parts = self
                .parts
                .as_ref()
                .context("SageMaker transcription stream is closed")?;
            parts
                .send(payload_part(bytes, data_type))
                .await
                .map_err(|_| anyhow!("SageMaker request stream ended"))
        }
    }

    #[async_trait]
    impl TranscriptionStream for SageMakerListenStream {
        async fn send_audio(&mut self, chunk: Bytes) -> Result<()> {
            self.send_part(chunk.to_vec(), DATA_TYPE_BINARY).await
        }

        async fn close(&mut self) -> Result<()> {
            let result = async {
                self.send_part(FINALIZE_MESSAGE.into(), DATA_TYPE_UTF8)
                    .await?;
                self.send_part(CLOSE_STREAM_MESSAGE.into(), DATA_TYPE_UTF8)
                    .await
            }
            .await;
            // Dropping the sender ends the request stream.
            self.parts = None;
            self.reader.abort();
            result
        }
    }

    impl Drop for SageMakerListenStream {
        fn drop(&mut self) {
            self.reader.abort();
        }
    }
}

#[cfg(feature = "sagemaker")]
pub use client::SageMakerTranscriber;
