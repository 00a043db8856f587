//! Manages the WebSocket connection lifecycle for a voice session.

use super::{
    cycle::{OrchestratorSettings, SessionOrchestrator, SessionPhase},
    outbox::{ConnectionClosed, Outbound, Outbox},
    protocol::{ClientMessage, ServerMessage, Status},
    provider::{Transcriber, TranscriptionConfig, TranscriptionEvent, TranscriptionStream},
};
use crate::{config::SttMode, state::AppState};
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use rxconnect_core::tools::ToolDispatcher;
use std::{fmt::Debug, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Every connection gets its own orchestrator and transcription session;
/// nothing mutable is shared between connections.
#[instrument(name = "voice_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id: u32 = rand::random();
    tracing::Span::current().record("session_id", session_id);
    info!("New voice connection.");

    let (socket_tx, socket_rx) = socket.split();
    let (outbox, outbox_rx) = Outbox::channel();
    let writer = tokio::spawn(forward_outbound(socket_tx, outbox_rx));

    let orchestrator = SessionOrchestrator::new(
        state.dialogue.clone(),
        state.synthesizer.clone(),
        ToolDispatcher::new(state.store.clone()),
        state.system_prompt.clone(),
        OrchestratorSettings::from_config(&state.config),
        outbox.clone(),
    );

    let stt_config = TranscriptionConfig::pcm16(state.config.stt_model.clone());
    let result = run_voice_session(
        state.transcriber.as_ref(),
        &stt_config,
        state.config.stt_mode,
        &orchestrator,
        &outbox,
        socket_rx,
    )
    .await;
    if let Err(e) = result {
        debug!(error = %e, "Voice session ended early.");
    }

    orchestrator.shutdown();
    let _ = outbox.close().await;
    drop(outbox);
    if let Err(e) = writer.await {
        error!("Socket writer task failed: {:?}", e);
    }
    info!("Voice connection closed.");
}

/// Opens transcription, greets the caller and pumps client frames until the
/// client leaves or the call ends.
async fn run_voice_session<S, E>(
    transcriber: &dyn Transcriber,
    stt_config: &TranscriptionConfig,
    stt_mode: SttMode,
    orchestrator: &Arc<SessionOrchestrator>,
    outbox: &Outbox,
    mut socket_rx: S,
) -> Result<(), ConnectionClosed>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Debug,
{
    let (mut stt, listener) = match transcriber.open(stt_config).await {
        Ok(session) => {
            orchestrator.mark_connected();
            outbox
                .status(Status::Connected, &format!("STT connected ({stt_mode})"))
                .await?;
            let listener = tokio::spawn(listen_for_transcripts(
                orchestrator.clone(),
                outbox.clone(),
                session.events,
            ));
            (Some(session.stream), Some(listener))
        }
        Err(e) => {
            // Degraded mode: the caller still gets the greeting and control messages.
            outbox.error(format!("STT connection failed: {e:#}")).await?;
            (None, None)
        }
    };

    let result = pump_client_frames(orchestrator, outbox, &mut socket_rx, &mut stt).await;

    if let Some(listener) = listener {
        listener.abort();
    }
    if let Some(mut stt) = stt {
        if let Err(e) = stt.close().await {
            debug!(error = %e, "Ignoring error while closing transcription.");
        }
    }
    result
}

async fn pump_client_frames<S, E>(
    orchestrator: &Arc<SessionOrchestrator>,
    outbox: &Outbox,
    socket_rx: &mut S,
    stt: &mut Option<Box<dyn TranscriptionStream>>,
) -> Result<(), ConnectionClosed>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Debug,
{
    let mut phase = orchestrator.subscribe();
    orchestrator.greet().await?;

    loop {
        if *phase.borrow_and_update() == SessionPhase::Terminated {
            info!("Call ended by the assistant.");
            break;
        }
        tokio::select! {
            msg_result = socket_rx.next() => {
                match msg_result {
                    Some(Ok(Message::Binary(data))) => match stt.as_mut() {
                        Some(stream) => {
                            if let Err(e) = stream.send_audio(data).await {
                                warn!("Failed to forward audio to transcription: {}", e);
                            }
                        }
                        None => debug!("Dropping audio; transcription is not connected."),
                    },
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(orchestrator, outbox, &text).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the connection.");
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            }
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Routes a JSON control message from the client.
pub(crate) async fn handle_client_text(
    orchestrator: &SessionOrchestrator,
    outbox: &Outbox,
    text: &str,
) -> Result<(), ConnectionClosed> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => outbox.send(ServerMessage::Pong).await,
        Ok(ClientMessage::Reset) => orchestrator.reset().await,
        Err(e) => {
            warn!(error = %e, "Ignoring unrecognized client message.");
            Ok(())
        }
    }
}

/// Feeds transcription events into the orchestrator for the session's lifetime.
async fn listen_for_transcripts(
    orchestrator: Arc<SessionOrchestrator>,
    outbox: Outbox,
    mut events: mpsc::Receiver<TranscriptionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TranscriptionEvent::Opened => debug!("Transcription session opened."),
            TranscriptionEvent::FinalTranscript(text) => {
                let _ = orchestrator.handle_transcript(&text);
            }
            TranscriptionEvent::Error(message) => {
                if outbox.error(format!("STT error: {message}")).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Transcription listener finished.");
}

/// Drains the outbox onto the socket in queue order.
async fn forward_outbound(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(msg) => {
                if let Err(e) = send_msg(&mut socket_tx, msg).await {
                    debug!("Client socket closed while sending: {}", e);
                    break;
                }
            }
            Outbound::Close => {
                let _ = socket_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{
        cycle::GREETING,
        protocol::Speaker,
        provider::{MockSynthesizer, TranscriptionSession},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use rxconnect_core::{
        conversation::ConversationTurn,
        llm_client::{DialogueConnector, DialogueReply},
        store::OrderStore,
        tools::ToolSpec,
    };
    use std::{
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };
    use tokio::time::timeout;

    struct SilentDialogue;

    #[async_trait]
    impl DialogueConnector for SilentDialogue {
        async fn complete(
            &self,
            _messages: &[ConversationTurn],
            _tools: &[ToolSpec],
        ) -> anyhow::Result<DialogueReply> {
            Ok(DialogueReply::default())
        }
    }

    /// What the session did with its transcription stream.
    #[derive(Default)]
    struct SttRecord {
        audio: StdMutex<Vec<Bytes>>,
        closed: AtomicBool,
    }

    struct RecordingStream(Arc<SttRecord>);

    #[async_trait]
    impl TranscriptionStream for RecordingStream {
        async fn send_audio(&mut self, chunk: Bytes) -> anyhow::Result<()> {
            self.0.audio.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.0.closed.store(true, Ordering::SeqCst);
            Err(anyhow::anyhow!("listen socket already closed"))
        }
    }

    /// Hands out one recording stream, or refuses to connect.
    struct ScriptedTranscriber {
        record: Arc<SttRecord>,
        events: StdMutex<Option<mpsc::Receiver<TranscriptionEvent>>>,
    }

    impl ScriptedTranscriber {
        fn accepting() -> (Self, mpsc::Sender<TranscriptionEvent>) {
            let (events_tx, events) = mpsc::channel(4);
            let transcriber = Self {
                record: Arc::default(),
                events: StdMutex::new(Some(events)),
            };
            (transcriber, events_tx)
        }

        fn refusing() -> Self {
            Self {
                record: Arc::default(),
                events: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn open(
            &self,
            _config: &TranscriptionConfig,
        ) -> anyhow::Result<TranscriptionSession> {
            let Some(events) = self.events.lock().unwrap().take() else {
                anyhow::bail!("handshake refused");
            };
            Ok(TranscriptionSession {
                stream: Box::new(RecordingStream(self.record.clone())),
                events,
            })
        }
    }

    fn quiet_synthesizer() -> MockSynthesizer {
        let mut synthesizer = MockSynthesizer::new();
        synthesizer
            .expect_synthesize()
            .returning(|_| Ok(Box::pin(futures::stream::empty::<anyhow::Result<Bytes>>())));
        synthesizer
    }

    fn client_frames(
        frames: Vec<Message>,
    ) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
        futures::stream::iter(frames.into_iter().map(Ok))
    }

    fn stt_config() -> TranscriptionConfig {
        TranscriptionConfig::pcm16("nova-3")
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn orchestrator() -> (Arc<SessionOrchestrator>, Outbox, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = Outbox::channel();
        let orchestrator = SessionOrchestrator::new(
            Arc::new(SilentDialogue),
            Arc::new(quiet_synthesizer()),
            ToolDispatcher::new(Arc::new(OrderStore::new(Vec::new()))),
            Arc::new(String::new()),
            OrchestratorSettings {
                voice: "aura-2-thalia-en".into(),
                goodbye_delay: Duration::ZERO,
                max_tool_rounds: 1,
                call_timeout: Duration::from_secs(1),
            },
            outbox.clone(),
        );
        (orchestrator, outbox, rx)
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (orchestrator, outbox, mut rx) = orchestrator();

        handle_client_text(&orchestrator, &outbox, r#"{"type":"ping"}"#)
            .await
            .unwrap();

        assert_eq!(rx.try_recv().ok(), Some(Outbound::Frame(ServerMessage::Pong)));
    }

    #[tokio::test]
    async fn test_reset_message_resets_conversation() {
        let (orchestrator, outbox, mut rx) = orchestrator();

        handle_client_text(&orchestrator, &outbox, r#"{"type":"reset"}"#)
            .await
            .unwrap();

        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Frame(ServerMessage::status(
                Status::Ready,
                "Conversation reset"
            )))
        );
        assert!(orchestrator.snapshot().await.history.is_empty());
        assert_ne!(orchestrator.phase(), SessionPhase::Terminated);
    }

    #[tokio::test]
    async fn test_invalid_client_text_is_ignored() {
        let (orchestrator, outbox, mut rx) = orchestrator();

        for text in ["not json", r#"{"type":"dance"}"#, r#"{"kind":"ping"}"#] {
            handle_client_text(&orchestrator, &outbox, text).await.unwrap();
        }

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transcription_events_drive_the_session() {
        let (orchestrator, outbox, mut rx) = orchestrator();
        let (events_tx, events) = mpsc::channel(4);
        let listener = tokio::spawn(listen_for_transcripts(
            orchestrator.clone(),
            outbox.clone(),
            events,
        ));

        events_tx.send(TranscriptionEvent::Opened).await.unwrap();
        events_tx
            .send(TranscriptionEvent::Error("stream reset".into()))
            .await
            .unwrap();
        drop(events_tx);
        listener.await.unwrap();

        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Frame(ServerMessage::error("STT error: stream reset")))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_transcription_still_greets_and_serves_controls() {
        let (orchestrator, outbox, mut rx) = orchestrator();
        let transcriber = ScriptedTranscriber::refusing();
        let frames = client_frames(vec![
            Message::Binary(Bytes::from_static(&[1, 0])),
            Message::Text(r#"{"type":"ping"}"#.into()),
            Message::Text(r#"{"type":"reset"}"#.into()),
        ]);

        run_voice_session(
            &transcriber,
            &stt_config(),
            SttMode::Cloud,
            &orchestrator,
            &outbox,
            frames,
        )
        .await
        .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                Outbound::Frame(ServerMessage::error(
                    "STT connection failed: handshake refused"
                )),
                Outbound::Frame(ServerMessage::transcript(GREETING, Speaker::Assistant)),
                Outbound::Frame(ServerMessage::status(
                    Status::Speaking,
                    "Generating response..."
                )),
                Outbound::Frame(ServerMessage::status(Status::Ready, "Ready")),
                Outbound::Frame(ServerMessage::Pong),
                Outbound::Frame(ServerMessage::status(Status::Ready, "Conversation reset")),
            ]
        );
        assert_eq!(orchestrator.phase(), SessionPhase::Listening);
        assert!(transcriber.record.audio.lock().unwrap().is_empty());
        assert!(!transcriber.record.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_audio_is_forwarded_verbatim_and_transcription_closed() {
        let (orchestrator, outbox, mut rx) = orchestrator();
        let (transcriber, _events) = ScriptedTranscriber::accepting();
        let frames = client_frames(vec![
            Message::Binary(Bytes::from_static(&[1, 0, 2, 0])),
            Message::Ping(Bytes::new()),
            Message::Binary(Bytes::from_static(&[3, 0])),
        ]);

        // The close error from the transcription stream is swallowed.
        run_voice_session(
            &transcriber,
            &stt_config(),
            SttMode::SageMaker,
            &orchestrator,
            &outbox,
            frames,
        )
        .await
        .unwrap();

        assert_eq!(
            *transcriber.record.audio.lock().unwrap(),
            vec![
                Bytes::from_static(&[1, 0, 2, 0]),
                Bytes::from_static(&[3, 0])
            ]
        );
        assert!(transcriber.record.closed.load(Ordering::SeqCst));
        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Frame(ServerMessage::status(
                Status::Connected,
                "STT connected (SageMaker)"
            )))
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Frame(ServerMessage::transcript(
                GREETING,
                Speaker::Assistant
            )))
        );
    }

    #[tokio::test]
    async fn test_cloud_mode_is_named_in_connected_status() {
        let (orchestrator, outbox, mut rx) = orchestrator();
        let (transcriber, _events) = ScriptedTranscriber::accepting();

        run_voice_session(
            &transcriber,
            &stt_config(),
            SttMode::Cloud,
            &orchestrator,
            &outbox,
            client_frames(Vec::new()),
        )
        .await
        .unwrap();

        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Frame(ServerMessage::status(
                Status::Connected,
                "STT connected (Cloud)"
            )))
        );
    }

    #[tokio::test]
    async fn test_terminated_session_stops_pumping() {
        let (orchestrator, outbox, mut rx) = orchestrator();
        let (transcriber, _events) = ScriptedTranscriber::accepting();
        let record = transcriber.record.clone();
        let session = {
            let orchestrator = orchestrator.clone();
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let frames = futures::stream::pending::<Result<Message, axum::Error>>();
                run_voice_session(
                    &transcriber,
                    &stt_config(),
                    SttMode::Cloud,
                    &orchestrator,
                    &outbox,
                    frames,
                )
                .await
            })
        };

        // Once the greeting is out the pump is parked on the silent socket.
        loop {
            match rx.recv().await {
                Some(Outbound::Frame(ServerMessage::Status {
                    status: Status::Ready,
                    ..
                })) => break,
                Some(_) => {}
                None => panic!("outbox closed before the greeting finished"),
            }
        }
        orchestrator.shutdown();

        timeout(Duration::from_secs(1), session)
            .await
            .expect("session should stop once terminated")
            .unwrap()
            .unwrap();
        assert!(record.closed.load(Ordering::SeqCst));
    }
}
