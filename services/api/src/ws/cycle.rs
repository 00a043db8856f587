//! The per-session conversation cycle.
//!
//! A [`SessionOrchestrator`] owns one caller's conversation: it turns each
//! finalized transcript into a dialogue turn, runs any tool calls the engine
//! requests against the order store, speaks the final reply and ends the call
//! when the assistant says goodbye.
//!
//! At most one turn runs at a time. A transcript that arrives while a turn is
//! in flight is dropped, not queued.

use super::{
    outbox::{ConnectionClosed, Outbox},
    protocol::{DisconnectReason, PCM_SAMPLE_RATE, ServerMessage, Speaker, Status},
    provider::{SynthesisRequest, Synthesizer},
};
use crate::{
    audio_utils::{encode_pcm_base64, pcm16_duration_secs},
    config::Config,
};
use anyhow::anyhow;
use futures::StreamExt;
use rxconnect_core::{
    conversation::{ConversationHistory, ConversationTurn},
    llm_client::DialogueConnector,
    tools::{MemberOrders, ToolDispatcher, ToolOutcome, tool_schema},
};
use std::{
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    task::{AbortHandle, JoinHandle},
    time::timeout,
};
use tracing::{debug, info, warn};

pub const GREETING: &str =
    "Hi! You're speaking with our virtual pharmacy assistant. How may I assist you today?";

/// Phrases that end the call when they appear anywhere in a final reply.
const GOODBYE_PHRASES: [&str; 4] = ["goodbye", "bye", "take care", "thank you for calling"];

/// Case-insensitive check of a final reply against [`GOODBYE_PHRASES`].
pub fn is_goodbye(text: &str) -> bool {
    let text = text.to_lowercase();
    GOODBYE_PHRASES.iter().any(|phrase| text.contains(phrase))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connected,
    Listening,
    Processing,
    Terminated,
}

/// Identifiers the caller has established during the conversation.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub history: ConversationHistory,
    pub current_member_id: Option<String>,
    pub current_order_id: Option<String>,
}

impl SessionContext {
    fn record(&mut self, outcome: &ToolOutcome) {
        match outcome {
            ToolOutcome::Member(verification) if verification.found => {
                self.current_member_id = Some(verification.member_id.clone());
            }
            ToolOutcome::Orders(MemberOrders {
                found: true,
                orders: Some(orders),
                ..
            }) if orders.len() == 1 => {
                self.current_order_id = Some(orders[0].order_id.clone());
            }
            _ => {}
        }
    }

    fn clear(&mut self) {
        self.history.clear();
        self.current_member_id = None;
        self.current_order_id = None;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Dialogue(#[from] anyhow::Error),
    #[error("dialogue call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("no final reply after {0} tool rounds")]
    RoundLimit(usize),
}

/// Tunables for one session, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub voice: String,
    pub goodbye_delay: Duration,
    pub max_tool_rounds: usize,
    pub call_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice: config.tts_voice.clone(),
            goodbye_delay: config.goodbye_delay,
            max_tool_rounds: config.max_tool_rounds,
            call_timeout: config.call_timeout,
        }
    }
}

pub struct SessionOrchestrator {
    dialogue: Arc<dyn DialogueConnector>,
    synthesizer: Arc<dyn Synthesizer>,
    dispatcher: ToolDispatcher,
    system_prompt: Arc<String>,
    settings: OrchestratorSettings,
    outbox: Outbox,
    context: Mutex<SessionContext>,
    processing: AtomicBool,
    phase: watch::Sender<SessionPhase>,
    in_flight: StdMutex<Option<AbortHandle>>,
}

/// Held for the lifetime of one turn. Dropping it, on completion or abort,
/// releases the single-flight flag.
struct ProcessingGuard {
    orchestrator: Arc<SessionOrchestrator>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.orchestrator.processing.store(false, Ordering::Release);
        self.orchestrator.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Processing {
                *phase = SessionPhase::Listening;
                true
            } else {
                false
            }
        });
    }
}

impl SessionOrchestrator {
    pub fn new(
        dialogue: Arc<dyn DialogueConnector>,
        synthesizer: Arc<dyn Synthesizer>,
        dispatcher: ToolDispatcher,
        system_prompt: Arc<String>,
        settings: OrchestratorSettings,
        outbox: Outbox,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Arc::new(Self {
            dialogue,
            synthesizer,
            dispatcher,
            system_prompt,
            settings,
            outbox,
            context: Mutex::new(SessionContext::default()),
            processing: AtomicBool::new(false),
            phase,
            in_flight: StdMutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// A copy of the current conversation state.
    pub async fn snapshot(&self) -> SessionContext {
        self.context.lock().await.clone()
    }

    /// Moves to `phase` unless the session has already ended.
    fn advance(&self, phase: SessionPhase) {
        self.phase.send_if_modified(|current| {
            if *current == SessionPhase::Terminated || *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    pub fn mark_connected(&self) {
        self.advance(SessionPhase::Connected);
    }

    fn try_begin(self: &Arc<Self>) -> Option<ProcessingGuard> {
        if self.phase() == SessionPhase::Terminated {
            return None;
        }
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.advance(SessionPhase::Processing);
        Some(ProcessingGuard {
            orchestrator: Arc::clone(self),
        })
    }

    /// Starts a turn for a finalized transcript. Returns `None` when the
    /// transcript is blank or dropped because a turn is already running.
    pub fn handle_transcript(self: &Arc<Self>, transcript: &str) -> Option<JoinHandle<()>> {
        let text = transcript.trim();
        if text.is_empty() {
            debug!("Ignoring blank transcript.");
            return None;
        }
        let Some(guard) = self.try_begin() else {
            info!(transcript = %text, "Turn already in progress; dropping transcript.");
            return None;
        };

        let text = text.to_string();
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if orchestrator.run_turn(&text).await.is_err() {
                debug!("Client disconnected mid-turn.");
            }
            drop(guard);
        });
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());
        Some(handle)
    }

    async fn run_turn(&self, text: &str) -> Result<(), ConnectionClosed> {
        info!(transcript = %text, "Processing transcript.");
        self.outbox.transcript(text, Speaker::User).await?;
        self.outbox.status(Status::Thinking, "Processing...").await?;
        self.context
            .lock()
            .await
            .history
            .push(ConversationTurn::user(text));

        let reply = match self.run_dialogue().await {
            Ok(reply) => reply,
            Err(e) => return self.outbox.error(format!("LLM error: {e:#}")).await,
        };
        let Some(reply) = reply.filter(|r| !r.trim().is_empty()) else {
            warn!("Dialogue engine returned no reply text.");
            return self.outbox.status(Status::Ready, "Ready").await;
        };

        info!(reply = %reply, "Assistant reply.");
        self.context
            .lock()
            .await
            .history
            .push(ConversationTurn::assistant(reply.as_str()));
        self.outbox.transcript(&reply, Speaker::Assistant).await?;
        self.speak(&reply).await?;

        if is_goodbye(&reply) {
            self.end_call().await?;
        }
        Ok(())
    }

    /// Runs dialogue rounds until the engine answers without tool calls.
    /// Every requested call is dispatched in order and its result appended
    /// before the next round.
    async fn run_dialogue(&self) -> Result<Option<String>, TurnError> {
        for round in 1..=self.settings.max_tool_rounds {
            let messages = self
                .context
                .lock()
                .await
                .history
                .to_prompt(&self.system_prompt);
            let reply = timeout(
                self.settings.call_timeout,
                self.dialogue.complete(&messages, tool_schema()),
            )
            .await
            .map_err(|_| TurnError::TimedOut(self.settings.call_timeout))??;

            if !reply.has_tool_calls() {
                return Ok(reply.content);
            }

            debug!(round, calls = reply.tool_calls.len(), "Dialogue requested tools.");
            let mut context = self.context.lock().await;
            let mut results = Vec::with_capacity(reply.tool_calls.len());
            for request in &reply.tool_calls {
                let (outcome, result) = self.dispatcher.dispatch_to_result(request);
                context.record(&outcome);
                results.push(result);
            }
            context
                .history
                .push(ConversationTurn::assistant_tool_calls(reply.content, reply.tool_calls));
            for result in &results {
                context.history.push(ConversationTurn::tool_result(result));
            }
        }
        Err(TurnError::RoundLimit(self.settings.max_tool_rounds))
    }

    /// Synthesizes `text` and sends it as one audio frame. Synthesis failures
    /// are reported and leave the transcript as the only reply.
    async fn speak(&self, text: &str) -> Result<(), ConnectionClosed> {
        self.outbox
            .status(Status::Speaking, "Generating response...")
            .await?;
        match self.synthesize(text).await {
            Ok(audio) if audio.is_empty() => {
                warn!("Synthesis produced no audio.");
            }
            Ok(audio) => {
                debug!(
                    bytes = audio.len(),
                    seconds = pcm16_duration_secs(audio.len(), PCM_SAMPLE_RATE),
                    "Synthesized reply."
                );
                self.outbox
                    .send(ServerMessage::audio(encode_pcm_base64(&audio)))
                    .await?;
            }
            Err(e) => return self.outbox.error(format!("TTS error: {e:#}")).await,
        }
        self.outbox.status(Status::Ready, "Ready").await
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let request = SynthesisRequest::pcm16(text, self.settings.voice.as_str());
        let collect = async {
            let mut chunks = self.synthesizer.synthesize(&request).await?;
            let mut audio = Vec::new();
            while let Some(chunk) = chunks.next().await {
                audio.extend_from_slice(&chunk?);
            }
            anyhow::Ok(audio)
        };
        timeout(self.settings.call_timeout, collect)
            .await
            .map_err(|_| anyhow!("synthesis timed out after {:?}", self.settings.call_timeout))?
    }

    async fn end_call(&self) -> Result<(), ConnectionClosed> {
        info!("Goodbye detected; ending the call.");
        tokio::time::sleep(self.settings.goodbye_delay).await;
        self.outbox
            .send(ServerMessage::Disconnect {
                reason: DisconnectReason::ConversationEnded,
            })
            .await?;
        self.outbox.close().await?;
        self.phase.send_replace(SessionPhase::Terminated);
        Ok(())
    }

    /// Appends and speaks the opening line, then starts listening.
    pub async fn greet(&self) -> Result<(), ConnectionClosed> {
        self.context
            .lock()
            .await
            .history
            .push(ConversationTurn::assistant(GREETING));
        self.outbox.transcript(GREETING, Speaker::Assistant).await?;
        self.speak(GREETING).await?;
        self.advance(SessionPhase::Listening);
        Ok(())
    }

    /// Forgets the conversation. A running turn is left to finish.
    pub async fn reset(&self) -> Result<(), ConnectionClosed> {
        self.context.lock().await.clear();
        info!("Conversation reset.");
        self.outbox.status(Status::Ready, "Conversation reset").await
    }

    /// Abandons any in-flight turn and ends the session.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.phase.send_replace(SessionPhase::Terminated);
    }
}
