
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::{ChatMessage, ChatOptions, ChatProvider, Role};
use crate::config::Config;
use crate::database::SessionService;
use crate::database::models::{Message, MessageRole};
use crate::pipeline::DocumentPipeline;
use crate::retrieval::{RelevanceGate, build_system_prompt, refusal_message, search_relevant_content};
use crate::{RagError, Result};

/// Conversation turns sent to the provider alongside the system prompt.
const HISTORY_LIMIT: u32 = 10;

const FALLBACK_MESSAGE: &str =
    "I wasn't able to finish generating this answer. Please try asking again.";

/// How a completed stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// The reply was finalized and persisted.
    Completed(Message),
    /// The session was stopped externally mid-stream; whoever stopped it
    /// already persisted the partial message.
    Stopped,
}

/// Orchestrates one streamed chat turn: persist the user message, retrieve
/// and gate course material, stream the provider's reply while buffering it
/// durably, and finalize the session.
pub struct StreamingChatService {
    provider: Arc<dyn ChatProvider>,
    pipeline: Arc<DocumentPipeline>,
    sessions: SessionService,
    gate: RelevanceGate,
    options: ChatOptions,
    top_k: usize,
    word_delay: Duration,
    session_timeout_minutes: i64,
}

impl StreamingChatService {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        pipeline: Arc<DocumentPipeline>,
        sessions: SessionService,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            pipeline,
            sessions,
            gate: RelevanceGate::new(&config.relevance),
            options: ChatOptions::from(&config.chat),
            top_k: config.relevance.max_results,
            word_delay: Duration::from_millis(config.streaming.word_delay_ms),
            session_timeout_minutes: config.streaming.session_timeout_minutes,
        }
    }

    /// Streams a reply to `message`, forwarding chunks through `tx` as they
    /// are durably buffered. Off-topic questions get the canned refusal
    /// without a provider call.
    pub async fn stream_message(
        &self,
        chat_id: i64,
        user_id: i64,
        message: &str,
        namespaces: &[String],
        tx: mpsc::Sender<String>,
    ) -> Result<StreamOutcome> {
        let session_id = self
            .sessions
            .start_session(chat_id, user_id, message)
            .await?;

        let context = match self.retrieve(message, namespaces).await {
            Ok(context) => context,
            Err(e) => {
                self.sessions.fail(&session_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        if !context.report.is_relevant {
            info!("Refusing off-topic question for chat {chat_id}");
            return self.stream_canned(&session_id, refusal_message(), &tx).await;
        }

        let mut messages = vec![ChatMessage::system(build_system_prompt(&context))];
        for turn in self.sessions.db().recent_messages(chat_id, HISTORY_LIMIT).await? {
            messages.push(ChatMessage {
                role: match turn.role {
                    MessageRole::System => Role::System,
                    MessageRole::User => Role::User,
                    MessageRole::Assistant => Role::Assistant,
                },
                content: turn.content,
            });
        }

        let provider = Arc::clone(&self.provider);
        let options = self.options.clone();
        let (provider_tx, mut provider_rx) = mpsc::channel::<String>(32);
        let producer = tokio::spawn(async move {
            provider.stream_complete(&messages, &options, provider_tx).await
        });

        let mut received_any = false;
        let mut receiver_open = true;
        while let Some(chunk) = provider_rx.recv().await {
            if !self.sessions.append_chunk(&session_id, &chunk).await? {
                // Stopped externally; stop pulling so the provider winds down.
                debug!("Session {session_id} stopped mid-stream");
                drop(provider_rx);
                producer.abort();
                return Ok(StreamOutcome::Stopped);
            }
            received_any = true;
            if receiver_open && tx.send(chunk).await.is_err() {
                receiver_open = false;
            }
        }

        match producer.await {
            Ok(Ok(completion)) => {
                debug!(
                    "Provider stream finished ({} tokens total)",
                    completion.usage.total_tokens
                );
                let message = self.sessions.finalize(&session_id).await?;
                Ok(StreamOutcome::Completed(message))
            }
            Ok(Err(e)) => {
                warn!("Provider stream failed, sending fallback: {e}");
                let fallback = if received_any {
                    format!("\n\n{FALLBACK_MESSAGE}")
                } else {
                    FALLBACK_MESSAGE.to_string()
                };
                self.stream_canned(&session_id, &fallback, &tx).await
            }
            Err(e) => {
                self.sessions.fail(&session_id, &e.to_string()).await?;
                Err(RagError::Other(anyhow::anyhow!(
                    "Provider task panicked: {e}"
                )))
            }
        }
    }

    /// Stops an active session on behalf of its owner and returns the
    /// persisted partial message.
    pub async fn stop_session(&self, session_id: &str, user_id: i64) -> Result<Message> {
        self.sessions.stop(session_id, user_id).await
    }

    /// Sweeps sessions abandoned longer than the configured timeout.
    pub async fn reap_abandoned(&self) -> Result<usize> {
        self.sessions.reap_abandoned(self.session_timeout_minutes).await
    }

    async fn retrieve(
        &self,
        query: &str,
        namespaces: &[String],
    ) -> Result<crate::retrieval::RetrievedContext> {
        let pipeline = Arc::clone(&self.pipeline);
        let gate = self.gate.clone();
        let query = query.to_string();
        let namespaces = namespaces.to_vec();
        let top_k = self.top_k;

        tokio::task::spawn_blocking(move || {
            search_relevant_content(&pipeline, &gate, &query, &namespaces, top_k)
        })
        .await
        .map_err(|e| RagError::Other(anyhow::anyhow!("Retrieval task panicked: {e}")))?
    }

    /// Streams a fixed text word by word, buffering each chunk durably
    /// before forwarding it, then finalizes the session.
    async fn stream_canned(
        &self,
        session_id: &str,
        text: &str,
        tx: &mpsc::Sender<String>,
    ) -> Result<StreamOutcome> {
        let words: Vec<&str> = text.split(' ').collect();
        let last = words.len().saturating_sub(1);
        let mut receiver_open = true;

        for (i, word) in words.into_iter().enumerate() {
            let chunk = if i < last {
                format!("{word} ")
            } else {
                word.to_string()
            };
            if !self.sessions.append_chunk(session_id, &chunk).await? {
                return Ok(StreamOutcome::Stopped);
            }
            if receiver_open && tx.send(chunk).await.is_err() {
                receiver_open = false;
            }
            if i < last && !self.word_delay.is_zero() {
                tokio::time::sleep(self.word_delay).await;
            }
        }

        let message = self.sessions.finalize(session_id).await?;
        Ok(StreamOutcome::Completed(message))
    }
}
