//! Per-turn chat dispatch: mode resolution (single agent vs. team), the
//! activation phrase, `[TEAM_CONFIRMED]` handling with background team
//! extraction, file-triggered team creation, artifact ingestion, message
//! persistence, and the SSE event contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use troupe_memory::embedding::EmbeddingProvider;
use troupe_memory::{
    ConversationStore, KbStore, MessageStore, OrchestrationStateStore, SaveDocumentInput,
};
use troupe_provider::{LlmMessage, StructuredRequest, ToolChoice};
use troupe_schema::{
    extract_text, Conversation, CreatedEvent, FinalEvent, Message, ProgressEvent, ProgressKind,
    SseEvent, TextEvent,
};

use crate::agent_loop::{AgentRunner, LoopResult, LoopSpec};
use crate::artifact::extract_artifacts;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, OrchestrationEvent, SseEmitter};
use crate::kb_tools::KbToolSuite;
use crate::orchestrator::{ResumeContext, TeamOrchestrator, TurnContext};
use crate::prompts;
use crate::router::LlmRouter;
use crate::team::{
    convert_to_agents, detect_activation, is_team_related, strip_team_confirmed, ExtractedMember,
    ExtractedTeam, TeamExtractor, TEAM_CONFIRMED_MARKER,
};

/// An uploaded file already read into text by the (external) file layer.
#[derive(Debug, Clone)]
pub struct FileAttachment {
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    pub content: String,
}

impl FileAttachment {
    /// Document-like files can trigger background team creation.
    pub fn is_document(&self) -> bool {
        self.mime_type == "application/pdf"
            || self.mime_type.starts_with("application/")
            || self.mime_type.starts_with("text/")
    }
}

/// One inbound user turn.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub text: String,
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub agent_id: Option<String>,
    pub files: Vec<FileAttachment>,
    /// Regenerate-style flows supply the response id up front.
    pub response_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileAnalysis {
    #[serde(default)]
    document_type: String,
    #[serde(default)]
    roles: Vec<FileRole>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRole {
    role: String,
    name: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    responsibilities: String,
}

pub struct ChatDispatcher {
    router: Arc<LlmRouter>,
    config: Arc<CoreConfig>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    states: OrchestrationStateStore,
    kb: KbStore,
    embedder: Arc<dyn EmbeddingProvider>,
    orchestrator: Arc<TeamOrchestrator>,
    activation: Regex,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatDispatcher {
    pub fn new(
        router: Arc<LlmRouter>,
        config: Arc<CoreConfig>,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        states: OrchestrationStateStore,
        kb: KbStore,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        let activation = config.activation_regex()?;
        let orchestrator = Arc::new(TeamOrchestrator::new(
            Arc::clone(&router),
            Arc::clone(&config),
            states.clone(),
            Arc::clone(&messages),
        ));
        Ok(Arc::new(Self {
            router,
            config,
            conversations,
            messages,
            states,
            kb,
            embedder,
            orchestrator,
            activation,
            turn_locks: Mutex::new(HashMap::new()),
        }))
    }

    /// Entry point for one user turn. Emits the full SSE event sequence
    /// into `emitter` and always ends with a final event unless canceled.
    pub async fn handle_turn(
        self: Arc<Self>,
        request: ChatRequest,
        emitter: SseEmitter,
        cancel: CancellationToken,
    ) {
        match self.handle_turn_inner(request, &emitter, &cancel).await {
            Ok(()) => {}
            Err(err) if err.is_silent() => {
                tracing::info!("turn canceled, stream closed without final event");
            }
            Err(err) => {
                tracing::error!("turn failed: {err}");
                emitter.emit(SseEvent::Final(FinalEvent::error(err.to_string())));
            }
        }
    }

    async fn handle_turn_inner(
        &self,
        request: ChatRequest,
        emitter: &SseEmitter,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if request.text.trim().is_empty() {
            return Err(CoreError::Policy("message text must not be empty".into()));
        }

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| format!("conv_{}", Uuid::new_v4()));

        // One orchestration turn in flight per conversation.
        let _turn_guard = self.turn_lock(&conversation_id).lock_owned().await;

        let mut conversation = self
            .conversations
            .get(&conversation_id)
            .await
            .map_err(CoreError::StatePersist)?
            .unwrap_or_else(|| Conversation::new(&conversation_id));

        // User message persists before any response.
        let mut user_message = Message::user(
            &conversation_id,
            format!("msg_{}", Uuid::new_v4()),
            &request.text,
        );
        user_message.parent_message_id = request.parent_message_id.clone();
        self.messages
            .save(&user_message)
            .await
            .map_err(CoreError::StatePersist)?;

        emitter.emit(SseEvent::Created(CreatedEvent {
            created: true,
            message: Some(user_message.clone()),
            conversation_id: conversation_id.clone(),
        }));

        let user_name = detect_activation(&request.text, &self.activation);

        // A reply to a paused QA question resumes exactly that turn.
        if let Some(parent) = &request.parent_message_id {
            let paused = self
                .states
                .find_paused(&conversation_id, parent)
                .await
                .map_err(CoreError::StatePersist)?;
            if let Some(state) = paused {
                return self
                    .resume_turn(conversation, state, request, user_message, emitter, cancel)
                    .await;
            }
        }

        if conversation.has_team() && user_name.is_none() {
            return self
                .team_turn(conversation, request, user_message, emitter, cancel)
                .await;
        }

        // Single coordinator/specialist turn.
        let had_team = conversation.has_team();
        let coordinator_mode = user_name.is_some()
            || request.agent_id.is_none()
            || request.agent_id.as_deref() == Some(self.config.coordinator_agent_id.as_str());

        let response_message_id = request
            .response_message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4()));

        let (sink, rx) = EventSink::channel();
        let pump = spawn_event_pump(
            rx,
            emitter.clone(),
            response_message_id.clone(),
            conversation_id.clone(),
        );

        let history = self.chat_history(&conversation_id, &user_message).await?;
        let suite = KbToolSuite::new(
            &conversation_id,
            self.kb.clone(),
            Arc::clone(&self.embedder),
            self.config.search_default_k,
            self.config.search_max_k,
        );
        let runner = AgentRunner::new(
            Arc::clone(&self.router),
            &self.config.coordinator_model.provider,
            &self.config.coordinator_model.model,
        )
        .with_max_turns(self.config.max_loop_turns)
        .with_max_tokens(self.config.max_tokens);

        let spec = LoopSpec {
            agent_name: self.config.coordinator_name.clone(),
            system_prompt: prompts::coordinator_system_prompt(&self.config, user_name.as_deref()),
            messages: history,
            tools: suite.registry(),
            submission_tool: None,
            tool_choice: ToolChoice::Auto,
        };

        let outcome = runner.run_streaming(spec, &sink, cancel).await;
        drop(sink);
        let _ = pump.await;
        let outcome = outcome?;

        let raw_text = match outcome.result {
            Some(LoopResult::Text(text)) => text,
            Some(LoopResult::Submission(value)) => value.to_string(),
            None => {
                return Err(CoreError::Provider(anyhow::anyhow!(
                    "agent exhausted its turn budget without a response"
                )))
            }
        };

        // Confirmation marker: strip before persistence, then create the
        // team in the background.
        let team_confirmed = coordinator_mode && raw_text.contains(TEAM_CONFIRMED_MARKER);
        let final_text = strip_team_confirmed(&raw_text);

        let mut response_message = Message::assistant(
            &conversation_id,
            &response_message_id,
            &self.config.coordinator_name,
            &final_text,
        );
        response_message.parent_message_id = Some(user_message.message_id.clone());
        self.messages
            .save(&response_message)
            .await
            .map_err(CoreError::StatePersist)?;

        self.ingest_artifacts(&conversation_id, &response_message)
            .await;

        if conversation.title.is_none() {
            conversation.title = Some(derive_title(&request.text));
        }
        let conversation = self
            .conversations
            .upsert(&conversation)
            .await
            .map_err(CoreError::StatePersist)?;

        if team_confirmed {
            self.spawn_team_extraction(conversation_id.clone());
        }

        if !had_team {
            if let Some(file) = request.files.iter().find(|f| f.is_document()) {
                self.spawn_file_team_creation(conversation_id.clone(), file.clone());
            }
        }

        let title = conversation.title.clone();
        emitter.emit(SseEvent::Final(FinalEvent {
            is_final: true,
            conversation: Some(conversation),
            title,
            request_message: Some(user_message),
            response_message: Some(response_message),
            qa_waiting_for_approval: None,
            team_created: Some(team_confirmed),
            error: None,
        }));
        Ok(())
    }

    async fn team_turn(
        &self,
        conversation: Conversation,
        request: ChatRequest,
        user_message: Message,
        emitter: &SseEmitter,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let objective = self.effective_objective(&conversation, &request.text);
        let response_message_id = request
            .response_message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4()));

        let (sink, rx) = EventSink::channel();
        let pump = spawn_event_pump(
            rx,
            emitter.clone(),
            response_message_id.clone(),
            conversation.conversation_id.clone(),
        );

        let ctx = TurnContext {
            conversation: conversation.clone(),
            objective,
            parent_message_id: user_message.message_id.clone(),
            events: sink,
            cancel: cancel.clone(),
        };
        let outcome = self.orchestrator.run(ctx).await;
        let _ = pump.await;
        let outcome = outcome?;

        if !outcome.success {
            emitter.emit(SseEvent::Final(FinalEvent::error(
                "team orchestration failed during synthesis",
            )));
            return Ok(());
        }

        if outcome.waiting_for_input == Some(true) {
            let title = conversation.title.clone();
            emitter.emit(SseEvent::Final(FinalEvent {
                is_final: true,
                conversation: Some(conversation),
                title,
                request_message: Some(user_message),
                response_message: outcome.qa_message,
                qa_waiting_for_approval: Some(true),
                team_created: None,
                error: None,
            }));
            return Ok(());
        }

        let lead_name = conversation
            .team_agents
            .iter()
            .find(|a| a.tier == troupe_schema::Tier::Lead)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "Team".to_string());

        let mut response_message = Message::assistant(
            &conversation.conversation_id,
            &response_message_id,
            &lead_name,
            &outcome.formatted_response,
        );
        response_message.parent_message_id = Some(user_message.message_id.clone());
        self.messages
            .save(&response_message)
            .await
            .map_err(CoreError::StatePersist)?;

        self.ingest_artifacts(&conversation.conversation_id, &response_message)
            .await;

        let conversation = self
            .conversations
            .upsert(&conversation)
            .await
            .map_err(CoreError::StatePersist)?;

        let title = conversation.title.clone();
        emitter.emit(SseEvent::Final(FinalEvent {
            is_final: true,
            conversation: Some(conversation),
            title,
            request_message: Some(user_message),
            response_message: Some(response_message),
            qa_waiting_for_approval: None,
            team_created: None,
            error: None,
        }));
        Ok(())
    }

    async fn resume_turn(
        &self,
        conversation: Conversation,
        state: troupe_schema::OrchestrationState,
        request: ChatRequest,
        user_message: Message,
        emitter: &SseEmitter,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let response_message_id = request
            .response_message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4()));

        let (sink, rx) = EventSink::channel();
        let pump = spawn_event_pump(
            rx,
            emitter.clone(),
            response_message_id,
            conversation.conversation_id.clone(),
        );

        let ctx = ResumeContext {
            conversation: conversation.clone(),
            state,
            user_reply: request.text.clone(),
            reply_message_id: user_message.message_id.clone(),
            events: sink,
            cancel: cancel.clone(),
        };
        let outcome = self.orchestrator.resume(ctx).await;
        let _ = pump.await;
        let outcome = outcome?;

        let title = conversation.title.clone();
        emitter.emit(SseEvent::Final(FinalEvent {
            is_final: true,
            conversation: Some(conversation),
            title,
            request_message: Some(user_message),
            response_message: outcome.qa_message,
            qa_waiting_for_approval: None,
            team_created: None,
            error: None,
        }));
        Ok(())
    }

    /// Short follow-ups reuse the stored objective; substantive messages
    /// become the new objective for the turn.
    fn effective_objective(&self, conversation: &Conversation, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.chars().count() < self.config.short_objective_chars {
            if let Some(stored) = conversation
                .team_objective
                .as_deref()
                .filter(|o| !o.is_empty())
            {
                return stored.to_string();
            }
        }
        trimmed.to_string()
    }

    /// Prior turns as chat history, oldest first, ending with the current
    /// user message.
    async fn chat_history(
        &self,
        conversation_id: &str,
        current: &Message,
    ) -> CoreResult<Vec<LlmMessage>> {
        let stored = self
            .messages
            .get(conversation_id)
            .await
            .map_err(CoreError::StatePersist)?;

        let mut history = Vec::new();
        for message in &stored {
            if message.message_id == current.message_id {
                continue;
            }
            let text = extract_text(message);
            if text.is_empty() {
                continue;
            }
            history.push(LlmMessage {
                role: if message.is_created_by_user {
                    "user".into()
                } else {
                    "assistant".into()
                },
                content: vec![troupe_provider::ContentBlock::Text { text }],
            });
        }
        history.push(LlmMessage::user(extract_text(current)));
        Ok(history)
    }

    /// Artifacts in assistant output are upserted into the KB keyed by
    /// their stable dedupe key. Failures never affect the turn.
    async fn ingest_artifacts(&self, conversation_id: &str, message: &Message) {
        let text = extract_text(message);
        for artifact in extract_artifacts(&text) {
            let title = artifact
                .title
                .clone()
                .or_else(|| artifact.identifier.clone())
                .unwrap_or_else(|| "Artifact".to_string());
            let input = SaveDocumentInput {
                document_id: None,
                dedupe_key: Some(artifact.dedupe_key(conversation_id)),
                title,
                content: artifact.content.clone(),
                message_id: Some(message.message_id.clone()),
                created_by: message.sender.clone(),
                tags: artifact
                    .artifact_type
                    .clone()
                    .map(|t| vec![t])
                    .unwrap_or_default(),
                metadata: Default::default(),
                only_update: false,
            };
            if let Err(err) = self
                .kb
                .save(conversation_id, input, self.embedder.as_ref())
                .await
            {
                tracing::warn!("artifact ingestion failed: {err}");
            }
        }
    }

    fn turn_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().expect("turn lock map poisoned");
        Arc::clone(
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Detached background job: materialize the confirmed team from the
    /// conversation history after a grace delay. Never shares the
    /// request's cancellation context.
    fn spawn_team_extraction(&self, conversation_id: String) {
        let conversations = Arc::clone(&self.conversations);
        let messages = Arc::clone(&self.messages);
        let router = Arc::clone(&self.router);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(config.extraction_grace_delay_ms)).await;
            match extract_and_persist_team(conversations, messages, router, config, &conversation_id)
                .await
            {
                Ok(count) => {
                    tracing::info!("created team of {count} for conversation {conversation_id}")
                }
                Err(err) => {
                    tracing::error!("background team extraction failed: {err}")
                }
            }
        });
    }

    /// Synchronous extraction entry, also used by the force-parse route.
    pub async fn run_team_extraction(&self, conversation_id: &str) -> CoreResult<usize> {
        extract_and_persist_team(
            Arc::clone(&self.conversations),
            Arc::clone(&self.messages),
            Arc::clone(&self.router),
            Arc::clone(&self.config),
            conversation_id,
        )
        .await
    }

    /// Detached background job: design a team from the first attached
    /// document. Failures are logged; the originating turn is unaffected.
    fn spawn_file_team_creation(&self, conversation_id: String, file: FileAttachment) {
        let conversations = Arc::clone(&self.conversations);
        let router = Arc::clone(&self.router);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            match create_team_from_file(conversations, router, config, &conversation_id, &file)
                .await
            {
                Ok(count) => tracing::info!(
                    "file-triggered team of {count} created for conversation {conversation_id}"
                ),
                Err(err) => tracing::error!("file-triggered team creation failed: {err}"),
            }
        });
    }
}

async fn extract_and_persist_team(
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    router: Arc<LlmRouter>,
    config: Arc<CoreConfig>,
    conversation_id: &str,
) -> CoreResult<usize> {
    let Some(mut conversation) = conversations
        .get(conversation_id)
        .await
        .map_err(CoreError::StatePersist)?
    else {
        return Err(CoreError::Policy(format!(
            "conversation not found: {conversation_id}"
        )));
    };

    // Creation happens at most once per conversation.
    if conversation.has_team() {
        return Err(CoreError::Policy("conversation already has a team".into()));
    }

    let stored = messages
        .get(conversation_id)
        .await
        .map_err(CoreError::StatePersist)?;

    // Persisted messages may already have the marker stripped; in that
    // case the whole history is in scope.
    let marker_index = stored
        .iter()
        .rposition(|m| extract_text(m).contains(TEAM_CONFIRMED_MARKER));
    let cutoff = marker_index.map(|idx| idx + 1).unwrap_or(stored.len());

    let sources: Vec<String> = stored[..cutoff]
        .iter()
        .filter(|m| !m.is_created_by_user)
        .map(extract_text)
        .filter(|text| is_team_related(text))
        .collect();

    let extractor = TeamExtractor::new(
        Arc::clone(&router),
        config.extractor_model.provider.clone(),
        config.extractor_model.model.clone(),
        config.extraction_max_chars,
    );
    let team = extractor.extract(&sources).await?;
    let agents = convert_to_agents(conversation_id, &team, &config);

    // Re-check before persisting: the job must not clobber a team that
    // appeared while it ran.
    let fresh = conversations
        .get(conversation_id)
        .await
        .map_err(CoreError::StatePersist)?;
    if fresh.map(|c| c.has_team()).unwrap_or(false) {
        return Err(CoreError::Policy("conversation already has a team".into()));
    }

    let count = agents.len();
    conversation.team_agents = agents;
    if !team.project_name.is_empty() {
        conversation.team_objective = Some(team.project_name.clone());
    }
    conversation.host_agent_id = Some(config.coordinator_agent_id.clone());
    conversation.team_file_id = None;
    conversations
        .upsert(&conversation)
        .await
        .map_err(CoreError::StatePersist)?;

    Ok(count)
}

async fn create_team_from_file(
    conversations: Arc<dyn ConversationStore>,
    router: Arc<LlmRouter>,
    config: Arc<CoreConfig>,
    conversation_id: &str,
    file: &FileAttachment,
) -> CoreResult<usize> {
    let content = head_chars(&file.content, config.file_analysis_max_chars);

    let value = router
        .parse(
            &config.coordinator_model.provider,
            StructuredRequest {
                model: config.coordinator_model.model.clone(),
                schema: prompts::file_analysis_schema(config.file_team_size_cap),
                system: Some(prompts::file_analysis_system()),
                messages: vec![LlmMessage::user(prompts::file_analysis_prompt(
                    &file.filename,
                    content,
                ))],
                max_tokens: config.max_tokens,
            },
        )
        .await
        .map_err(CoreError::Provider)?;

    let analysis: FileAnalysis = serde_json::from_value(value)
        .map_err(|e| CoreError::StructuredParse(format!("file analysis: {e}")))?;

    let members: Vec<ExtractedMember> = analysis
        .roles
        .into_iter()
        .take(config.file_team_size_cap)
        .enumerate()
        .map(|(index, role)| ExtractedMember {
            name: role.name,
            role: role.role,
            tier: if index == 0 { 3 } else { 4 },
            expertise: role.responsibilities,
            behavioral_level: Default::default(),
            instructions: role.instructions,
        })
        .collect();

    if members.is_empty() {
        return Err(CoreError::TeamExtractionFailed);
    }

    let team = ExtractedTeam {
        project_name: analysis.document_type,
        team_size: members.len(),
        members,
        ..Default::default()
    };
    let agents = convert_to_agents(conversation_id, &team, &config);

    let Some(mut conversation) = conversations
        .get(conversation_id)
        .await
        .map_err(CoreError::StatePersist)?
    else {
        return Err(CoreError::Policy(format!(
            "conversation not found: {conversation_id}"
        )));
    };
    if conversation.has_team() {
        return Err(CoreError::Policy("conversation already has a team".into()));
    }

    let count = agents.len();
    conversation.team_agents = agents;
    conversation.team_file_id = Some(file.file_id.clone());
    conversation.host_agent_id = Some(config.coordinator_agent_id.clone());
    conversations
        .upsert(&conversation)
        .await
        .map_err(CoreError::StatePersist)?;

    Ok(count)
}

/// Forward typed orchestration events to the SSE channel. Text deltas
/// accumulate: every text event carries the full text so far.
fn spawn_event_pump(
    mut rx: mpsc::UnboundedReceiver<OrchestrationEvent>,
    emitter: SseEmitter,
    message_id: String,
    conversation_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut accumulated = String::new();
        let mut index = 0usize;
        while let Some(event) = rx.recv().await {
            let sse = match event {
                OrchestrationEvent::Thinking {
                    agent,
                    action,
                    message,
                } => SseEvent::Progress(ProgressEvent {
                    event: ProgressKind::OnThinking,
                    data: serde_json::json!({
                        "agent": agent,
                        "action": action,
                        "message": message,
                    }),
                }),
                OrchestrationEvent::AgentStart {
                    agent_id,
                    name,
                    role,
                } => SseEvent::Progress(ProgressEvent {
                    event: ProgressKind::OnAgentStart,
                    data: serde_json::json!({
                        "id": agent_id,
                        "name": name,
                        "role": role,
                    }),
                }),
                OrchestrationEvent::AgentComplete {
                    agent_name,
                    agent_role,
                    response,
                } => SseEvent::Progress(ProgressEvent {
                    event: ProgressKind::OnAgentComplete,
                    data: serde_json::json!({
                        "agentName": agent_name,
                        "agentRole": agent_role,
                        "response": response,
                    }),
                }),
                OrchestrationEvent::StreamDelta { text } => {
                    accumulated.push_str(&text);
                    index += 1;
                    SseEvent::Text(TextEvent::accumulated(
                        accumulated.clone(),
                        index,
                        message_id.clone(),
                        conversation_id.clone(),
                    ))
                }
            };
            emitter.emit(sse);
        }
    })
}

fn derive_title(text: &str) -> String {
    let title: String = text.trim().chars().take(50).collect();
    if title.is_empty() {
        "New conversation".to_string()
    } else {
        title
    }
}

fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_mime_detection() {
        let pdf = FileAttachment {
            file_id: "f1".into(),
            filename: "spec.pdf".into(),
            mime_type: "application/pdf".into(),
            content: String::new(),
        };
        assert!(pdf.is_document());

        let text = FileAttachment {
            mime_type: "text/markdown".into(),
            ..pdf.clone()
        };
        assert!(text.is_document());

        let image = FileAttachment {
            mime_type: "image/png".into(),
            ..pdf
        };
        assert!(!image.is_document());
    }

    #[test]
    fn derive_title_truncates() {
        assert_eq!(derive_title("  short ask  "), "short ask");
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), 50);
        assert_eq!(derive_title("   "), "New conversation");
    }

    #[test]
    fn head_chars_is_boundary_safe() {
        assert_eq!(head_chars("αβγδ", 2), "αβ");
        assert_eq!(head_chars("abc", 10), "abc");
    }
}
