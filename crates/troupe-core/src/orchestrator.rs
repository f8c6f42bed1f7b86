//! Team orchestration pipeline: PLAN, SPECIALISTS, SYNTHESIS, and an
//! optional pausable QA gate. Progress flows through the typed event
//! channel; the transport decides how to surface it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use troupe_provider::{LlmMessage, LlmRequest, robust_json_value};
use troupe_schema::{
    Conversation, Message, OrchestrationState, OrchestrationStatus, SpecialistState,
    SpecialistStatus, TeamAgent, Tier,
};

use troupe_memory::{MessageStore, OrchestrationStateStore};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::EventSink;
use crate::prompts;
use crate::router::LlmRouter;

/// The Lead's work plan for a turn. Specialist indices are 1-based over
/// the tier-4 roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkPlan {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub selected_specialists: Vec<usize>,
    #[serde(default)]
    pub assignments: HashMap<String, String>,
    #[serde(default)]
    pub deliverable_outline: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecialistResponse {
    pub agent_name: String,
    pub agent_role: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedAgent {
    pub id: String,
    pub name: String,
    pub role: String,
}

/// Result of one orchestrated turn.
#[derive(Debug, Default)]
pub struct TeamTurnOutcome {
    pub success: bool,
    pub responses: Vec<SpecialistResponse>,
    pub formatted_response: String,
    pub selected_agents: Vec<SelectedAgent>,
    pub work_plan: Option<WorkPlan>,
    pub waiting_for_input: Option<bool>,
    pub qa_approved: Option<bool>,
    /// The persisted QA question (pause) or resolution (resume) message.
    pub qa_message: Option<Message>,
}

/// One team turn to run.
pub struct TurnContext {
    pub conversation: Conversation,
    pub objective: String,
    /// Message id of the user turn driving this orchestration.
    pub parent_message_id: String,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

/// A paused turn being resumed by a user reply.
pub struct ResumeContext {
    pub conversation: Conversation,
    pub state: OrchestrationState,
    pub user_reply: String,
    /// Message id of the user's reply (parent of the resolution message).
    pub reply_message_id: String,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
struct QaVerdict {
    #[serde(default)]
    approved: Option<bool>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

pub struct TeamOrchestrator {
    router: Arc<LlmRouter>,
    config: Arc<CoreConfig>,
    states: OrchestrationStateStore,
    messages: Arc<dyn MessageStore>,
}

impl TeamOrchestrator {
    pub fn new(
        router: Arc<LlmRouter>,
        config: Arc<CoreConfig>,
        states: OrchestrationStateStore,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            router,
            config,
            states,
            messages,
        }
    }

    /// Run a full turn: PLAN, SPECIALISTS, SYNTHESIS, then the QA gate
    /// when the team carries a tier-5 agent.
    pub async fn run(&self, ctx: TurnContext) -> CoreResult<TeamTurnOutcome> {
        let team = &ctx.conversation.team_agents;
        let lead = team
            .iter()
            .find(|agent| agent.tier == Tier::Lead)
            .ok_or_else(|| CoreError::FatalBug("team has no tier-3 lead".into()))?;
        let specialists: Vec<&TeamAgent> =
            team.iter().filter(|a| a.tier == Tier::Specialist).collect();
        let qa = team.iter().find(|a| a.tier == Tier::Qa);

        // ---- PLAN ----
        let plan = self.run_plan(&ctx, lead, &specialists).await?;
        let indices = validated_indices(&plan, specialists.len());

        let selected_agents: Vec<SelectedAgent> = indices
            .iter()
            .map(|&idx| {
                let agent = specialists[idx - 1];
                SelectedAgent {
                    id: agent.agent_id.clone(),
                    name: agent.name.clone(),
                    role: agent.role.clone(),
                }
            })
            .collect();

        // ---- SPECIALISTS ----
        let mut responses = Vec::new();
        for &idx in &indices {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Canceled);
            }
            let agent = specialists[idx - 1];
            let assignment = plan
                .assignments
                .get(&idx.to_string())
                .map(String::as_str)
                .unwrap_or(prompts::DEFAULT_ASSIGNMENT);

            ctx.events
                .agent_start(&agent.agent_id, &agent.name, &agent.role);
            let response = self
                .specialist_response(&ctx, agent, assignment)
                .await?;
            ctx.events
                .agent_complete(&agent.name, &agent.role, &response);
            responses.push(SpecialistResponse {
                agent_name: agent.name.clone(),
                agent_role: agent.role.clone(),
                response,
            });
        }

        // ---- SYNTHESIS ----
        let mut outcome = TeamTurnOutcome {
            responses,
            selected_agents,
            work_plan: Some(plan),
            ..Default::default()
        };

        let synthesis = match self.run_synthesis(&ctx, lead, &outcome.responses).await {
            Ok(text) => text,
            Err(CoreError::Canceled) => return Err(CoreError::Canceled),
            Err(err) => {
                tracing::error!("synthesis failed: {err}");
                outcome.success = false;
                return Ok(outcome);
            }
        };

        let footer = team_footer(
            &lead.name,
            &outcome
                .selected_agents
                .iter()
                .map(|a| a.name.clone())
                .collect::<Vec<_>>(),
        );
        ctx.events.stream_delta(&footer);
        outcome.formatted_response = format!("{synthesis}{footer}");
        outcome.success = true;

        // ---- QA GATE ----
        if let Some(qa) = qa {
            self.run_qa_gate(&ctx, qa, &mut outcome).await?;
        }

        Ok(outcome)
    }

    async fn run_plan(
        &self,
        ctx: &TurnContext,
        lead: &TeamAgent,
        specialists: &[&TeamAgent],
    ) -> CoreResult<WorkPlan> {
        ctx.events
            .agent_start(&lead.agent_id, &lead.name, &lead.role);
        ctx.events
            .thinking(&lead.name, "plan", "Analyzing the objective");

        let request = LlmRequest {
            model: lead.model.clone(),
            system: Some(prompts::lead_system_prompt(lead)),
            messages: vec![LlmMessage::user(prompts::lead_plan_prompt(
                &ctx.objective,
                specialists,
            ))],
            max_tokens: self.config.max_tokens,
            temperature: None,
            tools: vec![],
            tool_choice: None,
        };

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CoreError::Canceled),
            resp = self.router.chat(&lead.provider, request) => resp,
        };

        let plan = match response {
            Ok(resp) => match parse_work_plan(&resp.text) {
                Some(plan) => plan,
                None => {
                    tracing::warn!("lead plan was not valid JSON, selecting all specialists");
                    fallback_plan(specialists.len())
                }
            },
            Err(err) => {
                tracing::warn!("lead plan failed ({err}), selecting all specialists");
                fallback_plan(specialists.len())
            }
        };

        ctx.events
            .agent_complete(&lead.name, &lead.role, &plan.analysis);
        Ok(plan)
    }

    async fn specialist_response(
        &self,
        ctx: &TurnContext,
        agent: &TeamAgent,
        assignment: &str,
    ) -> CoreResult<String> {
        let request = LlmRequest {
            model: agent.model.clone(),
            system: Some(prompts::specialist_system_prompt(agent)),
            messages: vec![LlmMessage::user(prompts::specialist_user_message(
                &ctx.objective,
                assignment,
            ))],
            max_tokens: self.config.max_tokens,
            temperature: None,
            tools: vec![],
            tool_choice: None,
        };

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CoreError::Canceled),
            resp = self.router.chat(&agent.provider, request) => resp,
        };

        // A failing specialist degrades to a placeholder; the turn goes on.
        Ok(match response {
            Ok(resp) => resp.text,
            Err(err) => format!("[Unable to generate response: {err}]"),
        })
    }

    async fn run_synthesis(
        &self,
        ctx: &TurnContext,
        lead: &TeamAgent,
        responses: &[SpecialistResponse],
    ) -> CoreResult<String> {
        ctx.events
            .thinking(&lead.name, "synthesis", "Integrating specialist inputs");

        let contributions: Vec<(String, String)> = responses
            .iter()
            .map(|r| (r.agent_name.clone(), r.response.clone()))
            .collect();
        let request = LlmRequest {
            model: lead.model.clone(),
            system: Some(prompts::lead_system_prompt(lead)),
            messages: vec![LlmMessage::user(prompts::synthesis_user_prompt(
                &ctx.objective,
                &contributions,
            ))],
            max_tokens: self.config.max_tokens,
            temperature: None,
            tools: vec![],
            tool_choice: None,
        };

        let mut stream = self
            .router
            .stream(&lead.provider, request)
            .await
            .map_err(CoreError::Provider)?;

        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CoreError::Canceled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(CoreError::Provider)?;
            if !chunk.delta.is_empty() {
                text.push_str(&chunk.delta);
                ctx.events.stream_delta(&chunk.delta);
            }
            if chunk.is_final {
                break;
            }
        }

        Ok(text)
    }

    async fn run_qa_gate(
        &self,
        ctx: &TurnContext,
        qa: &TeamAgent,
        outcome: &mut TeamTurnOutcome,
    ) -> CoreResult<()> {
        let delimiter = "\n\n---\n\n**Initiating QA Review...**\n\n";
        ctx.events.stream_delta(delimiter);
        outcome.formatted_response.push_str(delimiter);

        ctx.events.agent_start(&qa.agent_id, &qa.name, &qa.role);

        let request = LlmRequest {
            model: qa.model.clone(),
            system: Some(prompts::qa_system_prompt(qa)),
            messages: vec![LlmMessage::user(prompts::qa_review_prompt(
                &ctx.objective,
                &outcome.formatted_response,
            ))],
            max_tokens: self.config.max_tokens,
            temperature: None,
            tools: vec![],
            tool_choice: None,
        };

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CoreError::Canceled),
            resp = self.router.chat(&qa.provider, request) => resp,
        };

        let verdict = match response {
            Ok(resp) => parse_qa_verdict(&resp.text),
            Err(err) => {
                // Review is advisory once synthesis has succeeded.
                tracing::warn!("QA review unavailable: {err}");
                let note = "_QA review unavailable._";
                ctx.events.stream_delta(note);
                outcome.formatted_response.push_str(note);
                ctx.events.agent_complete(&qa.name, &qa.role, note);
                return Ok(());
            }
        };

        match verdict.question.filter(|q| !q.trim().is_empty()) {
            Some(question) if verdict.approved != Some(true) => {
                let formatted_question = format_qa_question(&qa.name, &question);
                ctx.events.stream_delta(&formatted_question);
                ctx.events
                    .agent_complete(&qa.name, &qa.role, &formatted_question);

                let qa_message = self
                    .pause_for_qa(ctx, qa, outcome, &question, &formatted_question)
                    .await?;
                outcome.waiting_for_input = Some(true);
                outcome.qa_message = Some(qa_message);
            }
            _ => {
                let notes = verdict.notes.unwrap_or_default();
                let approval = if notes.is_empty() {
                    "**QA Review complete.**".to_string()
                } else {
                    format!("**QA Review complete.** {notes}")
                };
                ctx.events.stream_delta(&approval);
                outcome.formatted_response.push_str(&approval);
                ctx.events.agent_complete(&qa.name, &qa.role, &approval);
                outcome.qa_approved = Some(true);
            }
        }

        Ok(())
    }

    /// Persist the paused state, then the QA question message. A failed
    /// state save aborts the pause; a failed message save rolls the state
    /// back so no ghost pause survives.
    async fn pause_for_qa(
        &self,
        ctx: &TurnContext,
        qa: &TeamAgent,
        outcome: &TeamTurnOutcome,
        question: &str,
        formatted_question: &str,
    ) -> CoreResult<Message> {
        let question_message_id = format!("msg_{}", Uuid::new_v4());

        let mut state = OrchestrationState::new(
            &ctx.conversation.conversation_id,
            &ctx.parent_message_id,
            OrchestrationStatus::Paused,
        );
        state.paused_message_id = Some(question_message_id.clone());
        state.lead_plan = outcome
            .work_plan
            .as_ref()
            .and_then(|plan| serde_json::to_value(plan).ok());
        state.shared_context = outcome.formatted_response.clone();
        state.specialist_states = outcome
            .responses
            .iter()
            .map(|r| SpecialistState {
                agent_name: r.agent_name.clone(),
                status: SpecialistStatus::Completed,
                messages: Vec::new(),
                current_output: r.response.clone(),
                thinking: String::new(),
                interrupt_question: None,
                agent_definition: None,
            })
            .collect();
        state.specialist_states.push(SpecialistState {
            agent_name: qa.name.clone(),
            status: SpecialistStatus::Paused,
            messages: Vec::new(),
            current_output: String::new(),
            thinking: String::new(),
            interrupt_question: Some(question.to_string()),
            agent_definition: Some(qa.clone()),
        });

        self.states
            .save(&state)
            .await
            .map_err(CoreError::StatePersist)?;

        let mut qa_message = Message::assistant(
            &ctx.conversation.conversation_id,
            &question_message_id,
            &qa.name,
            formatted_question,
        );
        qa_message.parent_message_id = Some(ctx.parent_message_id.clone());
        qa_message.metadata = Some(serde_json::json!({
            "phase": "qa_gate_pending",
            "waitingForInput": true,
            "qaAgentName": qa.name,
            "qaAgentRole": qa.role,
        }));

        if let Err(err) = self.messages.save(&qa_message).await {
            let _ = self
                .states
                .clear(
                    &ctx.conversation.conversation_id,
                    Some(&ctx.parent_message_id),
                )
                .await;
            return Err(CoreError::StatePersist(err));
        }

        Ok(qa_message)
    }

    /// Resume a paused turn: feed the user's reply to the QA agent,
    /// persist the resolution, clear the state.
    pub async fn resume(&self, ctx: ResumeContext) -> CoreResult<TeamTurnOutcome> {
        let qa = self.resolve_qa_agent(&ctx)?;
        let question = ctx
            .state
            .specialist_states
            .iter()
            .find_map(|s| s.interrupt_question.clone())
            .unwrap_or_default();

        ctx.events.agent_start(&qa.agent_id, &qa.name, &qa.role);

        let request = LlmRequest {
            model: qa.model.clone(),
            system: Some(prompts::qa_system_prompt(&qa)),
            messages: vec![LlmMessage::user(prompts::qa_resume_prompt(
                &question,
                &ctx.user_reply,
            ))],
            max_tokens: self.config.max_tokens,
            temperature: None,
            tools: vec![],
            tool_choice: None,
        };

        let mut text = String::new();
        let mut stream_failed: Option<anyhow::Error> = None;
        match self.router.stream(&qa.provider, request.clone()).await {
            Ok(mut stream) => loop {
                let chunk = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(CoreError::Canceled),
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                match chunk {
                    Ok(chunk) => {
                        if !chunk.delta.is_empty() {
                            text.push_str(&chunk.delta);
                            ctx.events.stream_delta(&chunk.delta);
                        }
                        if chunk.is_final {
                            break;
                        }
                    }
                    Err(err) => {
                        stream_failed = Some(err);
                        break;
                    }
                }
            },
            Err(err) => stream_failed = Some(err),
        }

        // Fall back to a whole-message completion when streaming is not
        // available from this provider.
        if let Some(err) = stream_failed {
            tracing::debug!("QA resume stream unavailable ({err}), using chat");
            let resp = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CoreError::Canceled),
                resp = self.router.chat(&qa.provider, request) => {
                    resp.map_err(CoreError::Provider)?
                }
            };
            text = resp.text;
            ctx.events.stream_delta(&text);
        }

        let verdict = parse_qa_verdict(&text);
        let approved = verdict.approved.unwrap_or(true);
        let resolution_text = verdict
            .notes
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| {
                if approved {
                    format!("**{}** approved the deliverable.", qa.name)
                } else {
                    text.clone()
                }
            });

        ctx.events
            .agent_complete(&qa.name, &qa.role, &resolution_text);

        let mut resolution = Message::assistant(
            &ctx.conversation.conversation_id,
            format!("msg_{}", Uuid::new_v4()),
            &qa.name,
            &resolution_text,
        );
        resolution.parent_message_id = Some(ctx.reply_message_id.clone());
        resolution.metadata = Some(serde_json::json!({
            "phase": "qa_gate_complete",
            "qaApproved": approved,
        }));
        self.messages
            .save(&resolution)
            .await
            .map_err(CoreError::StatePersist)?;

        self.states
            .clear(
                &ctx.conversation.conversation_id,
                Some(&ctx.state.parent_message_id),
            )
            .await
            .map_err(CoreError::StatePersist)?;

        Ok(TeamTurnOutcome {
            success: true,
            formatted_response: resolution_text,
            qa_approved: Some(approved),
            qa_message: Some(resolution),
            ..Default::default()
        })
    }

    fn resolve_qa_agent(&self, ctx: &ResumeContext) -> CoreResult<TeamAgent> {
        if let Some(qa) = ctx
            .conversation
            .team_agents
            .iter()
            .find(|a| a.tier == Tier::Qa)
        {
            return Ok(qa.clone());
        }
        ctx.state
            .specialist_states
            .iter()
            .find_map(|s| s.agent_definition.clone())
            .filter(|a| a.tier == Tier::Qa)
            .ok_or_else(|| CoreError::FatalBug("paused state has no QA agent".into()))
    }
}

fn fallback_plan(specialist_count: usize) -> WorkPlan {
    WorkPlan {
        selected_specialists: (1..=specialist_count).collect(),
        ..Default::default()
    }
}

fn parse_work_plan(text: &str) -> Option<WorkPlan> {
    let value = robust_json_value(text).ok()?;
    serde_json::from_value(value).ok()
}

/// Clamp the Lead's selection to valid, unique, in-range 1-based indices,
/// preserving order. An empty selection degrades to every specialist.
fn validated_indices(plan: &WorkPlan, specialist_count: usize) -> Vec<usize> {
    let mut seen = Vec::new();
    for &idx in &plan.selected_specialists {
        if idx >= 1 && idx <= specialist_count && !seen.contains(&idx) {
            seen.push(idx);
        }
    }
    if seen.is_empty() {
        (1..=specialist_count).collect()
    } else {
        seen
    }
}

fn parse_qa_verdict(text: &str) -> QaVerdict {
    match robust_json_value(text) {
        Ok(value) => serde_json::from_value(value).unwrap_or_default(),
        Err(_) => QaVerdict {
            approved: Some(true),
            question: None,
            notes: Some(text.trim().to_string()).filter(|n| !n.is_empty()),
        },
    }
}

fn team_footer(lead: &str, specialists: &[String]) -> String {
    let mut names = vec![lead.to_string()];
    names.extend(specialists.iter().cloned());
    format!(
        "\n\n---\n\n_**Team:** {} | {}_",
        names.join(", "),
        Utc::now().format("%Y-%m-%d")
    )
}

fn format_qa_question(qa_name: &str, question: &str) -> String {
    format!("**{qa_name} needs your input before completing this review:**\n\n{question}")
}
