pub mod agent_loop;
pub mod artifact;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod kb_tools;
pub mod orchestrator;
pub mod prompts;
pub mod router;
pub mod team;
pub mod tool;

pub use agent_loop::{AgentRunner, LoopOutcome, LoopResult, LoopSpec};
pub use config::{CoreConfig, ModelRef};
pub use dispatcher::{ChatDispatcher, ChatRequest, FileAttachment};
pub use error::{CoreError, CoreResult};
pub use events::{EventSink, OrchestrationEvent, SseEmitter};
pub use kb_tools::KbToolSuite;
pub use orchestrator::{
    ResumeContext, SelectedAgent, SpecialistResponse, TeamOrchestrator, TeamTurnOutcome,
    TurnContext, WorkPlan,
};
pub use router::LlmRouter;
pub use team::{TeamExtractor, TEAM_CONFIRMED_MARKER};
pub use tool::{ToolExecutor, ToolRegistry};
