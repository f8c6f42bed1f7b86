//! Typed progress channel between the orchestrator and the transport.
//!
//! The orchestrator emits `OrchestrationEvent`s into an `EventSink`; the
//! transport (SSE, tests) subscribes to the receiving end. Senders never
//! block and never fail the pipeline: a closed receiver just drops events.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use troupe_schema::SseEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationEvent {
    /// Narration of what an agent is doing.
    Thinking {
        agent: String,
        action: String,
        message: String,
    },
    /// An agent is about to run.
    AgentStart {
        agent_id: String,
        name: String,
        role: String,
    },
    /// An agent finished; `response` is its full output.
    AgentComplete {
        agent_name: String,
        agent_role: String,
        response: String,
    },
    /// One streamed text delta from the synthesis or QA phases.
    StreamDelta { text: String },
}

/// Non-blocking sender half of the progress channel.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<OrchestrationEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything. For callers that do not stream.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: OrchestrationEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn thinking(
        &self,
        agent: impl Into<String>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.emit(OrchestrationEvent::Thinking {
            agent: agent.into(),
            action: action.into(),
            message: message.into(),
        });
    }

    pub fn agent_start(
        &self,
        agent_id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) {
        self.emit(OrchestrationEvent::AgentStart {
            agent_id: agent_id.into(),
            name: name.into(),
            role: role.into(),
        });
    }

    pub fn agent_complete(
        &self,
        agent_name: impl Into<String>,
        agent_role: impl Into<String>,
        response: impl Into<String>,
    ) {
        self.emit(OrchestrationEvent::AgentComplete {
            agent_name: agent_name.into(),
            agent_role: agent_role.into(),
            response: response.into(),
        });
    }

    pub fn stream_delta(&self, text: impl Into<String>) {
        self.emit(OrchestrationEvent::StreamDelta { text: text.into() });
    }
}

/// Outbound SSE channel. A send to a hung-up client cancels the turn's
/// token, which is how client disconnects propagate into the pipeline.
#[derive(Clone)]
pub struct SseEmitter {
    tx: mpsc::UnboundedSender<SseEvent>,
    cancel: CancellationToken,
}

impl SseEmitter {
    pub fn channel(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<SseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, cancel }, rx)
    }

    pub fn emit(&self, event: SseEvent) {
        if self.tx.send(event).is_err() {
            self.cancel.cancel();
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.agent_start("a1", "Lena", "Lead");
        sink.stream_delta("hello");
        sink.agent_complete("Lena", "Lead", "done");

        assert!(matches!(
            rx.recv().await,
            Some(OrchestrationEvent::AgentStart { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(OrchestrationEvent::StreamDelta { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(OrchestrationEvent::AgentComplete { .. })
        ));
    }

    #[test]
    fn disabled_sink_drops_silently() {
        let sink = EventSink::disabled();
        sink.stream_delta("nobody listening");
    }

    #[tokio::test]
    async fn closed_receiver_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.thinking("Lena", "plan", "working");
    }

    #[tokio::test]
    async fn emitter_cancels_on_hangup() {
        let cancel = CancellationToken::new();
        let (emitter, rx) = SseEmitter::channel(cancel.clone());
        drop(rx);
        emitter.emit(SseEvent::Final(troupe_schema::FinalEvent::ok()));
        assert!(cancel.is_cancelled());
    }
}
