//! Pipeline agents and their trace.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::machine::AgentMessage;

/// The five fixed pipeline roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Receives user input and shows the final output
    Ui,
    /// Splits the request into tasks
    Planner,
    /// Writes code for the tasks
    Coder,
    /// Approves or rejects code
    Reviewer,
    /// Runs approved code and recovers from failures
    Executor,
}

impl AgentRole {
    /// All roles in pipeline order.
    pub const ALL: [AgentRole; 5] = [
        Self::Ui,
        Self::Planner,
        Self::Coder,
        Self::Reviewer,
        Self::Executor,
    ];

    /// Display name used in trace lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ui => "UI Agent",
            Self::Planner => "Planner Agent",
            Self::Coder => "Coder Agent",
            Self::Reviewer => "Reviewer Agent",
            Self::Executor => "Executor Agent",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One "thinks:" entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Role that produced the entry
    pub agent: AgentRole,
    /// Identity of the agent instance
    pub agent_id: Uuid,
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
    /// The thought itself
    pub text: String,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} thinks: {}", self.agent, self.text)
    }
}

/// A pipeline agent: an identity plus its append-only thought log.
#[derive(Debug, Clone)]
pub struct Agent {
    id: Uuid,
    role: AgentRole,
    log: Vec<String>,
}

impl Agent {
    /// Create an agent with a fresh id.
    pub fn new(role: AgentRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            log: Vec::new(),
        }
    }

    /// Unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Role.
    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        self.role.name()
    }

    /// Every thought so far, formatted as `<name> thinks: <text>`.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Record a thought.
    pub fn think(&mut self, text: impl Into<String>) -> TraceEvent {
        let event = TraceEvent {
            agent: self.role,
            agent_id: self.id,
            timestamp: Utc::now(),
            text: text.into(),
        };
        self.log.push(event.to_string());
        event
    }

    /// Record receipt of `message` from `sender`.
    pub fn receive(&mut self, sender: AgentRole, message: &AgentMessage) -> TraceEvent {
        let body = serde_json::to_string(message).unwrap_or_else(|_| message.kind().to_string());
        self.think(format!("Received message from {sender}: {body}"))
    }
}

/// Collects trace events for one run and forwards them to an optional
/// subscriber.
#[derive(Debug, Default)]
pub(crate) struct Trace {
    events: Vec<TraceEvent>,
    subscriber: Option<UnboundedSender<TraceEvent>>,
}

impl Trace {
    pub(crate) fn new(subscriber: Option<UnboundedSender<TraceEvent>>) -> Self {
        Self {
            events: Vec::new(),
            subscriber,
        }
    }

    pub(crate) fn record(&mut self, event: TraceEvent) {
        tracing::debug!(agent = %event.agent, "{}", event.text);
        if let Some(tx) = &self.subscriber
            && tx.send(event.clone()).is_err()
        {
            // Receiver hung up; keep collecting locally.
            self.subscriber = None;
        }
        self.events.push(event);
    }

    pub(crate) fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn test_think_appends_to_log() {
        let mut agent = Agent::new(AgentRole::Planner);
        let event = agent.think("Planning tasks");
        assert_eq!(event.agent_id, agent.id());
        assert_eq!(agent.log(), ["Planner Agent thinks: Planning tasks"]);

        agent.receive(AgentRole::Ui, &AgentMessage::UserInput("x".into()));
        assert_eq!(
            agent.log()[1],
            concat!(
                "Planner Agent thinks: Received message from UI Agent: ",
                r#"{"type":"USER_INPUT","content":"x"}"#
            )
        );
    }

    #[test]
    fn test_agents_have_distinct_ids() {
        let a = Agent::new(AgentRole::Coder);
        let b = Agent::new(AgentRole::Coder);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_trace_streams_until_receiver_drops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trace = Trace::new(Some(tx));
        let mut agent = Agent::new(AgentRole::Ui);

        trace.record(agent.think("one"));
        assert_eq!(rx.try_recv().unwrap().text, "one");

        drop(rx);
        trace.record(agent.think("two"));
        let events = trace.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].to_string(), "UI Agent thinks: two");
    }
}
