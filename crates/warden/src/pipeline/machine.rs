//! The pipeline as a pure state machine.
//!
//! [`transition`] never performs I/O. It consumes one [`AgentMessage`] and
//! names the single [`Effect`] the driver has to carry out next; the result
//! of that effect comes back in as the next message.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::PipelineError;

/// Where a request currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Waiting for user input
    Idle,
    /// Planner is splitting the request into tasks
    Planning,
    /// Coder is writing (or rewriting) code
    Coding,
    /// Reviewer is judging the code
    Reviewing,
    /// Executor is running approved code in the sandbox
    Executing,
    /// Executor is asking for a fix after a runtime failure
    Recovering,
    /// Finished; no further messages are accepted
    Done,
}

impl Stage {
    /// Lowercase stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Reviewing => "reviewing",
            Self::Executing => "executing",
            Self::Recovering => "recovering",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed envelope passed between agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessage {
    /// Request text from the user
    UserInput(String),
    /// Planner output
    Tasks(Vec<String>),
    /// Coder output awaiting review
    Code(String),
    /// Code the reviewer accepted
    ApprovedCode(String),
    /// Reviewer rejection, routed back to the coder
    ReviewFeedback {
        /// The rejected code
        code: String,
        /// What the reviewer said
        feedback: String,
    },
    /// Sandbox run finished; carries the rendered result
    ExecutionSucceeded(String),
    /// Sandbox run failed at runtime
    ExecutionFailed(String),
    /// Recovery suggestion for a failed run
    FixSuggested {
        /// The runtime error
        error: String,
        /// Suggested fix
        suggestion: String,
    },
}

impl AgentMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserInput(_) => "USER_INPUT",
            Self::Tasks(_) => "TASKS",
            Self::Code(_) => "CODE",
            Self::ApprovedCode(_) => "APPROVED_CODE",
            Self::ReviewFeedback { .. } => "REVIEW_FEEDBACK",
            Self::ExecutionSucceeded(_) => "EXECUTION_SUCCEEDED",
            Self::ExecutionFailed(_) => "EXECUTION_FAILED",
            Self::FixSuggested { .. } => "FIX_SUGGESTED",
        }
    }
}

/// A rejected attempt the coder should improve on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Code that was rejected
    pub code: String,
    /// Reviewer's explanation
    pub feedback: String,
}

/// The one action the driver performs before the next transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Ask the planner for tasks
    Plan(String),
    /// Ask the coder for code
    WriteCode {
        /// Planned tasks
        tasks: Vec<String>,
        /// Previous rejected attempt, if any
        revision: Option<Revision>,
    },
    /// Ask the reviewer to judge code
    Review(String),
    /// Run approved code in the sandbox
    Execute(String),
    /// Ask for a fix suggestion for a runtime error
    Recover(String),
    /// Stop with a final outcome
    Finish(Outcome),
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The code ran
    Succeeded {
        /// Rendered execution result
        output: String,
    },
    /// The code failed at runtime and a fix was suggested
    Recovered {
        /// The runtime error
        error: String,
        /// Suggested fix
        suggestion: String,
    },
    /// The reviewer rejected every attempt
    GaveUp {
        /// Number of reviews performed
        rounds: u32,
        /// Feedback from the last rejection
        last_feedback: String,
    },
}

impl Outcome {
    /// Text shown to the user.
    pub fn render(&self) -> String {
        match self {
            Self::Succeeded { output } => output.clone(),
            Self::Recovered { error, suggestion } => {
                format!("Execution failed. Error: {error}\n\nSuggested fix: {suggestion}")
            }
            Self::GaveUp {
                rounds,
                last_feedback,
            } => format!(
                "Code was rejected in {rounds} review round(s); giving up.\n\n\
                 Last review: {last_feedback}"
            ),
        }
    }
}

/// State carried between transitions of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    stage: Stage,
    tasks: Vec<String>,
    review_rounds: u32,
    max_review_rounds: u32,
}

impl PipelineState {
    /// Fresh state. At least one review is always allowed.
    pub fn new(max_review_rounds: u32) -> Self {
        Self {
            stage: Stage::Idle,
            tasks: Vec::new(),
            review_rounds: 0,
            max_review_rounds: max_review_rounds.max(1),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Tasks produced by the planner.
    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Reviews completed so far.
    pub fn review_rounds(&self) -> u32 {
        self.review_rounds
    }

    fn at(self, stage: Stage) -> Self {
        Self { stage, ..self }
    }
}

/// Apply `message` to `state`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidTransition`] when the message is not
/// accepted in the current stage.
pub fn transition(
    state: PipelineState,
    message: AgentMessage,
) -> Result<(PipelineState, Effect), PipelineError> {
    use AgentMessage as M;

    let next = match (state.stage, message) {
        (Stage::Idle, M::UserInput(input)) => (state.at(Stage::Planning), Effect::Plan(input)),
        (Stage::Planning, M::Tasks(tasks)) => {
            let state = PipelineState {
                tasks: tasks.clone(),
                ..state.at(Stage::Coding)
            };
            (state, Effect::WriteCode { tasks, revision: None })
        }
        (Stage::Coding, M::Code(code)) => (state.at(Stage::Reviewing), Effect::Review(code)),
        (Stage::Reviewing, M::ApprovedCode(code)) => {
            let rounds = state.review_rounds + 1;
            let state = PipelineState {
                review_rounds: rounds,
                ..state.at(Stage::Executing)
            };
            (state, Effect::Execute(code))
        }
        (Stage::Reviewing, M::ReviewFeedback { code, feedback }) => {
            let rounds = state.review_rounds + 1;
            if rounds >= state.max_review_rounds {
                let outcome = Outcome::GaveUp {
                    rounds,
                    last_feedback: feedback,
                };
                let state = PipelineState {
                    review_rounds: rounds,
                    ..state.at(Stage::Done)
                };
                (state, Effect::Finish(outcome))
            } else {
                let tasks = state.tasks.clone();
                let state = PipelineState {
                    review_rounds: rounds,
                    ..state.at(Stage::Coding)
                };
                let revision = Some(Revision { code, feedback });
                (state, Effect::WriteCode { tasks, revision })
            }
        }
        (Stage::Executing, M::ExecutionSucceeded(output)) => (
            state.at(Stage::Done),
            Effect::Finish(Outcome::Succeeded { output }),
        ),
        (Stage::Executing, M::ExecutionFailed(error)) => {
            (state.at(Stage::Recovering), Effect::Recover(error))
        }
        (Stage::Recovering, M::FixSuggested { error, suggestion }) => (
            state.at(Stage::Done),
            Effect::Finish(Outcome::Recovered { error, suggestion }),
        ),
        (stage, message) => {
            return Err(PipelineError::InvalidTransition {
                stage,
                message: message.kind(),
            });
        }
    };
    Ok(next)
}
