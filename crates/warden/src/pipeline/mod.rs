//! The five-agent pipeline: UI, Planner, Coder, Reviewer and Executor.
//!
//! A request moves through a fixed sequence of stages:
//!
//! ```text
//! Idle -> Planning -> Coding -> Reviewing -> Executing -> Done
//!                       ^           |            |
//!                       +-rejected--+            +-failed-> Recovering -> Done
//! ```
//!
//! [`transition`] is the pure part: it maps a stage and a message to the next
//! stage and the one [`Effect`] to perform. [`Pipeline`] performs effects
//! (text generation, sandboxed execution) and feeds their results back in.
//! Rejections loop back to the coder until `max_review_rounds` reviews have
//! happened, then the request ends in [`Outcome::GaveUp`].

mod agent;
mod machine;
pub(crate) mod prompts;
mod runner;

use thiserror::Error;

pub use agent::{Agent, AgentRole, TraceEvent};
pub use machine::{AgentMessage, Effect, Outcome, PipelineState, Revision, Stage, transition};
pub use runner::{Pipeline, PipelineContext, RunReport};

use crate::provider::ProviderError;
use crate::sandbox::SandboxError;

/// Errors that end a request without an [`Outcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Text generation failed
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The sandbox refused the generated code before running it
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    /// A message arrived in a stage that does not accept it
    #[error("message {message} is not valid in stage {stage}")]
    InvalidTransition {
        /// Stage at the time
        stage: Stage,
        /// Kind of the rejected message
        message: &'static str,
    },
    /// The execution task could not be joined
    #[error("internal error: {0}")]
    Internal(String),
}
