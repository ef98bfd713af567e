//! Drives the state machine against a text generator and the sandbox.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::PipelineError;
use super::agent::{Agent, AgentRole, Trace, TraceEvent};
use super::machine::{AgentMessage, Effect, Outcome, PipelineState, Revision, transition};
use super::prompts;
use crate::config::PipelineConfig;
use crate::permission::PermissionSystem;
use crate::provider::TextGenerator;
use crate::registry::FunctionRegistry;
use crate::sandbox::{ConsoleLine, ExecutionResult, Sandbox, SandboxContext, SandboxError};
use crate::vfs::VirtualFs;

/// Everything a pipeline run touches, passed explicitly instead of living in
/// globals.
#[derive(Clone)]
pub struct PipelineContext {
    /// Filesystem handed to executed code
    pub fs: Arc<VirtualFs>,
    /// Permission rules handed to executed code
    pub permissions: Arc<PermissionSystem>,
    /// Function registry handed to executed code
    pub registry: Arc<FunctionRegistry>,
    /// Backend for every planner, coder, reviewer and recovery call
    pub generator: Arc<dyn TextGenerator>,
    /// Executes approved code
    pub sandbox: Arc<Sandbox>,
    /// Pipeline settings
    pub config: PipelineConfig,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("fs", &self.fs)
            .field("permissions", &self.permissions)
            .field("registry", &self.registry)
            .field("sandbox", &self.sandbox)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// A context with a fresh filesystem, the default permission rules and an
    /// empty registry.
    pub fn new(config: PipelineConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let sandbox = Arc::new(Sandbox::new(config.limits.clone()));
        Self {
            fs: Arc::new(VirtualFs::new()),
            permissions: Arc::new(PermissionSystem::with_default_rules()),
            registry: Arc::new(FunctionRegistry::new()),
            generator,
            sandbox,
            config,
        }
    }

    /// Replace the filesystem.
    pub fn with_fs(mut self, fs: Arc<VirtualFs>) -> Self {
        self.fs = fs;
        self
    }

    /// Replace the permission rules.
    pub fn with_permissions(mut self, permissions: Arc<PermissionSystem>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Replace the registry.
    pub fn with_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    fn sandbox_context(&self) -> SandboxContext {
        SandboxContext::standard(
            Arc::clone(&self.fs),
            Arc::clone(&self.permissions),
            Arc::clone(&self.registry),
        )
    }
}

/// Everything observable about one finished request.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// How the request ended
    pub outcome: Outcome,
    /// Text shown to the user
    pub output: String,
    /// Planner tasks
    pub tasks: Vec<String>,
    /// Last code the coder produced
    pub code: Option<String>,
    /// Reviews performed
    pub review_rounds: u32,
    /// Console output of the executed code
    pub console: Vec<ConsoleLine>,
    /// Every agent thought, in order
    pub trace: Vec<TraceEvent>,
}

/// The five-agent pipeline.
///
/// `run` takes `&mut self`, so one instance handles one request at a time.
#[derive(Debug)]
pub struct Pipeline {
    context: PipelineContext,
    agents: [Agent; 5],
    subscriber: Option<UnboundedSender<TraceEvent>>,
}

struct Run {
    trace: Trace,
    code: Option<String>,
    console: Vec<ConsoleLine>,
}

impl Pipeline {
    /// Create a pipeline with fresh agents.
    pub fn new(context: PipelineContext) -> Self {
        Self {
            context,
            agents: AgentRole::ALL.map(Agent::new),
            subscriber: None,
        }
    }

    /// Stream every trace event to `subscriber` as it happens.
    pub fn with_trace_subscriber(mut self, subscriber: UnboundedSender<TraceEvent>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Shared resources and settings.
    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// The agent playing `role`.
    pub fn agent(&self, role: AgentRole) -> &Agent {
        &self.agents[role as usize]
    }

    /// Take `input` through plan, code, review and execute.
    ///
    /// Runtime failures of the generated code are not errors: they end in
    /// [`Outcome::Recovered`]. Reviewer rejections past the configured limit
    /// end in [`Outcome::GaveUp`].
    ///
    /// # Errors
    ///
    /// Text generation failures and code the sandbox refuses to run (syntax,
    /// unsafe or unsupported constructs) end the request with an error.
    pub async fn run(&mut self, input: &str) -> Result<RunReport, PipelineError> {
        let mut run = Run {
            trace: Trace::new(self.subscriber.clone()),
            code: None,
            console: Vec::new(),
        };
        let mut state = PipelineState::new(self.context.config.max_review_rounds);

        self.think(&mut run, AgentRole::Ui, format!("Received user input: {input}"));
        let mut message = AgentMessage::UserInput(input.to_string());

        loop {
            if let Some((sender, recipient)) = route(&message) {
                let event = self.agents[recipient as usize].receive(sender, &message);
                run.trace.record(event);
            }

            let from = state.stage();
            let (next, effect) = transition(state, message)?;
            state = next;
            tracing::info!(from = %from, to = %state.stage(), "pipeline stage transition");

            message = match effect {
                Effect::Plan(input) => self.plan(&mut run, &input).await?,
                Effect::WriteCode { tasks, revision } => {
                    self.write_code(&mut run, &tasks, revision.as_ref()).await?
                }
                Effect::Review(code) => self.review(&mut run, code).await?,
                Effect::Execute(code) => self.execute(&mut run, code).await?,
                Effect::Recover(error) => self.recover(&mut run, error).await?,
                Effect::Finish(outcome) => {
                    let output = outcome.render();
                    self.think(&mut run, AgentRole::Ui, format!("Output: {output}"));
                    return Ok(RunReport {
                        outcome,
                        output,
                        tasks: state.tasks().to_vec(),
                        code: run.code,
                        review_rounds: state.review_rounds(),
                        console: run.console,
                        trace: run.trace.into_events(),
                    });
                }
            };
        }
    }

    fn think(&mut self, run: &mut Run, role: AgentRole, text: impl Into<String>) {
        let event = self.agents[role as usize].think(text);
        run.trace.record(event);
    }

    async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String, PipelineError> {
        let reply = self
            .context
            .generator
            .generate(prompt, Some(system_prompt))
            .await
            .inspect_err(|err| tracing::error!(error = %err, "text generation failed"))?;
        Ok(reply)
    }

    async fn plan(&mut self, run: &mut Run, input: &str) -> Result<AgentMessage, PipelineError> {
        let planner = AgentRole::Planner;
        self.think(run, planner, format!("Planning tasks for input: '{input}'"));
        let reply = self
            .generate(&prompts::plan(input), prompts::PLANNER_SYSTEM)
            .await?;
        let tasks = prompts::parse_tasks(&reply);
        self.think(run, planner, format!("Planned tasks: {}", json_list(&tasks)));
        Ok(AgentMessage::Tasks(tasks))
    }

    async fn write_code(
        &mut self,
        run: &mut Run,
        tasks: &[String],
        revision: Option<&Revision>,
    ) -> Result<AgentMessage, PipelineError> {
        let coder = AgentRole::Coder;
        match revision {
            None => {
                let text = format!("Writing code for tasks: {}", json_list(tasks));
                self.think(run, coder, text);
            }
            Some(revision) => {
                let text = format!("Revising code after review feedback: {}", revision.feedback);
                self.think(run, coder, text);
            }
        }
        let reply = self
            .generate(&prompts::write_code(tasks, revision), prompts::CODER_SYSTEM)
            .await?;
        let code = prompts::strip_code_fence(&reply);
        self.think(run, coder, format!("Generated code:\n{code}"));
        run.code = Some(code.clone());
        Ok(AgentMessage::Code(code))
    }

    async fn review(&mut self, run: &mut Run, code: String) -> Result<AgentMessage, PipelineError> {
        let reviewer = AgentRole::Reviewer;
        self.think(run, reviewer, "Reviewing code for correctness and security.");
        let reply = self
            .generate(&prompts::review(&code), prompts::REVIEWER_SYSTEM)
            .await?;
        if prompts::is_approved(&reply) {
            self.think(run, reviewer, "Code review result: Approved");
            Ok(AgentMessage::ApprovedCode(code))
        } else {
            self.think(run, reviewer, "Code review result: Needs modifications");
            tracing::warn!("reviewer rejected generated code");
            Ok(AgentMessage::ReviewFeedback {
                code,
                feedback: reply.trim().to_string(),
            })
        }
    }

    async fn execute(
        &mut self,
        run: &mut Run,
        code: String,
    ) -> Result<AgentMessage, PipelineError> {
        let executor = AgentRole::Executor;
        self.think(run, executor, format!("Executing code:\n{code}"));

        let sandbox = Arc::clone(&self.context.sandbox);
        let context = self.context.sandbox_context();
        let result = tokio::task::spawn_blocking(move || sandbox.execute(&code, &context))
            .await
            .map_err(|e| PipelineError::Internal(format!("execution task failed: {e}")))?;

        match result {
            Ok(result) => {
                let output = render_output(&result);
                self.think(
                    run,
                    executor,
                    format!("Code executed successfully. Result: {output}"),
                );
                run.console = result.console;
                Ok(AgentMessage::ExecutionSucceeded(output))
            }
            Err(err) if err.is_runtime() => {
                let message = match err {
                    SandboxError::Execution { message } => message,
                    other => other.to_string(),
                };
                self.think(run, executor, format!("Error during code execution: {message}"));
                tracing::warn!(error = %message, "generated code failed, recovering");
                Ok(AgentMessage::ExecutionFailed(message))
            }
            Err(err) => {
                self.think(run, executor, format!("Code was rejected by the sandbox: {err}"));
                Err(err.into())
            }
        }
    }

    async fn recover(
        &mut self,
        run: &mut Run,
        error: String,
    ) -> Result<AgentMessage, PipelineError> {
        let executor = AgentRole::Executor;
        self.think(run, executor, "Attempting to recover from execution error.");
        let suggestion = self
            .generate(&prompts::recover(&error), prompts::RECOVERY_SYSTEM)
            .await?;
        self.think(run, executor, format!("Error recovery suggestion: {suggestion}"));
        Ok(AgentMessage::FixSuggested { error, suggestion })
    }
}

/// Sender and recipient of messages that travel between agents. Results the
/// executor produces for itself are not routed.
fn route(message: &AgentMessage) -> Option<(AgentRole, AgentRole)> {
    use AgentMessage as M;
    match message {
        M::UserInput(_) => Some((AgentRole::Ui, AgentRole::Planner)),
        M::Tasks(_) => Some((AgentRole::Planner, AgentRole::Coder)),
        M::Code(_) => Some((AgentRole::Coder, AgentRole::Reviewer)),
        M::ApprovedCode(_) => Some((AgentRole::Reviewer, AgentRole::Executor)),
        M::ReviewFeedback { .. } => Some((AgentRole::Reviewer, AgentRole::Coder)),
        M::ExecutionSucceeded(_) | M::ExecutionFailed(_) | M::FixSuggested { .. } => None,
    }
}

fn json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

/// Console output followed by the returned value. A bare `null` is only
/// shown when nothing was printed.
fn render_output(result: &ExecutionResult) -> String {
    let mut parts = Vec::new();
    if !result.console.is_empty() {
        parts.push(result.console_text());
    }
    if !result.value.is_null() || parts.is_empty() {
        parts.push(match &result.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    parts.join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::provider::ProviderError;
    use crate::sandbox::{ConsoleLevel, ExecutionStats};

    fn result(value: Value, console: &[&str]) -> ExecutionResult {
        ExecutionResult {
            value,
            console: console
                .iter()
                .map(|text| ConsoleLine {
                    level: ConsoleLevel::Log,
                    text: text.to_string(),
                })
                .collect(),
            truncated: false,
            stats: ExecutionStats::default(),
        }
    }

    #[test]
    fn test_render_output() {
        assert_eq!(render_output(&result(json!(5), &[])), "5");
        assert_eq!(render_output(&result(json!("done"), &[])), "done");
        assert_eq!(render_output(&result(Value::Null, &[])), "null");
        assert_eq!(render_output(&result(Value::Null, &["5"])), "5");
        assert_eq!(render_output(&result(json!([1]), &["a", "b"])), "a\nb\n[1]");
    }

    #[test]
    fn test_route() {
        let feedback = AgentMessage::ReviewFeedback {
            code: String::new(),
            feedback: String::new(),
        };
        assert_eq!(route(&feedback), Some((AgentRole::Reviewer, AgentRole::Coder)));
        assert_eq!(route(&AgentMessage::ExecutionFailed("x".into())), None);
    }

    #[tokio::test]
    async fn test_agents_keep_their_logs() {
        let generator = |prompt: String, _system: Option<String>| async move {
            let reply = if prompt.starts_with("User request") {
                "compute"
            } else if prompt.starts_with("Tasks:") {
                "return 1 + 1;"
            } else {
                "APPROVED"
            };
            Ok::<_, ProviderError>(reply.to_string())
        };
        let context = PipelineContext::new(PipelineConfig::default(), Arc::new(generator));
        let mut pipeline = Pipeline::new(context);
        let report = pipeline.run("two").await.unwrap();

        assert_eq!(report.output, "2");
        let ui = pipeline.agent(AgentRole::Ui);
        assert_eq!(ui.log().first().unwrap(), "UI Agent thinks: Received user input: two");
        assert_eq!(ui.log().last().unwrap(), "UI Agent thinks: Output: 2");
        let executor = pipeline.agent(AgentRole::Executor);
        assert!(executor.log().iter().any(|line| line.contains("Result: 2")));

        let total: usize = AgentRole::ALL
            .iter()
            .map(|role| pipeline.agent(*role).log().len())
            .sum();
        assert_eq!(total, report.trace.len());
    }
}
