//! End-to-end tests for the agent pipeline with scripted text generators.
//!
//! These tests verify:
//! - Plan, code, review and execute for an approved request
//! - One return to the coder per review rejection, and the review cap
//! - Recovery after a runtime failure
//! - Syntax, unsafe code and provider failures ending the request

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use warden::pipeline::{AgentRole, Outcome, PipelineError};
use warden::{
    Pipeline, PipelineConfig, PipelineContext, ProviderError, ResourceLimits, SandboxError,
    TextGenerator,
};

const PLAN: &str = "1. Add 2 and 3\n\n2. Return the sum\n";
const SUGGESTION: &str = "Call checkPermission before writing.";

/// One recorded generator call.
#[derive(Debug, Clone)]
struct Call {
    prompt: String,
    system: Option<String>,
}

/// Replies by stage. Code and review replies are consumed in order; the last
/// one repeats once the queue is down to a single entry.
struct Script {
    code: VecDeque<String>,
    reviews: VecDeque<String>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Script {
    fn new(code: &[&str], reviews: &[&str]) -> Self {
        Self {
            code: code.iter().map(|s| s.to_string()).collect(),
            reviews: reviews.iter().map(|s| s.to_string()).collect(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn next(queue: &mut VecDeque<String>) -> String {
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or_default()
        }
    }

    /// Turn the script into a generator plus a handle on the recorded calls.
    fn into_generator(self) -> (Arc<dyn TextGenerator>, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::clone(&self.calls);
        let state = Mutex::new(self);
        let generator = move |prompt: String, system: Option<String>| {
            let mut script = state.lock().unwrap();
            script.calls.lock().unwrap().push(Call {
                prompt: prompt.clone(),
                system,
            });
            let reply = if prompt.starts_with("User request:") {
                PLAN.to_string()
            } else if prompt.starts_with("Tasks:") {
                Script::next(&mut script.code)
            } else if prompt.starts_with("Review the following code:") {
                Script::next(&mut script.reviews)
            } else {
                SUGGESTION.to_string()
            };
            async move { Ok::<_, ProviderError>(reply) }
        };
        let generator: Arc<dyn TextGenerator> = Arc::new(generator);
        (generator, calls)
    }
}

fn pipeline(generator: Arc<dyn TextGenerator>, max_review_rounds: u32) -> Pipeline {
    let config = PipelineConfig {
        max_review_rounds,
        ..PipelineConfig::default()
    };
    Pipeline::new(PipelineContext::new(config, generator))
}

fn prompts_starting_with(calls: &Mutex<Vec<Call>>, prefix: &str) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| call.prompt.starts_with(prefix))
        .map(|call| call.prompt.clone())
        .collect()
}

// =============================================================================
// Approved requests
// =============================================================================

mod approved {
    use super::*;

    #[tokio::test]
    async fn test_add_2_and_3() {
        let script = Script::new(&["```js\nreturn 2 + 3;\n```"], &["APPROVED"]);
        let (generator, calls) = script.into_generator();
        let mut pipeline = pipeline(generator, 3);

        let report = pipeline.run("add 2 and 3").await.expect("run");

        assert_eq!(
            report.outcome,
            Outcome::Succeeded {
                output: "5".to_string()
            }
        );
        assert_eq!(report.output, "5");
        assert_eq!(report.tasks, ["1. Add 2 and 3", "2. Return the sum"]);
        assert_eq!(report.code.as_deref(), Some("return 2 + 3;"));
        assert_eq!(report.review_rounds, 1);

        // planner, coder, reviewer; no recovery
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[0].prompt,
            "User request: add 2 and 3\n\nBreak this request down into a list of specific tasks:"
        );
        assert!(calls[0].system.as_deref().unwrap().starts_with("You are a task planner."));
        assert!(calls[1].prompt.contains("1. Add 2 and 3\n2. Return the sum"));
        assert!(calls[2].prompt.contains("\n\nreturn 2 + 3;\n\n"));

        let executor = pipeline.agent(AgentRole::Executor);
        let success = "Executor Agent thinks: Code executed successfully. Result: 5";
        assert!(executor.log().iter().any(|line| line == success));
    }

    #[tokio::test]
    async fn test_generated_code_works_on_shared_filesystem() {
        let code = r#"
            const path = '/home/project/sum.txt';
            if (!permissionSystem.checkPermission(path, 'write')) {
              throw new Error('PermissionDenied: ' + path);
            }
            fileSystem.writeFile(path, String(2 + 3));
            console.log('wrote', path);
            return fileSystem.readFile(path);
        "#;
        let (generator, _) = Script::new(&[code], &["approved"]).into_generator();
        let mut pipeline = pipeline(generator, 3);

        let report = pipeline.run("store the sum of 2 and 3").await.expect("run");

        assert_eq!(report.output, "wrote /home/project/sum.txt\n5");
        assert_eq!(report.console.len(), 1);
        let fs = &pipeline.context().fs;
        assert_eq!(fs.read_file("/home/project/sum.txt").unwrap(), "5");
    }

    #[tokio::test]
    async fn test_trace_is_streamed() {
        let (generator, _) = Script::new(&["return 1;"], &["APPROVED"]).into_generator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = pipeline(generator, 3).with_trace_subscriber(tx);

        let report = pipeline.run("one").await.expect("run");
        drop(pipeline);

        let mut streamed = Vec::new();
        while let Some(event) = rx.recv().await {
            streamed.push(event);
        }
        assert_eq!(streamed, report.trace);
        assert_eq!(streamed.first().unwrap().agent, AgentRole::Ui);
        assert_eq!(streamed.last().unwrap().text, "Output: 1");
    }
}

// =============================================================================
// Review loop
// =============================================================================

mod review_loop {
    use super::*;

    #[tokio::test]
    async fn test_each_rejection_returns_to_coder_once() {
        let script = Script::new(
            &["return 2 + 2;", "return 2 - 3;", "return 2 + 3;"],
            &["Wrong operands.", "Wrong operator.", "APPROVED"],
        );
        let (generator, calls) = script.into_generator();
        let mut pipeline = pipeline(generator, 3);

        let report = pipeline.run("add 2 and 3").await.expect("run");

        assert_eq!(report.output, "5");
        assert_eq!(report.review_rounds, 3);

        let coder_prompts = prompts_starting_with(&calls, "Tasks:");
        assert_eq!(coder_prompts.len(), 3);
        assert!(!coder_prompts[0].contains("Review feedback"));
        assert!(coder_prompts[1].contains("Previous code:\nreturn 2 + 2;"));
        assert!(coder_prompts[1].contains("Review feedback:\nWrong operands."));
        assert!(coder_prompts[2].contains("Review feedback:\nWrong operator."));

        let coder = pipeline.agent(AgentRole::Coder);
        let feedback_received = coder
            .log()
            .iter()
            .filter(|line| line.contains("Received message from Reviewer Agent"))
            .filter(|line| line.contains("REVIEW_FEEDBACK"))
            .count();
        assert_eq!(feedback_received, 2);
    }

    #[tokio::test]
    async fn test_always_rejecting_reviewer_gives_up() {
        let script = Script::new(&["return 1;"], &["This will never do."]);
        let (generator, calls) = script.into_generator();
        let mut pipeline = pipeline(generator, 4);

        let report = pipeline.run("anything").await.expect("run");

        assert_eq!(
            report.outcome,
            Outcome::GaveUp {
                rounds: 4,
                last_feedback: "This will never do.".to_string()
            }
        );
        assert_eq!(report.review_rounds, 4);
        assert_eq!(prompts_starting_with(&calls, "Tasks:").len(), 4);
        assert_eq!(prompts_starting_with(&calls, "Review the following").len(), 4);
        assert!(report.console.is_empty());
    }
}

// =============================================================================
// Failures
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_runtime_failure_is_recovered() {
        let code = r#"
            const path = '/etc/hosts';
            if (!permissionSystem.checkPermission(path, 'write')) {
              throw new Error('PermissionDenied: ' + path);
            }
            return fileSystem.writeFile(path, '127.0.0.1');
        "#;
        let (generator, calls) = Script::new(&[code], &["APPROVED"]).into_generator();
        let mut pipeline = pipeline(generator, 3);

        let report = pipeline.run("edit hosts").await.expect("run");

        assert_eq!(
            report.outcome,
            Outcome::Recovered {
                error: "PermissionDenied: /etc/hosts".to_string(),
                suggestion: SUGGESTION.to_string(),
            }
        );
        assert_eq!(
            report.output,
            format!(
                "Execution failed. Error: PermissionDenied: /etc/hosts\n\nSuggested fix: {}",
                SUGGESTION
            )
        );

        let recovery = prompts_starting_with(&calls, "The following code resulted in an error:");
        assert_eq!(recovery.len(), 1);
        assert!(recovery[0].contains("PermissionDenied: /etc/hosts"));
        assert!(!pipeline.context().fs.exists("/etc"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_recovered() {
        let (generator, _) = Script::new(&["while (true) {}"], &["APPROVED"]).into_generator();
        let config = PipelineConfig {
            limits: ResourceLimits {
                max_operations: 5_000,
                ..ResourceLimits::default()
            },
            ..PipelineConfig::default()
        };
        let mut pipeline = Pipeline::new(PipelineContext::new(config, generator));

        let report = pipeline.run("spin").await.expect("run");
        assert!(matches!(report.outcome, Outcome::Recovered { .. }), "{report:?}");
    }

    #[tokio::test]
    async fn test_syntax_error_is_terminal() {
        let (generator, calls) = Script::new(&["return (1 + ;"], &["APPROVED"]).into_generator();
        let mut pipeline = pipeline(generator, 3);

        let err = pipeline.run("broken").await.unwrap_err();
        assert!(matches!(err, PipelineError::Sandbox(SandboxError::Syntax { .. })), "{err:?}");
        assert!(prompts_starting_with(&calls, "The following code").is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_code_is_terminal() {
        let code = "fileSystem.writeFile('/tmp/x', 'y'); eval('1');";
        let script = Script::new(&[code], &["APPROVED"]);
        let (generator, calls) = script.into_generator();
        let mut pipeline = pipeline(generator, 3);

        let err = pipeline.run("sneaky").await.unwrap_err();
        assert!(matches!(err, PipelineError::Sandbox(SandboxError::Unsafe { .. })), "{err:?}");
        assert!(prompts_starting_with(&calls, "The following code").is_empty());
        assert!(!pipeline.context().fs.exists("/tmp/x"));
    }

    #[tokio::test]
    async fn test_provider_failure_is_terminal() {
        let generator = |_prompt: String, _system: Option<String>| async move {
            Err::<String, _>(ProviderError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        };
        let mut pipeline = pipeline(Arc::new(generator), 3);

        let err = pipeline.run("anything").await.unwrap_err();
        assert!(
            matches!(err, PipelineError::Provider(ProviderError::Status { status: 503, .. })),
            "{err:?}"
        );
        assert_eq!(err.to_string(), "provider returned HTTP 503: overloaded");

        // Planner got as far as asking
        let planner = pipeline.agent(AgentRole::Planner);
        assert_eq!(
            planner.log().last().unwrap(),
            "Planner Agent thinks: Planning tasks for input: 'anything'"
        );
    }
}
