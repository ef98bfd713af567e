//! Warden CLI
//!
//! Usage:
//!   warden run "add 2 and 3" [--trace]    Drive a request through the pipeline
//!   warden exec -c "return 1 + 1"          Execute a code string in the sandbox
//!   warden exec script.js                  Execute a script file
//!   warden exec                            Read the script from stdin
//!   warden functions list                  List registered functions
//!   warden functions call add 2 3          Call a registered function
//!   warden functions generate sq "square a number" 7
//!                                          Generate, save and call a function

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use warden::registry::{builtin_packs, generate_function, load_packs, save_script_function};
use warden::{
    FunctionRegistry, OfflineGenerator, OpenAiGenerator, Outcome, PermissionSystem, Pipeline,
    PipelineConfig, PipelineContext, Sandbox, SandboxContext, TextGenerator, VirtualFs,
};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Plan, review and run generated code in a sandbox")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a natural-language request through the agent pipeline
    Run {
        /// What to do
        request: String,
        /// Print every agent thought to stderr as it happens
        #[arg(long)]
        trace: bool,
    },
    /// Execute JavaScript in the sandbox against a fresh filesystem
    Exec {
        /// Code to execute
        #[arg(short = 'c', long = "code", conflicts_with = "file")]
        code: Option<String>,
        /// Script file to execute (stdin when neither is given)
        file: Option<PathBuf>,
    },
    /// Inspect and call the function registry
    Functions {
        #[command(subcommand)]
        command: FunctionsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum FunctionsCommand {
    /// List every function with its description
    List,
    /// Call a function; each argument is parsed as JSON, falling back to a string
    Call {
        /// Function name
        name: String,
        /// Arguments
        args: Vec<String>,
    },
    /// Ask the text generator for a function, save it and optionally call it
    Generate {
        /// Name to register the function under
        name: String,
        /// What the function should do
        description: String,
        /// Arguments for an immediate call, parsed like `call`
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results only
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Command::Run { request, trace } => run(config, &request, trace).await,
        Command::Exec { code, file } => exec(config, code, file).await,
        Command::Functions { command } => functions(config, command).await,
    }
}

fn registry() -> anyhow::Result<FunctionRegistry> {
    let registry = FunctionRegistry::new();
    load_packs(&registry, &builtin_packs()).context("failed to load built-in packs")?;
    Ok(registry)
}

fn generator(config: &PipelineConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    Ok(match config.provider.api_key() {
        Some(key) => Arc::new(OpenAiGenerator::new(config.provider.clone(), key)?),
        None => {
            tracing::warn!(
                "${} is not set; using the offline generator",
                config.provider.api_key_env
            );
            Arc::new(OfflineGenerator)
        }
    })
}

fn json_args(args: Vec<String>) -> Vec<Value> {
    args.into_iter()
        .map(|arg| serde_json::from_str(&arg).unwrap_or(Value::String(arg)))
        .collect()
}

async fn run(config: PipelineConfig, request: &str, trace: bool) -> anyhow::Result<()> {
    let generator = generator(&config)?;
    let context = PipelineContext::new(config, generator).with_registry(Arc::new(registry()?));
    let mut pipeline = Pipeline::new(context);

    let printer = if trace {
        let (tx, mut rx) = mpsc::unbounded_channel();
        pipeline = pipeline.with_trace_subscriber(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                eprintln!("{event}");
            }
        }))
    } else {
        None
    };

    let result = pipeline.run(request).await;
    // Closes the trace channel so the printer drains and exits
    drop(pipeline);
    if let Some(printer) = printer {
        printer.await.ok();
    }

    let report = result?;
    println!("{}", report.output);
    match report.outcome {
        Outcome::Succeeded { .. } => Ok(()),
        Outcome::Recovered { .. } | Outcome::GaveUp { .. } => std::process::exit(1),
    }
}

async fn exec(
    config: PipelineConfig,
    code: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let code = match (code, file) {
        (Some(code), _) => code,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => {
            let mut code = String::new();
            io::stdin()
                .read_to_string(&mut code)
                .context("failed to read stdin")?;
            code
        }
    };

    let context = SandboxContext::standard(
        Arc::new(VirtualFs::new()),
        Arc::new(PermissionSystem::with_default_rules()),
        Arc::new(registry()?),
    );
    let sandbox = Sandbox::new(config.limits);
    let result = tokio::task::spawn_blocking(move || sandbox.execute(&code, &context)).await??;

    for line in &result.console {
        println!("{line}");
    }
    if result.truncated {
        eprintln!("warden: console output truncated");
    }
    println!("{}", serde_json::to_string_pretty(&result.value)?);
    tracing::debug!(
        operations = result.stats.operations,
        wall_time_ms = result.stats.wall_time_ms,
        "execution finished"
    );
    Ok(())
}

async fn functions(config: PipelineConfig, command: FunctionsCommand) -> anyhow::Result<()> {
    let registry = registry()?;
    match command {
        FunctionsCommand::List => {
            for (name, description) in registry.docs() {
                println!("{name:<16} {description}");
            }
        }
        FunctionsCommand::Call { name, args } => {
            let value = registry.execute(&name, &json_args(args))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        FunctionsCommand::Generate {
            name,
            description,
            args,
        } => {
            let generator = generator(&config)?;
            let code = generate_function(generator.as_ref(), &description).await?;
            println!("{code}");

            let sandbox = Arc::new(Sandbox::new(config.limits));
            let args = json_args(args);
            let value = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Value>> {
                save_script_function(&registry, sandbox, &name, &code)
                    .with_context(|| format!("failed to save \"{name}\""))?;
                tracing::info!(%name, "saved generated function");
                if args.is_empty() {
                    return Ok(None);
                }
                Ok(Some(registry.execute(&name, &args)?))
            })
            .await??;
            if let Some(value) = value {
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        }
    }
    Ok(())
}
