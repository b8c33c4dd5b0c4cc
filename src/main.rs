use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rexec::config::RemoteExecutionConfig;
use rexec::constants::EVENT_BROADCAST_CAPACITY;
use rexec::events::console::console_lines;
use rexec::events::{BroadcastListener, EventBus, PipelineState, RemoteExecutionEvent};
use rexec::protocol::{InputFile, Protocol};
use rexec::remote_exec::{
    create_strategy, BuildAction, BuildOutcome, LocalCommandBuilder, LocalWorker,
    RemoteExecutionClients, RemoteExecutionStrategy,
};
use rexec::sandbox::LocalSandbox;
use rexec::storage::InMemoryCas;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "rexec")]
#[command(about = "Run build actions through a staged remote execution pipeline")]
struct Cli {
    /// JSON config file; REXEC_* variables override it
    #[arg(long, env = "REXEC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build one action remotely against the in-process CAS and worker
    Run(RunArgs),
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Rule label used in events and logs
    #[arg(long, default_value = "//cli:run")]
    target: String,

    /// Input file or directory, relative to --input-root
    #[arg(short, long = "input")]
    inputs: Vec<PathBuf>,

    #[arg(long, default_value = ".")]
    input_root: PathBuf,

    /// Declared output path, relative to --output-root
    #[arg(short, long = "output")]
    outputs: Vec<PathBuf>,

    #[arg(long, default_value = "rexec-out")]
    output_root: PathBuf,

    /// Environment variable for the action, as NAME=VALUE
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Print the detailed [RE] stats block
    #[arg(long)]
    verbose_stats: bool,

    /// Command line to execute
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {}", raw))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = rexec::logging::init_logging(cli.json_logs) {
        eprintln!("⚠️ Failed to initialize logging: {}", e);
    }

    let config = RemoteExecutionConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.threads)
                .thread_name("rexec-worker")
                .enable_all()
                .build()
                .context("Failed to build runtime")?;
            runtime.block_on(run(config, args))
        }
    }
}

fn collect_inputs(protocol: &Protocol, args: &RunArgs) -> Result<BuildAction> {
    let mut action = BuildAction::new(&args.target, args.command.iter().cloned());
    for (name, value) in &args.env {
        action = action.with_env(name, value);
    }
    for output in &args.outputs {
        action = action.with_output(output);
    }

    for input in &args.inputs {
        let full = args.input_root.join(input);
        if full.is_dir() {
            for entry in WalkDir::new(&full).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() {
                    let relative = entry.path().strip_prefix(&args.input_root)?;
                    action = action.with_input(relative, InputFile::from_local_file(protocol, entry.path())?)?;
                }
            }
        } else {
            let file = InputFile::from_local_file(protocol, &full)
                .with_context(|| format!("Failed to read input {}", full.display()))?;
            action = action.with_input(input, file)?;
        }
    }
    Ok(action)
}

async fn run(config: RemoteExecutionConfig, args: RunArgs) -> Result<()> {
    let protocol = Protocol::new(config.hash_function);
    let action = collect_inputs(&protocol, &args)?;
    let output_root = absolute(&args.output_root)?;

    let cas = Arc::new(InMemoryCas::new(protocol));
    let sandbox = Arc::new(LocalSandbox::new(None));
    let worker = Arc::new(LocalWorker::new("local-worker-1", cas.clone(), sandbox.clone()));
    let clients = RemoteExecutionClients::new(protocol, cas.clone(), worker);

    let (tx, rx) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
    let bus = EventBus::new().with_listener(Arc::new(BroadcastListener::new(tx)));
    let remote = RemoteExecutionStrategy::new(
        &config,
        clients,
        &output_root,
        bus,
        tokio::runtime::Handle::current(),
    );
    let stats = remote.stats().clone();
    let local = Arc::new(LocalCommandBuilder::new(sandbox, &output_root, protocol));
    let strategy = create_strategy(&config, remote, local);
    let printer = tokio::spawn(print_events(rx));

    println!("🚀 Building {} ({} inputs, {} outputs)", action.target, action.inputs.file_count(), action.outputs.len());
    let handle = strategy.build(Arc::new(action));
    let guard = handle.guard().clone();
    let result = handle.build_result();
    tokio::pin!(result);

    let result = tokio::select! {
        result = &mut result => result,
        _ = tokio::signal::ctrl_c() => {
            if guard.cancel("interrupted by user") {
                println!("🛑 Cancelled before dispatch");
            } else {
                println!("⏳ Action already dispatched; waiting for it to finish");
            }
            result.await
        }
    };

    drop(strategy);
    printer.await.ok();

    for line in console_lines(&stats.snapshot(), Some(&format!("in-process CAS ({} blobs)", cas.len())), args.verbose_stats) {
        println!("{}", line);
    }

    match result?.outcome {
        BuildOutcome::Built { artifacts, executed_by } => {
            println!("✅ Built by {:?} executor:", executed_by);
            for artifact in artifacts {
                println!("   📦 {}", output_root.join(artifact).display());
            }
            Ok(())
        }
        BuildOutcome::Cancelled { reason } => anyhow::bail!("build cancelled: {}", reason),
    }
}

async fn print_events(mut rx: broadcast::Receiver<RemoteExecutionEvent>) {
    loop {
        match rx.recv().await {
            Ok(RemoteExecutionEvent::Terminal { state, target, .. }) => {
                let icon = match state {
                    PipelineState::ActionSucceeded => "✅",
                    PipelineState::ActionFailed => "❌",
                    _ => "🛑",
                };
                println!("{} [RE] {} {}", icon, target, state.short_name());
            }
            Ok(RemoteExecutionEvent::LocalFallback { target, remote, local }) => {
                println!("🔁 [LocalFallback] {} remote={:?} local={:?}", target, remote, local);
            }
            Ok(RemoteExecutionEvent::Started { state, target, .. }) => {
                tracing::debug!(rule = %target, state = state.short_name(), "stage started");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
