//! Pausable CLI - drive interpreter instances from the command line
//!
//! Runs instances against a demo executor that logs every remote call, and
//! accepts `resume <json>`, `status`, and `cancel` on stdin while they run.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pausable::runtime::journal::Journal;
use pausable::runtime::storage::{self, Storage};
use pausable::runtime::{
    BlockId, BlockResult, ErrorSummary, InstanceHandle, InstanceId, RunParameters, RuntimeConfig,
    StepError, StepExecutor, Worker, WorkflowDefinition,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "pausable")]
#[command(about = "Durable, pausable step interpreter", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".pausable")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new runtime root
    Init {
        /// Pause budget in seconds
        #[arg(long, default_value = "1296000")]
        pause_timeout: u64,

        /// Keep journals in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Start an instance and drive it interactively
    Run {
        /// Instance id (random if omitted)
        #[arg(long)]
        instance_id: Option<String>,

        /// Blocks to execute, in order
        #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
        blocks: Vec<u64>,

        /// Blocks that pause the run
        #[arg(long, value_delimiter = ',', default_value = "2")]
        pauses: Vec<u64>,

        /// Simulated latency of each remote call, in milliseconds
        #[arg(long, default_value = "200")]
        latency: u64,

        /// JSON input passed to the run
        #[arg(long)]
        input: Option<String>,
    },

    /// Continue every unfinished instance found in the journal directory
    Recover {
        /// Simulated latency of each remote call, in milliseconds
        #[arg(long, default_value = "200")]
        latency: u64,
    },

    /// Print the journal of an instance
    Inspect {
        /// Instance id
        instance_id: String,
    },
}

/// Executor that simulates remote calls and logs them
struct DemoExecutor {
    definition: WorkflowDefinition,
    latency: Duration,
}

#[async_trait]
impl StepExecutor for DemoExecutor {
    async fn fetch_definition(&self, instance_id: &InstanceId) -> Result<WorkflowDefinition, StepError> {
        tokio::time::sleep(self.latency).await;
        tracing::info!(%instance_id, blocks = ?self.definition.blocks, pauses = ?self.definition.pauses, "definition fetched");
        Ok(self
            .definition
            .clone()
            .with_document(json!({ "id": instance_id.as_str() })))
    }

    async fn execute_block(&self, instance_id: &InstanceId, block: BlockId) -> Result<BlockResult, StepError> {
        tokio::time::sleep(self.latency).await;
        tracing::info!(%instance_id, %block, "block executed");
        Ok(json!({ "block": block.0, "at": Utc::now() }))
    }

    async fn notify_started(&self, instance_id: &InstanceId, at: DateTime<Utc>) -> Result<(), StepError> {
        tracing::info!(%instance_id, %at, "execution started");
        Ok(())
    }

    async fn notify_paused(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
        payload: Option<&Value>,
    ) -> Result<(), StepError> {
        tracing::info!(%instance_id, %at, ?payload, "execution paused");
        Ok(())
    }

    async fn notify_resumed(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
        payload: Option<&Value>,
    ) -> Result<(), StepError> {
        tracing::info!(%instance_id, %at, ?payload, "execution resumed");
        Ok(())
    }

    async fn notify_ended(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
        result: Option<&Value>,
        error: Option<&ErrorSummary>,
    ) -> Result<(), StepError> {
        match error {
            Some(error) => tracing::info!(%instance_id, %at, %error, "execution ended"),
            None => tracing::info!(%instance_id, %at, ?result, "execution ended"),
        }
        Ok(())
    }
}

fn load_config(root: PathBuf) -> RuntimeConfig {
    match storage::load_config(&root) {
        Ok(config) => config,
        Err(e) => {
            tracing::debug!(error = %e, "no stored configuration, using defaults");
            RuntimeConfig {
                root,
                ..RuntimeConfig::default()
            }
        }
    }
}

/// Read control commands from stdin until every handle has finished
async fn drive(handles: Vec<InstanceHandle>) -> anyhow::Result<()> {
    if handles.is_empty() {
        println!("Nothing to run");
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let finished = futures::future::join_all(handles.iter().map(|h| h.result()));
    tokio::pin!(finished);

    println!("Commands: resume <json> | status | cancel");
    loop {
        tokio::select! {
            outcomes = &mut finished => {
                for (handle, outcome) in handles.iter().zip(outcomes) {
                    let outcome = outcome?;
                    println!("{}: {}", handle.instance_id(), serde_json::to_string_pretty(&outcome)?);
                }
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // stdin closed; keep waiting for the instances
                    let outcomes = (&mut finished).await;
                    for (handle, outcome) in handles.iter().zip(outcomes) {
                        println!("{}: {:?}", handle.instance_id(), outcome?.status());
                    }
                    return Ok(());
                };
                handle_command(&handles, line.trim()).await;
            }
        }
    }
}

async fn handle_command(handles: &[InstanceHandle], line: &str) {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    for handle in handles {
        match command {
            "resume" => {
                let payload = match serde_json::from_str::<Value>(rest.trim()) {
                    Ok(payload) => Some(payload),
                    Err(_) if rest.trim().is_empty() => None,
                    Err(e) => {
                        println!("invalid JSON payload: {e}");
                        return;
                    }
                };
                match handle.resume(payload).await {
                    Ok(ack) => println!("{}: {}", handle.instance_id(), ack.message),
                    Err(e) => println!("{e}"),
                }
            }
            "status" => println!(
                "{}: {} (paused: {})",
                handle.instance_id(),
                handle.status(),
                handle.is_paused()
            ),
            "cancel" => handle.cancel(),
            "" => {}
            other => {
                println!("unknown command: {other}");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.root.clone());
    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    match cli.command {
        Commands::Init {
            pause_timeout,
            ephemeral,
        } => {
            let root = cli.root.clone();
            let config = RuntimeConfig {
                root: cli.root,
                durable: !ephemeral,
                pause_timeout: Duration::from_secs(pause_timeout),
                ..RuntimeConfig::default()
            };

            Worker::init(config)?;
            println!("Initialized pausable runtime at {:?}", root);
        }

        Commands::Run {
            instance_id,
            blocks,
            pauses,
            latency,
            input,
        } => {
            let input = input
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--input is not valid JSON")?;
            let executor = Arc::new(DemoExecutor {
                definition: WorkflowDefinition::new(blocks, pauses),
                latency: Duration::from_millis(latency),
            });

            let worker = Worker::new(config, executor)?;
            let instance_id = instance_id.map(InstanceId::new).unwrap_or_else(InstanceId::random);
            let mut params = RunParameters::new(instance_id.clone());
            if let Some(input) = input {
                params = params.with_input(input);
            }

            let handle = worker.start(params)?;
            println!("Started instance {}", instance_id);
            drive(vec![handle]).await?;
        }

        Commands::Recover { latency } => {
            let executor = Arc::new(DemoExecutor {
                definition: WorkflowDefinition::new([1, 2, 3], [2]),
                latency: Duration::from_millis(latency),
            });
            let worker = Worker::new(config, executor)?;
            let handles = worker.recover()?;
            println!("Recovered {} instance(s)", handles.len());
            drive(handles).await?;
        }

        Commands::Inspect { instance_id } => {
            let storage = Storage::new(config.root.clone());
            let path = storage.journal_path(&InstanceId::new(instance_id));
            let entries = Journal::read_entries(&path)
                .with_context(|| format!("Failed to read journal: {:?}", path))?;

            for (position, entry) in entries.iter().enumerate() {
                println!("{:>4}  {}", position, serde_json::to_string(entry)?);
            }
        }
    }

    Ok(())
}
