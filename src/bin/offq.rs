//! offq: inspect and drain a SQLite-backed offline queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use offline_queue::model::PRIORITY_HIGH;
use offline_queue::telemetry::{TelemetryConfig, init_telemetry};
use offline_queue::{
    CommandHandler, NewOperation, OfflineQueue, Operation, OperationId, QueueConfig, SqliteStore,
    Status,
};

#[derive(Parser)]
#[command(name = "offq", about = "Durable offline operation queue")]
struct Cli {
    /// SQLite database holding the queue
    #[arg(long, env = "OFFQ_DB", default_value = "offq.db")]
    db: PathBuf,
    /// Queue config TOML (otherwise OFFQ_* environment variables)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue an operation
    Add {
        /// Operation type (the handler dispatches on it)
        operation_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Priority (higher = processed first)
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Retry budget (defaults to the queue config)
        #[arg(long)]
        max_retries: Option<u32>,
        /// JSON metadata
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List operations in processing order
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show an operation
    Show {
        /// Operation ID (full UUID or prefix)
        id: String,
    },
    /// Cancel a pending operation
    Cancel { id: String },
    /// Remove an operation regardless of status
    Remove { id: String },
    /// Print queue counters
    State,
    /// Reset failed operations whose retry budget is spent
    RetryFailed,
    /// Drop completed and cancelled operations
    Cleanup,
    /// Drop every operation
    Clear,
    /// Process pending operations through an external command
    Drain {
        /// Executable run once per operation; receives the operation as JSON on stdin
        #[arg(long)]
        command: PathBuf,
        /// Extra arguments for the command
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        service_name: "offq".to_string(),
        default_filter: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
    })?;

    let config = match &cli.config {
        Some(path) => QueueConfig::from_toml_file(path)?,
        None => QueueConfig::from_env()?,
    };
    let store = SqliteStore::open(&cli.db)?;
    let queue = OfflineQueue::new(config, Arc::new(store))?;

    let result = run(&queue, cli.command).await;
    queue.close().await?;
    result
}

async fn run(queue: &OfflineQueue, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Add {
            operation_type,
            payload,
            priority,
            max_retries,
            metadata,
        } => cmd_add(queue, operation_type, payload, priority, max_retries, metadata),
        Command::List { status } => cmd_list(queue, status),
        Command::Show { id } => cmd_show(queue, &id),
        Command::Cancel { id } => {
            let id = resolve_id(queue, &id)?;
            if !queue.cancel(id) {
                anyhow::bail!("operation {id} is not pending");
            }
            println!("Cancelled: {id}");
            Ok(())
        }
        Command::Remove { id } => {
            let id = resolve_id(queue, &id)?;
            if !queue.remove(id) {
                anyhow::bail!("operation {id} not found");
            }
            println!("Removed: {id}");
            Ok(())
        }
        Command::State => {
            println!("{}", serde_json::to_string_pretty(&queue.get_state())?);
            Ok(())
        }
        Command::RetryFailed => {
            println!("Reset {} operation(s)", queue.retry_failed());
            Ok(())
        }
        Command::Cleanup => {
            println!("Removed {} operation(s)", queue.cleanup());
            Ok(())
        }
        Command::Clear => {
            println!("Removed {} operation(s)", queue.clear());
            Ok(())
        }
        Command::Drain { command, args } => cmd_drain(queue, command, args).await,
    }
}

fn cmd_add(
    queue: &OfflineQueue,
    operation_type: String,
    payload: Option<String>,
    priority: i32,
    max_retries: Option<u32>,
    metadata: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Value::Null,
    };

    let mut new = NewOperation::new(operation_type)
        .payload(payload)
        .priority(priority);
    if let Some(n) = max_retries {
        new = new.max_retries(n);
    }
    if let Some(json) = metadata {
        new = new.metadata(serde_json::from_str(&json)?);
    }

    let op = queue.add(new)?;
    println!("Enqueued: {} (priority: {})", op.id, op.priority);
    Ok(())
}

fn cmd_list(queue: &OfflineQueue, status: Option<String>) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let ops: Vec<Operation> = queue
        .get_all()
        .into_iter()
        .filter(|op| status.is_none_or(|s| op.status == s))
        .collect();

    if ops.is_empty() {
        println!("No operations found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<10}  {:<4}  {:<7}  CREATED",
        "ID", "TYPE", "STATUS", "PRI", "RETRIES"
    );
    println!("{}", "-".repeat(76));

    for op in &ops {
        let short_id = &op.id.to_string()[..8];
        let marker = if op.priority >= PRIORITY_HIGH { "!" } else { "" };
        println!(
            "{:<8}  {:<20}  {:<10}  {:<4}  {:<7}  {}",
            short_id,
            truncate(&op.operation_type, 20),
            op.status,
            format!("{}{marker}", op.priority),
            format!("{}/{}", op.retry_count, op.max_retries),
            op.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} operation(s)", ops.len());
    Ok(())
}

fn cmd_show(queue: &OfflineQueue, id: &str) -> anyhow::Result<()> {
    let id = resolve_id(queue, id)?;
    let op = queue
        .get(id)
        .ok_or_else(|| anyhow::anyhow!("operation {id} not found"))?;

    println!("ID:         {}", op.id);
    println!("Type:       {}", op.operation_type);
    println!("Status:     {}", op.status);
    println!("Priority:   {}", op.priority);
    println!("Retries:    {}/{}", op.retry_count, op.max_retries);
    println!("Created:    {}", op.created_at);
    println!("Payload:    {}", serde_json::to_string_pretty(&op.payload)?);
    if let Some(ref metadata) = op.metadata {
        println!("Metadata:   {}", serde_json::to_string_pretty(metadata)?);
    }
    if let Some(ref error) = op.error {
        println!("Error:      {error}");
    }
    Ok(())
}

async fn cmd_drain(
    queue: &OfflineQueue,
    command: PathBuf,
    args: Vec<String>,
) -> anyhow::Result<()> {
    let handler = args
        .into_iter()
        .fold(CommandHandler::new(command), |h, arg| h.arg(arg));

    // Events go to stdout as JSON lines.
    let subscription = queue.on_any(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
    });

    let report = queue.process(Arc::new(handler)).await;
    subscription.unsubscribe();
    let report = report?;

    if report.failed > 0 || report.expired > 0 {
        anyhow::bail!(
            "{} operation(s) failed, {} expired",
            report.failed,
            report.expired
        );
    }
    Ok(())
}

/// Accept a full UUID or a unique prefix of one.
fn resolve_id(queue: &OfflineQueue, id: &str) -> anyhow::Result<OperationId> {
    if let Ok(id) = id.parse::<OperationId>() {
        return Ok(id);
    }
    let matches: Vec<OperationId> = queue
        .get_all()
        .iter()
        .map(|op| op.id)
        .filter(|candidate| candidate.to_string().starts_with(id))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no operation matching '{id}'"),
        [only] => Ok(*only),
        many => anyhow::bail!("{} operations match prefix '{id}', be more specific", many.len()),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
