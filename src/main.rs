use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use lease_cron::config::{LockLeaseConfig, NodeConfig, SchedulerConfig};
use lease_cron::db::Database;
use lease_cron::metrics::encode_text;
use lease_cron::node::Node;
use lease_cron::shutdown::install_shutdown_handler;
use lease_cron::store::{JobStore, SqliteJobStore};

#[derive(Parser, Debug)]
#[command(name = "lease-cron")]
#[command(version)]
#[command(about = "A lease-based distributed job scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a scheduler node against a job database
    Run(RunArgs),

    /// Inspect a job row
    Job {
        /// Path to the SQLite job database
        #[arg(long, default_value = "lease-cron.db")]
        db: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the SQLite job database (shared by every node)
    #[arg(long, default_value = "lease-cron.db")]
    db: PathBuf,

    /// Maximum number of jobs executing at once on this node
    #[arg(long, default_value = "100")]
    concurrency: usize,

    /// Pause after an empty or failed claim, in milliseconds
    #[arg(long, default_value = "200")]
    poll_backoff_ms: u64,

    /// Heartbeat period for claimed jobs, in seconds
    #[arg(long, default_value = "60")]
    heartbeat_secs: u64,

    /// Reclaim running jobs after this many missed heartbeats
    #[arg(long)]
    stale_heartbeats: Option<u32>,

    /// Run the ranking task every N seconds on whichever node holds its lock
    #[arg(long)]
    ranking_interval_secs: Option<u64>,

    /// TTL of the ranking lock, in seconds
    #[arg(long, default_value = "30")]
    ranking_lease_secs: u64,

    /// Write metrics in the Prometheus text format to this file on shutdown
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Show the stored state of a job
    Status {
        /// Job ID
        job_id: i64,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl RunArgs {
    fn node_config(&self) -> NodeConfig {
        let mut scheduler = SchedulerConfig::new(self.concurrency)
            .with_poll_backoff(Duration::from_millis(self.poll_backoff_ms))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_secs));
        if let Some(heartbeats) = self.stale_heartbeats {
            scheduler = scheduler.with_stale_reclaim(heartbeats);
        }

        let config = NodeConfig::new(&self.db).with_scheduler(scheduler);
        match self.ranking_interval_secs {
            Some(secs) => config.with_ranking(
                Duration::from_secs(secs),
                LockLeaseConfig::new(
                    "job:ranking",
                    Duration::from_secs(self.ranking_lease_secs),
                ),
            ),
            None => config,
        }
    }
}

async fn run_node(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let node = Node::new(args.node_config())?;
    let registry = node.registry().clone();
    let shutdown = install_shutdown_handler()?;
    node.run(shutdown).await?;

    if let Some(path) = &args.metrics_file {
        std::fs::write(path, encode_text(&registry)?)?;
        tracing::info!(path = ?path, "Metrics written");
    }
    Ok(())
}

async fn handle_job_status(
    db: PathBuf,
    job_id: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteJobStore::new(Database::open(db)?)?;
    let Some(job) = store.find(job_id).await? else {
        return Err(format!("job {} not found", job_id).into());
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        OutputFormat::Table => {
            println!("Job ID:          {}", job.id);
            println!("Name:            {}", job.name);
            println!("Executor:        {}", job.executor);
            println!("Status:          {}", job.status);
            println!("Version:         {}", job.version);
            println!("Next Execution:  {}", job.next_time.to_rfc3339());
            println!("Last Heartbeat:  {}", job.heartbeat_at.to_rfc3339());
            if !job.expression.is_empty() {
                println!("Expression:      {}", job.expression);
            }
            if !job.config.is_empty() {
                println!("Config:");
                for line in job.config.lines() {
                    println!("  {}", line);
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_node(run_args).await?;
        }
        Commands::Job {
            db,
            output,
            command,
        } => match command {
            JobCommands::Status { job_id } => {
                handle_job_status(db, job_id, &output).await?;
            }
        },
    }

    Ok(())
}
