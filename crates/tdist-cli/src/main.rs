mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tdist", about = "Inspect and reset tdist servers")]
struct Cli {
    /// Per-call deadline in milliseconds (0 means none)
    #[arg(long = "timeout-ms", global = true, default_value = "5000")]
    timeout_ms: u64,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Release containers on a server; without --container every container is reset
    Reset {
        /// Server target, e.g. grpc://localhost:2222
        target: String,

        /// Container to reset (repeatable)
        #[arg(long = "container")]
        containers: Vec<String>,
    },

    /// Show sessions and containers of a server
    Status {
        /// Server target, e.g. grpc://localhost:2222
        target: String,
    },

    /// Print the canonical ServerDef text for a task
    ServerDef {
        /// Job definition `name=host:port,host:port` (repeatable)
        #[arg(long = "cluster", required = true)]
        cluster: Vec<String>,

        /// Job of the task; optional when the cluster has one job
        #[arg(long = "job-name")]
        job_name: Option<String>,

        /// Index of the task; optional when the job has one task
        #[arg(long = "task-index")]
        task_index: Option<u32>,

        /// Default per-call deadline for sessions, in milliseconds
        #[arg(long = "operation-timeout-ms")]
        operation_timeout_ms: Option<u64>,

        /// Also write the serialized record here, for `tdist-server --server-def`
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tdist=warn,libtdist=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = libtdist::SessionConfig::default().with_operation_timeout_ms(cli.timeout_ms);

    match cli.command {
        Commands::Reset { target, containers } => {
            commands::reset(&target, &containers, &config, cli.json).await
        }
        Commands::Status { target } => commands::status(&target, &config, cli.json).await,
        Commands::ServerDef {
            cluster,
            job_name,
            task_index,
            operation_timeout_ms,
            output,
        } => commands::server_def(
            &cluster,
            job_name,
            task_index,
            operation_timeout_ms,
            output.as_deref(),
        ),
    }
}
