use anyhow::{Context, Result, bail};
use clap::Parser;
use libtdist::{ClusterSpec, JobTasks, Server, ServerDef, ServerOptions, SessionConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug, Default)]
#[command(name = "tdist-server", about = "Serve one task of a tdist cluster")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serialized ServerDef (`tdist server-def --output`); replaces cluster,
    /// job and task settings
    #[arg(long = "server-def")]
    server_def: Option<PathBuf>,

    /// Job this server belongs to
    #[arg(long = "job-name")]
    job_name: Option<String>,

    /// Task index within the job
    #[arg(long = "task-index")]
    task_index: Option<u32>,

    /// Job definition `name=host:port,host:port` (repeatable)
    #[arg(long = "cluster")]
    cluster: Vec<String>,

    /// Accept `shutdown` requests from clients
    #[arg(long = "allow-remote-shutdown")]
    allow_remote_shutdown: bool,

    /// Refuse new sessions beyond this many
    #[arg(long = "max-sessions")]
    max_sessions: Option<usize>,

    /// Default per-call deadline for sessions, in milliseconds
    #[arg(long = "operation-timeout-ms")]
    operation_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    job_name: Option<String>,
    task_index: Option<u32>,
    protocol: Option<String>,
    cluster: Option<BTreeMap<String, FileJobTasks>>,
    max_sessions: Option<usize>,
    allow_remote_shutdown: Option<bool>,
    outbound_queue: Option<usize>,
    default_session_config: Option<SessionConfig>,
}

/// A job is either a list of addresses or a table keyed by task index.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileJobTasks {
    Dense(Vec<String>),
    Sparse(BTreeMap<String, String>),
}

impl FileJobTasks {
    fn into_job_tasks(self, job: &str) -> Result<JobTasks> {
        match self {
            FileJobTasks::Dense(addresses) => Ok(JobTasks::from(addresses)),
            FileJobTasks::Sparse(entries) => {
                let mut tasks = BTreeMap::new();
                for (index, address) in entries {
                    let index: i64 = index
                        .parse()
                        .with_context(|| format!("job '{job}' has non-numeric task '{index}'"))?;
                    tasks.insert(index, address);
                }
                Ok(JobTasks::Sparse(tasks))
            }
        }
    }
}

#[derive(Debug)]
struct RuntimeConfig {
    server_def: ServerDef,
    options: ServerOptions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tdist_server=info,libtdist=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;

    let server = Server::with_options(cfg.server_def, cfg.options)
        .context("invalid server definition")?;
    server.start().await.context("failed to start server")?;
    info!(
        "tdist-server started pid={} target={} job={} task={}",
        std::process::id(),
        server.target(),
        server.server_def().job_name,
        server.server_def().task_index
    );
    // Supervisors read the bound target from the first stdout line.
    println!("{}", server.target());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupt received, shutting down");
        }
        _ = server.join() => {
            info!("remote shutdown completed");
        }
    }
    server.stop().await;
    Ok(())
}

fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = if let Some(path) = &args.config {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        FileConfig::default()
    };

    let mut session_config = file_cfg.default_session_config.unwrap_or_default();
    if let Some(ms) = args.operation_timeout_ms {
        session_config.operation_timeout_in_ms = Some(ms);
    }

    let server_def = if let Some(path) = &args.server_def {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read server def {}", path.display()))?;
        let def = ServerDef::decode(&raw)
            .with_context(|| format!("failed to decode server def {}", path.display()))?;
        let config = session_config.merged_over(&def.default_session_config);
        def.with_default_session_config(config)
    } else {
        let cluster = if !args.cluster.is_empty() {
            let jobs = args
                .cluster
                .iter()
                .map(|raw| JobTasks::parse_arg(raw).context("invalid --cluster"))
                .collect::<Result<Vec<_>>>()?;
            ClusterSpec::new(jobs)?
        } else if let Some(jobs) = file_cfg.cluster {
            let jobs = jobs
                .into_iter()
                .map(|(name, tasks)| {
                    let tasks = tasks.into_job_tasks(&name)?;
                    Ok((name, tasks))
                })
                .collect::<Result<Vec<_>>>()?;
            ClusterSpec::new(jobs)?
        } else {
            ClusterSpec::new([("local", ["localhost:0"])])?
        };

        let job_name = args.job_name.clone().or(file_cfg.job_name);
        let task_index = args.task_index.or(file_cfg.task_index);
        let def = ServerDef::from_cluster(cluster, job_name.as_deref(), task_index)
            .context("cannot determine which task to serve")?;
        if let Some(protocol) = file_cfg.protocol {
            if protocol != def.protocol {
                bail!("unsupported protocol '{protocol}'");
            }
        }
        def.with_default_session_config(session_config)
    };

    Ok(RuntimeConfig {
        server_def,
        options: ServerOptions {
            max_sessions: args.max_sessions.or(file_cfg.max_sessions),
            allow_remote_shutdown: args.allow_remote_shutdown
                || file_cfg.allow_remote_shutdown.unwrap_or(false),
            outbound_queue: file_cfg.outbound_queue.unwrap_or(1024),
        },
    })
}
