use anyhow::{Context, Result};
use libtdist::{ClusterSpec, JobTasks, ServerDef, Session, SessionConfig};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Reset containers on the server at `target`.
pub async fn reset(
    target: &str,
    containers: &[String],
    config: &SessionConfig,
    json: bool,
) -> Result<()> {
    let names: Vec<&str> = containers.iter().map(String::as_str).collect();
    debug!(target_addr = target, ?names, "resetting containers");
    let result = Session::reset(target, &names, config)
        .await
        .with_context(|| format!("reset of {target} failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.cleared.is_empty() {
        println!("no matching containers on {target}");
    } else {
        println!(
            "reset {} ({} resources released)",
            result.cleared.join(", "),
            result.released_resources
        );
    }
    Ok(())
}

/// Print sessions and containers of the server at `target`.
pub async fn status(target: &str, config: &SessionConfig, json: bool) -> Result<()> {
    debug!(target_addr = target, "requesting status");
    let status = libtdist::server_status(target, config)
        .await
        .with_context(|| format!("status of {target} failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "{} job={} task={} sessions={}",
        target, status.job_name, status.task_index, status.session_count
    );
    for container in &status.containers {
        let marker = if container.name == status.default_container {
            " (default)"
        } else {
            ""
        };
        println!(
            "  {}{marker}: {} resources",
            container.name,
            container.resources.len()
        );
        for resource in &container.resources {
            println!("    {resource}");
        }
    }
    Ok(())
}

/// Print the canonical text form of the ServerDef for one task, optionally
/// saving the serialized record.
pub fn server_def(
    cluster: &[String],
    job_name: Option<String>,
    task_index: Option<u32>,
    operation_timeout_ms: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    let jobs = cluster
        .iter()
        .map(|raw| JobTasks::parse_arg(raw).context("invalid --cluster"))
        .collect::<Result<Vec<_>>>()?;
    let cluster = ClusterSpec::new(jobs)?;
    let mut def = ServerDef::from_cluster(cluster, job_name.as_deref(), task_index)?;
    if let Some(ms) = operation_timeout_ms {
        def = def.with_default_session_config(
            SessionConfig::default().with_operation_timeout_ms(ms),
        );
    }
    if let Some(path) = output {
        fs::write(path, def.encode_to_vec())
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), "server def written");
    }
    print!("{}", def.to_text());
    Ok(())
}
