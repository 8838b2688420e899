use anyhow::{Context, Result, bail};
use libtdist::protocol::Request;
use libtdist::{Error, Graph, Session, SessionConfig, Tensor, server_status};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};

struct TestServer {
    child: Child,
    target: String,
}

impl TestServer {
    async fn spawn() -> Result<Self> {
        Self::spawn_with_args(&["--allow-remote-shutdown"]).await
    }

    async fn spawn_with_args(extra_args: &[&str]) -> Result<Self> {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tdist-server"));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for arg in extra_args {
            cmd.arg(arg);
        }
        let mut child = cmd.spawn().context("failed to spawn tdist-server")?;
        let stdout = child.stdout.take().context("stdout not captured")?;

        let first_line = tokio::task::spawn_blocking(move || {
            let mut line = String::new();
            BufReader::new(stdout).read_line(&mut line).map(|_| line)
        });
        let line = match timeout(Duration::from_secs(10), first_line).await {
            Ok(joined) => joined??,
            Err(_) => {
                let _ = child.kill();
                bail!("timed out waiting for tdist-server to report its target");
            }
        };
        let target = line.trim().to_string();
        if !target.starts_with("grpc://") {
            let _ = child.kill();
            bail!("unexpected first line from tdist-server: {line:?}");
        }

        Ok(Self { child, target })
    }

    async fn wait_for_exit(&mut self) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if start.elapsed() > Duration::from_secs(5) {
                return Ok(false);
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[tokio::test]
async fn daemon_serves_sessions() -> Result<()> {
    let server = TestServer::spawn().await?;

    let mut graph = Graph::new();
    let v0 = graph.variable("v0", 1.0f32);
    let two = graph.constant("two", 2.0f32);
    let sum = graph.add("sum", &v0.value, &two);

    let session = Session::connect(&server.target, SessionConfig::default()).await?;
    let err = session.run(&graph, &[&sum]).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)), "got {err}");

    session.run_targets(&graph, &[&v0.initializer]).await?;
    assert_eq!(session.run(&graph, &[&sum]).await?, vec![Tensor::scalar(3.0)]);
    session.close().await?;
    Ok(())
}

#[tokio::test]
async fn daemon_reset_clears_default_container() -> Result<()> {
    let server = TestServer::spawn().await?;

    let mut graph = Graph::new();
    let v0 = graph.variable("v0", 1.0f32);
    let session = Session::connect(&server.target, SessionConfig::default()).await?;
    session.run_targets(&graph, &[&v0.initializer]).await?;

    let result = Session::reset(&server.target, &[], &SessionConfig::default()).await?;
    assert_eq!(result.released_resources, 1);

    let err = session.run(&graph, &[&v0.value]).await.unwrap_err();
    assert!(matches!(err, Error::Aborted(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn daemon_reports_configured_task() -> Result<()> {
    let server = TestServer::spawn_with_args(&[
        "--cluster",
        "ps=localhost:1",
        "--cluster",
        "worker=localhost:2,localhost:0",
        "--job-name",
        "worker",
        "--task-index",
        "1",
        "--allow-remote-shutdown",
    ])
    .await?;

    let status = server_status(&server.target, &SessionConfig::default()).await?;
    assert_eq!(status.job_name, "worker");
    assert_eq!(status.task_index, 1);
    assert_eq!(status.default_container, "worker");
    Ok(())
}

#[tokio::test]
async fn daemon_reads_toml_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("tdist.toml");
    std::fs::write(
        &config_path,
        r#"
job_name = "local"
max_sessions = 1
allow_remote_shutdown = true

[cluster]
local = { "37" = "localhost:0" }
"#,
    )?;

    let server =
        TestServer::spawn_with_args(&["--config", config_path.to_str().context("utf-8 path")?])
            .await?;
    let status = server_status(&server.target, &SessionConfig::default()).await?;
    assert_eq!(status.task_index, 37);

    let _first = Session::connect(&server.target, SessionConfig::default()).await?;
    let err = Session::connect(&server.target, SessionConfig::default())
        .await
        .err()
        .context("second session should be refused")?;
    assert!(matches!(err, Error::ResourceExhausted(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn remote_shutdown_stops_daemon() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let target = libtdist::resolve_target(&server.target)?;
    libtdist::client::call(&target, Request::Shutdown, Some(Duration::from_secs(5))).await?;
    assert!(server.wait_for_exit().await?, "daemon did not exit");
    Ok(())
}

#[tokio::test]
async fn remote_shutdown_is_refused_by_default() -> Result<()> {
    let mut server = TestServer::spawn_with_args(&[]).await?;
    let target = libtdist::resolve_target(&server.target)?;
    let err = libtdist::client::call(&target, Request::Shutdown, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)), "got {err}");
    assert!(server.child.try_wait()?.is_none());
    Ok(())
}

#[test]
fn missing_port_fails_at_startup() {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("tdist-server"))
        .args(["--cluster", "local=localhost"])
        .assert()
        .failure();
}
