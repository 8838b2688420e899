use anyhow::{Context, Result, bail};
use assert_cmd::cargo::cargo_bin_cmd;
use libtdist::protocol::{
    ContainerSummary, ErrorCode, Request, RequestFrame, ResetResult, Response, ResponseFrame,
    ServerStatus,
};
use predicates::prelude::*;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

/// Serve exactly one request on an ephemeral port; returns the target and the
/// thread yielding the request it saw.
fn spawn_mock_server<F>(handler: F) -> Result<(String, thread::JoinHandle<Result<Request>>)>
where
    F: FnOnce(&Request) -> Response + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind mock server")?;
    let target = format!("grpc://{}", listener.local_addr()?);

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().context("failed to accept client")?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("failed to set read timeout")?;

        let read_half = stream.try_clone().context("failed to clone stream")?;
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(stream);

        write_frame(
            &mut writer,
            &ResponseFrame {
                id: 0,
                response: Response::Hello {
                    protocol_version: libtdist::protocol::PROTOCOL_VERSION,
                    job_name: "local".to_string(),
                    task_index: 0,
                },
            },
        )?;

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            bail!("client disconnected before request");
        }
        let frame: RequestFrame = serde_json::from_str(line.trim_end())?;
        let response = handler(&frame.request);
        write_frame(
            &mut writer,
            &ResponseFrame {
                id: frame.id,
                response,
            },
        )?;
        Ok(frame.request)
    });

    Ok((target, handle))
}

fn write_frame(writer: &mut BufWriter<std::net::TcpStream>, frame: &ResponseFrame) -> Result<()> {
    writeln!(writer, "{}", serde_json::to_string(frame)?)?;
    writer.flush()?;
    Ok(())
}

fn ok_with<T: serde::Serialize>(payload: &T) -> Response {
    Response::ok(Some(serde_json::to_value(payload).expect("serializable payload")))
}

#[test]
fn reset_sends_named_containers() -> Result<()> {
    let (target, server) = spawn_mock_server(|_| {
        ok_with(&ResetResult {
            cleared: vec!["test0".to_string()],
            released_resources: 2,
        })
    })?;

    cargo_bin_cmd!("tdist")
        .args(["reset", &target, "--container", "test0", "--container", "test1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reset test0 (2 resources released)"));

    match server.join().expect("mock thread")? {
        Request::Reset { containers } => {
            assert_eq!(containers, vec!["test0".to_string(), "test1".to_string()]);
        }
        other => bail!("unexpected request {other:?}"),
    }
    Ok(())
}

#[test]
fn reset_without_containers_resets_all() -> Result<()> {
    let (target, server) = spawn_mock_server(|_| {
        ok_with(&ResetResult {
            cleared: Vec::new(),
            released_resources: 0,
        })
    })?;

    cargo_bin_cmd!("tdist")
        .args(["reset", &target, "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"released_resources\": 0"));

    match server.join().expect("mock thread")? {
        Request::Reset { containers } => assert!(containers.is_empty()),
        other => bail!("unexpected request {other:?}"),
    }
    Ok(())
}

#[test]
fn reset_surfaces_server_errors() -> Result<()> {
    let (target, server) = spawn_mock_server(|_| {
        Response::error(ErrorCode::Internal, "registry unavailable")
    })?;

    cargo_bin_cmd!("tdist")
        .args(["reset", &target])
        .assert()
        .failure()
        .stderr(predicate::str::contains("registry unavailable"));

    server.join().expect("mock thread")?;
    Ok(())
}

#[test]
fn reset_of_unparseable_target_fails() {
    cargo_bin_cmd!("tdist")
        .args(["reset", "nonexistent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn status_lists_containers() -> Result<()> {
    let (target, server) = spawn_mock_server(|_| {
        ok_with(&ServerStatus {
            job_name: "local".to_string(),
            task_index: 0,
            protocol: "grpc".to_string(),
            session_count: 2,
            default_container: "local".to_string(),
            containers: vec![
                ContainerSummary {
                    name: "local".to_string(),
                    resources: vec!["v0".to_string()],
                },
                ContainerSummary {
                    name: "test0".to_string(),
                    resources: Vec::new(),
                },
            ],
        })
    })?;

    cargo_bin_cmd!("tdist")
        .args(["status", &target])
        .assert()
        .success()
        .stdout(predicate::str::contains("sessions=2"))
        .stdout(predicate::str::contains("local (default): 1 resources"))
        .stdout(predicate::str::contains("test0: 0 resources"));

    assert!(matches!(server.join().expect("mock thread")?, Request::Status));
    Ok(())
}

#[test]
fn server_def_prints_canonical_text() {
    cargo_bin_cmd!("tdist")
        .args([
            "server-def",
            "--cluster",
            "local=localhost:2222,localhost:2223",
            "--task-index",
            "1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "tasks { key: 0 value: \"localhost:2222\" }",
        ))
        .stdout(predicate::str::contains(
            "tasks { key: 1 value: \"localhost:2223\" }",
        ))
        .stdout(predicate::str::contains("task_index: 1"))
        .stdout(predicate::str::contains("protocol: \"grpc\""));
}

#[test]
fn server_def_rejects_missing_port() {
    cargo_bin_cmd!("tdist")
        .args(["server-def", "--cluster", "local=localhost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("port"));
}

#[test]
fn server_def_rejects_malformed_cluster() {
    cargo_bin_cmd!("tdist")
        .args(["server-def", "--cluster", "local"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected name=host:port"));
}

#[test]
fn server_def_output_decodes_to_the_printed_def() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("def.pb");

    let assert = cargo_bin_cmd!("tdist")
        .args([
            "server-def",
            "--cluster",
            "worker=w0:2222,w1:2222",
            "--task-index",
            "1",
            "--operation-timeout-ms",
            "250",
            "--output",
        ])
        .arg(&path)
        .assert()
        .success();
    let printed = String::from_utf8(assert.get_output().stdout.clone())?;

    let def = libtdist::ServerDef::decode(&std::fs::read(&path)?)?;
    assert_eq!(def.job_name, "worker");
    assert_eq!(def.task_index, 1);
    assert_eq!(def.task_address()?, "w1:2222");
    assert_eq!(def.default_session_config.operation_timeout_in_ms, Some(250));
    assert_eq!(def.to_text(), printed);
    Ok(())
}
