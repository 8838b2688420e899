use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tdist_protocol::{
    MAX_JSON_LINE_BYTES, Request, RequestFrame, ResetResult, Response, ResponseFrame,
    RunStepResult, ServerStatus, SessionConfig, SessionCreated, SessionHandle, Target, Tensor,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph::{Graph, Output};

/// How long a call without a deadline keeps retrying a refused connection
/// before reporting the target as not found.
const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(2);
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Resolve a target string. Anything that does not name a server this
/// client can speak to is `NotFound`.
pub fn resolve_target(raw: &str) -> Result<Target> {
    Target::parse(raw).map_err(|e| Error::NotFound(format!("no server at target '{raw}': {e}")))
}

/// One request/response conversation with a server.
pub struct Connection {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    next_id: u64,
    job_name: String,
    task_index: u32,
}

impl Connection {
    /// Connect once and consume the server greeting. A target nothing
    /// listens on is `NotFound`.
    pub async fn open(target: &Target) -> Result<Self> {
        let stream = TcpStream::connect(target.authority())
            .await
            .map_err(|e| unreachable_target(target, &e))?;
        Self::handshake(target, stream).await
    }

    async fn handshake(target: &Target, stream: TcpStream) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            writer: FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            next_id: 1,
            job_name: String::new(),
            task_index: 0,
        };

        match conn.next_frame().await?.response {
            Response::Hello {
                protocol_version,
                job_name,
                task_index,
            } => {
                if protocol_version != tdist_protocol::PROTOCOL_VERSION {
                    return Err(Error::Unavailable(format!(
                        "{target} speaks protocol version {protocol_version}"
                    )));
                }
                conn.job_name = job_name;
                conn.task_index = task_index;
            }
            other => {
                return Err(Error::Internal(format!(
                    "expected hello from {target}, got {other:?}"
                )));
            }
        }
        Ok(conn)
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn task_index(&self) -> u32 {
        self.task_index
    }

    async fn next_frame(&mut self) -> Result<ResponseFrame> {
        let line = match self.reader.next().await {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                return Err(Error::Unavailable(format!("connection read failed: {err}")));
            }
            None => return Err(Error::Unavailable("server closed the connection".to_string())),
        };
        Ok(serde_json::from_str(&line)?)
    }

    /// Send `request` and wait for its response payload.
    pub async fn call(&mut self, request: Request) -> Result<Option<serde_json::Value>> {
        let id = self.next_id;
        self.next_id += 1;
        let line = serde_json::to_string(&RequestFrame { id, request })?;
        self.writer
            .send(line)
            .await
            .map_err(|e| Error::Unavailable(format!("connection write failed: {e}")))?;

        loop {
            let frame = self.next_frame().await?;
            if frame.id != id {
                debug!(expected = id, got = frame.id, "skipping unrelated frame");
                continue;
            }
            return match frame.response {
                Response::Ok { data } => Ok(data),
                Response::Error { code, message } => Err(Error::from_code(code, message)),
                Response::Hello { .. } => Err(Error::Internal("unexpected hello".to_string())),
            };
        }
    }
}

fn unreachable_target(target: &Target, err: &std::io::Error) -> Error {
    Error::NotFound(format!("no server reachable at {target}: {err}"))
}

/// Connect, retrying refused connections with backoff. Without a `window`
/// the caller's deadline bounds the retries.
async fn connect_with_retry(target: &Target, window: Option<Duration>) -> Result<Connection> {
    let give_up = window.map(|window| Instant::now() + window);
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(target.authority()).await {
            Ok(stream) => return Connection::handshake(target, stream).await,
            Err(err) if give_up.is_none_or(|at| Instant::now() + backoff < at) => {
                debug!(%target, "connect failed, retrying: {err}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => return Err(unreachable_target(target, &err)),
        }
    }
}

/// Issue one request on a fresh connection, bounded by `deadline`.
pub async fn call(
    target: &Target,
    request: Request,
    deadline: Option<Duration>,
) -> Result<Option<serde_json::Value>> {
    let window = match deadline {
        Some(_) => None,
        None => Some(CONNECT_RETRY_WINDOW),
    };
    let exchange = async {
        let mut conn = connect_with_retry(target, window).await?;
        conn.call(request).await
    };
    match deadline {
        Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
            Error::DeadlineExceeded(format!(
                "{target} did not answer within {}ms",
                limit.as_millis()
            ))
        })?,
        None => exchange.await,
    }
}

fn decode<T: DeserializeOwned>(data: Option<serde_json::Value>) -> Result<T> {
    let data = data.ok_or_else(|| Error::Internal("response is missing its payload".to_string()))?;
    Ok(serde_json::from_value(data)?)
}

/// Fetch the status of the server at `target`.
pub async fn server_status(target: &str, config: &SessionConfig) -> Result<ServerStatus> {
    let target = resolve_target(target)?;
    decode(call(&target, Request::Status, config.operation_timeout()).await?)
}

#[derive(Default)]
struct GraphSync {
    graph: Option<Uuid>,
    sent: usize,
}

/// Client handle to a server-side session.
///
/// Methods take `&self` so a session can be shared between tasks; closing
/// it from one task cancels runs blocked in another.
pub struct Session {
    target: Target,
    config: SessionConfig,
    handle: SessionHandle,
    sync: Mutex<GraphSync>,
    closed: AtomicBool,
}

impl Session {
    /// Open a session on the server at `target`.
    pub async fn connect(target: &str, config: SessionConfig) -> Result<Self> {
        let target = resolve_target(target)?;
        let created: SessionCreated = decode(
            call(
                &target,
                Request::CreateSession {
                    config: config.clone(),
                },
                config.operation_timeout(),
            )
            .await?,
        )?;
        debug!(%target, session = %created.session_handle, "session opened");
        Ok(Self {
            target,
            config,
            handle: created.session_handle,
            sync: Mutex::new(GraphSync::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn call(&self, request: Request) -> Result<Option<serde_json::Value>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FailedPrecondition(format!(
                "session {} is closed",
                self.handle
            )));
        }
        call(&self.target, request, self.config.operation_timeout()).await
    }

    /// Upload the nodes of `graph` the server has not seen yet. A session is
    /// bound to the first graph it is extended with.
    pub async fn extend(&self, graph: &Graph) -> Result<()> {
        let mut sync = self.sync.lock().await;
        match sync.graph {
            Some(id) if id != graph.id() => {
                return Err(Error::InvalidArgument(
                    "session is already bound to a different graph".to_string(),
                ));
            }
            _ => {}
        }
        if sync.graph.is_some() && sync.sent == graph.len() {
            return Ok(());
        }

        let nodes = graph.nodes()[sync.sent..].to_vec();
        let count = nodes.len();
        self.call(Request::ExtendSession {
            session_handle: self.handle.clone(),
            nodes,
        })
        .await?;
        sync.graph = Some(graph.id());
        sync.sent += count;
        Ok(())
    }

    pub async fn run(&self, graph: &Graph, fetches: &[&Output]) -> Result<Vec<Tensor>> {
        self.run_step(graph, &[], fetches, &[]).await
    }

    pub async fn run_with_feeds(
        &self,
        graph: &Graph,
        feeds: &[(&Output, Tensor)],
        fetches: &[&Output],
    ) -> Result<Vec<Tensor>> {
        self.run_step(graph, feeds, fetches, &[]).await
    }

    pub async fn run_targets(&self, graph: &Graph, targets: &[&Output]) -> Result<()> {
        self.run_step(graph, &[], &[], targets).await.map(|_| ())
    }

    /// Extend the session with `graph`, then evaluate `fetches` and run
    /// `targets` in one step.
    pub async fn run_step(
        &self,
        graph: &Graph,
        feeds: &[(&Output, Tensor)],
        fetches: &[&Output],
        targets: &[&Output],
    ) -> Result<Vec<Tensor>> {
        self.extend(graph).await?;
        let feeds: BTreeMap<String, Tensor> = feeds
            .iter()
            .map(|(output, tensor)| (output.name().to_string(), tensor.clone()))
            .collect();
        let result: RunStepResult = decode(
            self.call(Request::RunStep {
                session_handle: self.handle.clone(),
                feeds,
                fetches: fetches.iter().map(|o| o.name().to_string()).collect(),
                targets: targets.iter().map(|o| o.name().to_string()).collect(),
            })
            .await?,
        )?;
        Ok(result.tensors)
    }

    /// Close the session on the server. Blocked runs of this session fail
    /// with `Cancelled`; server-side containers are left alone.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        call(
            &self.target,
            Request::CloseSession {
                session_handle: self.handle.clone(),
            },
            self.config.operation_timeout(),
        )
        .await
        .map(|_| ())
    }

    /// Reset containers on the server at `target`; an empty list resets all
    /// of them. Unknown container names are ignored.
    pub async fn reset(
        target: &str,
        containers: &[&str],
        config: &SessionConfig,
    ) -> Result<ResetResult> {
        let target = resolve_target(target)?;
        let request = Request::Reset {
            containers: containers.iter().map(|c| c.to_string()).collect(),
        };
        decode(call(&target, request, config.operation_timeout()).await?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let target = self.target.clone();
        let request = Request::CloseSession {
            session_handle: self.handle.clone(),
        };
        runtime.spawn(async move {
            if let Err(err) = call(&target, request, Some(CONNECT_RETRY_WINDOW)).await {
                warn!(%target, "closing dropped session failed: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_targets_are_not_found() {
        assert!(matches!(resolve_target("nonexistent"), Err(Error::NotFound(_))));
        assert!(matches!(
            resolve_target("carrier-pigeon://localhost:1"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            resolve_target("grpc://localhost"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(
            resolve_target("grpc://localhost:2222").unwrap().port,
            2222
        );
    }

    #[tokio::test]
    async fn unreachable_target_hits_deadline() {
        let target = resolve_target("grpc://localhost:0").unwrap();
        let err = call(&target, Request::Status, Some(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn refused_target_without_deadline_is_not_found() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = resolve_target(&format!("grpc://127.0.0.1:{port}")).unwrap();
        let started = Instant::now();
        let err = call(&target, Request::Status, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
        assert!(started.elapsed() < CONNECT_RETRY_WINDOW + Duration::from_secs(1));

        let err = Connection::open(&target).await.err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn refused_target_with_deadline_keeps_retrying_until_deadline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = resolve_target(&format!("grpc://127.0.0.1:{port}")).unwrap();
        let err = call(&target, Request::Status, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
    }

    #[test]
    fn decode_requires_payload() {
        let err = decode::<ResetResult>(None).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
