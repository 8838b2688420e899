use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tdist_protocol::{
    GRPC_PROTOCOL, MAX_JSON_LINE_BYTES, RequestFrame, ResponseFrame, ServerStatus, SessionConfig,
    parse_address,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterSpec;
use crate::error::{Error, Result};
use crate::handler::{Dispatcher, enqueue_response, invalid_request};
use crate::server_def::ServerDef;
use crate::session::{SessionManager, SessionManagerConfig};

/// How long connections may keep finishing in-flight responses after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Started,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_sessions: Option<usize>,
    pub allow_remote_shutdown: bool,
    /// Responses buffered per connection before the writer applies
    /// backpressure.
    pub outbound_queue: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_sessions: None,
            allow_remote_shutdown: false,
            outbound_queue: 1024,
        }
    }
}

/// One task of a cluster, serving sessions over TCP.
pub struct Server {
    server_def: ServerDef,
    bind_host: String,
    bind_port: u16,
    options: ServerOptions,
    manager: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ServerState>,
    local_addr: OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
}

impl Server {
    /// Validate `server_def` and build a server in the `Created` state.
    pub fn new(server_def: ServerDef) -> Result<Self> {
        Self::with_options(server_def, ServerOptions::default())
    }

    pub fn with_options(server_def: ServerDef, options: ServerOptions) -> Result<Self> {
        server_def.validate()?;
        let address = server_def.task_address()?;
        let (host, bind_port) = parse_address(address).map_err(|e| {
            Error::InvalidArgument(format!(
                "task {}:{} cannot be served: {e}",
                server_def.job_name, server_def.task_index
            ))
        })?;

        let manager = Arc::new(SessionManager::new(SessionManagerConfig {
            job_name: server_def.job_name.clone(),
            task_index: server_def.task_index,
            default_session_config: server_def.default_session_config.clone(),
            max_sessions: options.max_sessions,
        }));
        let (shutdown_tx, _) = watch::channel(false);
        let (finished_tx, _) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&manager),
            server_def.clone(),
            options.allow_remote_shutdown,
            shutdown_tx.clone(),
        ));

        Ok(Self {
            server_def,
            bind_host: host,
            bind_port,
            options,
            manager,
            dispatcher,
            state: Mutex::new(ServerState::Created),
            local_addr: OnceLock::new(),
            shutdown_tx,
            finished_tx,
        })
    }

    /// Build a server and, when `start` is set, start it.
    pub async fn create(server_def: ServerDef, start: bool) -> Result<Self> {
        let server = Self::new(server_def)?;
        if start {
            server.start().await?;
        }
        Ok(server)
    }

    /// Single-job, single-task server on an ephemeral local port.
    pub async fn create_local(config: SessionConfig, start: bool) -> Result<Self> {
        Self::create(ServerDef::local(config)?, start).await
    }

    pub async fn from_cluster(
        cluster: ClusterSpec,
        job_name: Option<&str>,
        task_index: Option<u32>,
        config: SessionConfig,
        start: bool,
    ) -> Result<Self> {
        let def = ServerDef::from_cluster(cluster, job_name, task_index)?
            .with_default_session_config(config);
        Self::create(def, start).await
    }

    pub fn server_def(&self) -> &ServerDef {
        &self.server_def
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub async fn state(&self) -> ServerState {
        *self.state.lock().await
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// `grpc://host:port` for this server; the port is the bound one once the
    /// server has started.
    pub fn target(&self) -> String {
        let port = self.local_addr().map_or(self.bind_port, |addr| addr.port());
        format!("{GRPC_PROTOCOL}://{}:{port}", self.bind_host)
    }

    pub async fn status(&self) -> ServerStatus {
        self.dispatcher.status().await
    }

    /// Bind the task address and begin serving. Starting a started server is
    /// a no-op; a stopped server cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *self.finished_tx.borrow() {
            *state = ServerState::Stopped;
        }
        match *state {
            ServerState::Started => return Ok(()),
            ServerState::Stopped => {
                return Err(Error::FailedPrecondition(
                    "server has been stopped and cannot be restarted".to_string(),
                ));
            }
            ServerState::Created => {}
        }

        let host = self
            .bind_host
            .trim_start_matches('[')
            .trim_end_matches(']');
        let listener = TcpListener::bind((host, self.bind_port))
            .await
            .map_err(|e| {
                Error::Unavailable(format!(
                    "failed to bind {}:{}: {e}",
                    self.bind_host, self.bind_port
                ))
            })?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.manager),
            self.options.outbound_queue,
            self.shutdown_tx.subscribe(),
            self.finished_tx.clone(),
        ));
        *state = ServerState::Started;
        info!(
            job = %self.server_def.job_name,
            task = self.server_def.task_index,
            %addr,
            "server started"
        );
        Ok(())
    }

    /// Stop accepting connections and cancel every open session.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match *state {
            ServerState::Stopped => {}
            ServerState::Created => {
                self.finished_tx.send_replace(true);
            }
            ServerState::Started => {
                self.shutdown_tx.send_replace(true);
                self.manager.close_all().await;
                info!(addr = %self.target(), "server stopped");
            }
        }
        *state = ServerState::Stopped;
    }

    /// Wait until the server has stopped serving, either through `stop` or
    /// a remote shutdown request.
    pub async fn join(&self) {
        let mut finished = self.finished_tx.subscribe();
        let _ = finished.wait_for(|done| *done).await;
        *self.state.lock().await = ServerState::Stopped;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<SessionManager>,
    outbound_queue: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    finished_tx: watch::Sender<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                debug!(%peer, "connection accepted");
                connections.spawn(handle_connection(
                    stream,
                    Arc::clone(&dispatcher),
                    outbound_queue,
                ));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Cancel blocked runs so their connections can answer and close.
    manager.close_all().await;
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        debug!(open = connections.len(), "aborting connections after shutdown grace");
    }
    connections.shutdown().await;
    finished_tx.send_replace(true);
}

async fn handle_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>, outbound_queue: usize) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<ResponseFrame>(outbound_queue);
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    let hello = ResponseFrame {
        id: 0,
        response: dispatcher.hello(),
    };
    if enqueue_response(&out_tx, hello).is_err() {
        writer_task.abort();
        return;
    }

    let mut requests = JoinSet::new();
    loop {
        let line = tokio::select! {
            next = reader.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!("socket read failed: {err}");
                    break;
                }
                None => break,
            },
            Some(_) = requests.join_next(), if !requests.is_empty() => continue,
        };

        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(err) => {
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
                    .unwrap_or(0);
                let response = ResponseFrame {
                    id,
                    response: invalid_request(&err),
                };
                if enqueue_response(&out_tx, response).is_err() {
                    break;
                }
                continue;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        let out_tx = out_tx.clone();
        requests.spawn(async move {
            let response = dispatcher.handle(frame.request).await;
            let _ = out_tx
                .send(ResponseFrame {
                    id: frame.id,
                    response,
                })
                .await;
        });
    }

    // In-flight requests die with the connection.
    requests.shutdown().await;
    drop(out_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::JobTasks;

    #[tokio::test]
    async fn local_server_binds_ephemeral_port() {
        let server = Server::create_local(SessionConfig::default(), true)
            .await
            .unwrap();
        assert_eq!(server.state().await, ServerState::Started);
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.target(), format!("grpc://localhost:{}", addr.port()));
        server.stop().await;
        server.join().await;
    }

    #[tokio::test]
    async fn created_server_does_not_bind() {
        let server = Server::create_local(SessionConfig::default(), false)
            .await
            .unwrap();
        assert_eq!(server.state().await, ServerState::Created);
        assert!(server.local_addr().is_none());
        assert_eq!(server.target(), "grpc://localhost:0");

        server.start().await.unwrap();
        server.start().await.unwrap();
        assert!(server.local_addr().is_some());
    }

    #[tokio::test]
    async fn stopped_server_cannot_restart() {
        let server = Server::create_local(SessionConfig::default(), true)
            .await
            .unwrap();
        server.stop().await;
        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(matches!(
            server.start().await,
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn sparse_cluster_server_uses_inferred_task() {
        let cluster =
            ClusterSpec::new([("local", JobTasks::sparse([(37, "localhost:0")]))]).unwrap();
        let server = Server::from_cluster(cluster, None, None, SessionConfig::default(), true)
            .await
            .unwrap();
        assert_eq!(server.server_def().task_index, 37);
        assert_eq!(server.status().await.task_index, 37);
    }

    #[test]
    fn missing_port_is_rejected_at_construction() {
        let err = ClusterSpec::new([("local", ["localhost"])]).unwrap_err();
        assert!(err.to_string().contains("port"));
    }
}
