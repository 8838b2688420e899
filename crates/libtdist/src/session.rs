use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tdist_protocol::{
    NodeDef, Op, ResetResult, SessionConfig, SessionHandle, Tensor, element_count,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::ContainerRegistry;
use crate::error::{Error, Result};
use crate::executor::{self, ExecutionContext, GraphNodes, ResourceCache};

/// Server-wide settings applied to every session.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub job_name: String,
    pub task_index: u32,
    pub default_session_config: SessionConfig,
    pub max_sessions: Option<usize>,
}

impl SessionManagerConfig {
    pub fn new(job_name: impl Into<String>, task_index: u32) -> Self {
        Self {
            job_name: job_name.into(),
            task_index,
            default_session_config: SessionConfig::default(),
            max_sessions: None,
        }
    }
}

struct ServerSession {
    handle: SessionHandle,
    config: SessionConfig,
    /// Replaced wholesale on extend so runs never wait on graph growth.
    graph: RwLock<Arc<GraphNodes>>,
    resources: ResourceCache,
    cancel: CancellationToken,
    aborted: AtomicBool,
}

impl ServerSession {
    fn abort_error(&self) -> Error {
        Error::Aborted(format!(
            "session {} lost its state to a container reset",
            self.handle
        ))
    }

    /// Whether any resource this session resolved has been released.
    async fn lost_resources(&self) -> bool {
        self.resources
            .lock()
            .await
            .values()
            .any(|resource| resource.is_released())
    }
}

/// Owns every session of a server and the containers they share.
pub struct SessionManager {
    config: SessionManagerConfig,
    registry: Arc<ContainerRegistry>,
    sessions: RwLock<HashMap<SessionHandle, Arc<ServerSession>>>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        let registry = Arc::new(ContainerRegistry::new(config.job_name.clone()));
        Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        if let Some(max) = self.config.max_sessions {
            if sessions.len() >= max {
                return Err(Error::ResourceExhausted(format!(
                    "server already has {max} open sessions"
                )));
            }
        }

        let handle = uuid::Uuid::new_v4().to_string();
        let config = config.merged_over(&self.config.default_session_config);
        let session = Arc::new(ServerSession {
            handle: handle.clone(),
            config,
            graph: RwLock::new(Arc::new(GraphNodes::new())),
            resources: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
        });
        sessions.insert(handle.clone(), session);
        info!(session = %handle, "session created");
        Ok(handle)
    }

    async fn session(&self, handle: &str) -> Result<Arc<ServerSession>> {
        self.sessions
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| {
                Error::Aborted(format!(
                    "session {handle} is not known to this server; it may have been closed"
                ))
            })
    }

    /// Add `nodes` to the session graph. The batch is validated as a whole
    /// and applied atomically.
    pub async fn extend_session(&self, handle: &str, nodes: Vec<NodeDef>) -> Result<()> {
        let session = self.session(handle).await?;
        let mut graph = session.graph.write().await;

        let mut added = 0usize;
        let mut next: Option<GraphNodes> = None;
        for node in nodes {
            self.validate_node(&node)?;
            let current = next.as_ref().unwrap_or(&**graph);
            if let Some(existing) = current.get(&node.name) {
                if existing == &node {
                    continue;
                }
                return Err(Error::InvalidArgument(format!(
                    "node '{}' already exists with a different definition",
                    node.name
                )));
            }
            next.get_or_insert_with(|| (**graph).clone())
                .insert(node.name.clone(), node);
            added += 1;
        }

        if let Some(next) = next {
            for node in next.values() {
                for input in node.data_inputs().chain(node.control_inputs()) {
                    if !next.contains_key(input) {
                        return Err(Error::InvalidArgument(format!(
                            "node '{}' has unknown input '{input}'",
                            node.name
                        )));
                    }
                }
            }
            *graph = Arc::new(next);
        }
        debug!(session = %handle, added, total = graph.len(), "session graph extended");
        Ok(())
    }

    fn validate_node(&self, node: &NodeDef) -> Result<()> {
        if node.name.is_empty() || node.name.starts_with('^') {
            return Err(Error::InvalidArgument(format!(
                "invalid node name '{}'",
                node.name
            )));
        }
        let arity = node.data_inputs().count();
        if arity != node.op.arity() {
            return Err(Error::InvalidArgument(format!(
                "node '{}' expects {} inputs, has {arity}",
                node.name,
                node.op.arity()
            )));
        }
        match &node.op {
            Op::Const { value } if !value.is_consistent() => {
                return Err(Error::InvalidArgument(format!(
                    "constant '{}' has {} values for shape {:?}",
                    node.name,
                    value.values.len(),
                    value.shape
                )));
            }
            Op::Fill { shape, .. } if element_count(shape).is_none() => {
                return Err(Error::InvalidArgument(format!(
                    "shape {shape:?} of '{}' overflows",
                    node.name
                )));
            }
            _ => {}
        }
        if let Some(device) = node.device.as_deref() {
            check_device(device, &self.config.job_name, self.config.task_index)
                .map_err(|e| Error::InvalidArgument(format!("node '{}': {e}", node.name)))?;
        }
        Ok(())
    }

    pub async fn run_step(
        &self,
        handle: &str,
        feeds: BTreeMap<String, Tensor>,
        fetches: Vec<String>,
        targets: Vec<String>,
    ) -> Result<Vec<Tensor>> {
        let session = self.session(handle).await?;
        if session.aborted.load(Ordering::Acquire) || session.lost_resources().await {
            session.aborted.store(true, Ordering::Release);
            return Err(session.abort_error());
        }

        let graph = Arc::clone(&*session.graph.read().await);
        let ctx = ExecutionContext {
            graph: &graph,
            registry: &self.registry,
            resources: &session.resources,
            cancel: &session.cancel,
            max_fetch_elements: session.config.max_fetch_elements,
        };

        let run = executor::execute(&ctx, feeds, &fetches, &targets);
        let result = match session.config.operation_timeout() {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded(format!(
                    "step did not complete within {}ms",
                    limit.as_millis()
                ))),
            },
            None => run.await,
        };

        if let Err(err) = &result {
            if matches!(err, Error::Aborted(_)) || session.lost_resources().await {
                session.aborted.store(true, Ordering::Release);
                return Err(session.abort_error());
            }
            debug!(session = %handle, code = ?err.code(), "step failed: {err}");
        }
        result
    }

    /// Close a session. Operations blocked inside it return `Cancelled`.
    /// Unknown handles are ignored; returns whether a session was closed.
    pub async fn close_session(&self, handle: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(handle) else {
            debug!(session = %handle, "close of unknown session ignored");
            return false;
        };
        session.cancel.cancel();
        info!(session = %handle, "session closed");
        true
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (handle, session) in drained {
            session.cancel.cancel();
            debug!(session = %handle, "session closed at shutdown");
        }
    }

    /// Reset containers and abort every session that held one of the
    /// released resources.
    pub async fn reset(&self, containers: &[String]) -> ResetResult {
        let result = self.registry.reset(containers).await;
        if result.released_resources == 0 {
            return result;
        }

        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if session.lost_resources().await && !session.aborted.swap(true, Ordering::AcqRel) {
                warn!(session = %session.handle, "session aborted by container reset");
            }
        }
        result
    }
}

/// Check a `/job:<name>/task:<index>` placement against this server.
fn check_device(device: &str, job_name: &str, task_index: u32) -> std::result::Result<(), String> {
    for part in device.split('/').filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| format!("malformed device '{device}'"))?;
        match key {
            "job" if value != job_name => {
                return Err(format!(
                    "device '{device}' names job '{value}' but this server is job '{job_name}'"
                ));
            }
            "task" => {
                let index: u32 = value
                    .parse()
                    .map_err(|_| format!("malformed task index in device '{device}'"))?;
                if index != task_index {
                    return Err(format!(
                        "device '{device}' names task {index} but this server is task {task_index}"
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
