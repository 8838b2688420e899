use std::sync::Arc;

use serde::Serialize;
use tdist_protocol::{
    ErrorCode, Request, Response, ResponseFrame, RunStepResult, ServerStatus, SessionCreated,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::server_def::ServerDef;
use crate::session::SessionManager;

/// Serves decoded requests against one server's sessions and containers.
pub struct Dispatcher {
    manager: Arc<SessionManager>,
    server_def: ServerDef,
    allow_remote_shutdown: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<SessionManager>,
        server_def: ServerDef,
        allow_remote_shutdown: bool,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            manager,
            server_def,
            allow_remote_shutdown,
            shutdown_tx,
        }
    }

    pub fn hello(&self) -> Response {
        Response::Hello {
            protocol_version: tdist_protocol::PROTOCOL_VERSION,
            job_name: self.server_def.job_name.clone(),
            task_index: self.server_def.task_index,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(code = ?err.code(), "request failed: {err}");
                Response::error(err.code(), err.message())
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::CreateSession { config } => {
                let session_handle = self.manager.create_session(config).await?;
                ok_response(&SessionCreated { session_handle })
            }
            Request::ExtendSession {
                session_handle,
                nodes,
            } => {
                self.manager.extend_session(&session_handle, nodes).await?;
                Ok(Response::ok(None))
            }
            Request::RunStep {
                session_handle,
                feeds,
                fetches,
                targets,
            } => {
                let tensors = self
                    .manager
                    .run_step(&session_handle, feeds, fetches, targets)
                    .await?;
                ok_response(&RunStepResult { tensors })
            }
            Request::CloseSession { session_handle } => {
                self.manager.close_session(&session_handle).await;
                Ok(Response::ok(None))
            }
            Request::Reset { containers } => {
                // Runs to completion even if this connection goes away.
                let manager = Arc::clone(&self.manager);
                let result = tokio::spawn(async move { manager.reset(&containers).await })
                    .await
                    .map_err(|e| Error::Internal(format!("reset task failed: {e}")))?;
                ok_response(&result)
            }
            Request::Status => ok_response(&self.status().await),
            Request::Shutdown => {
                if !self.allow_remote_shutdown {
                    return Err(Error::FailedPrecondition(
                        "remote shutdown is disabled on this server".to_string(),
                    ));
                }
                info!("remote shutdown requested");
                self.shutdown_tx.send_replace(true);
                Ok(Response::ok(None))
            }
        }
    }

    pub async fn status(&self) -> ServerStatus {
        let registry = self.manager.registry();
        ServerStatus {
            job_name: self.server_def.job_name.clone(),
            task_index: self.server_def.task_index,
            protocol: self.server_def.protocol.clone(),
            session_count: self.manager.session_count().await,
            default_container: registry.default_container().to_string(),
            containers: registry.summary().await,
        }
    }
}

pub fn ok_response<T: Serialize>(payload: &T) -> Result<Response> {
    Ok(Response::ok(Some(serde_json::to_value(payload)?)))
}

/// Queue a frame for the connection writer without waiting.
pub fn enqueue_response(
    out_tx: &mpsc::Sender<ResponseFrame>,
    frame: ResponseFrame,
) -> Result<()> {
    match out_tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("client outbound queue full");
            Err(Error::Unavailable("client outbound queue full".to_string()))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(Error::Unavailable("connection closed".to_string()))
        }
    }
}

/// Response for a line that could not be decoded as a request.
pub fn invalid_request(err: &serde_json::Error) -> Response {
    Response::error(ErrorCode::InvalidArgument, format!("invalid request: {err}"))
}
