pub mod client;
pub mod cluster;
pub mod container;
pub mod error;
pub mod executor;
pub mod graph;
pub mod handler;
pub mod resource;
pub mod server;
pub mod server_def;
pub mod session;
mod text_format;

pub use client::{Connection, Session, resolve_target, server_status};
pub use cluster::{ClusterSpec, JobTasks};
pub use container::ContainerRegistry;
pub use error::{Error, Result};
pub use graph::{Graph, Output, Queue, Variable, device};
pub use handler::{Dispatcher, enqueue_response};
pub use server::{Server, ServerOptions, ServerState};
pub use server_def::ServerDef;
pub use session::{SessionManager, SessionManagerConfig};
pub use tdist_proto::cluster::v1::{ClusterDef, JobDef};
pub use tdist_protocol as protocol;
pub use tdist_protocol::{ErrorCode, ResetResult, ServerStatus, SessionConfig, Tensor};
