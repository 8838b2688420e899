pub mod target;
pub mod tensor;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use target::{AddressError, GRPC_PROTOCOL, Target, parse_address};
pub use tensor::{MAX_TENSOR_ELEMENTS, Tensor, element_count};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single JSON line on the wire.
pub const MAX_JSON_LINE_BYTES: usize = 256 * 1024 * 1024;

/// Opaque server-assigned session identifier.
pub type SessionHandle = String;

/// Client-to-server requests sent as JSON lines over TCP.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        #[serde(default)]
        config: SessionConfig,
    },
    ExtendSession {
        session_handle: SessionHandle,
        nodes: Vec<NodeDef>,
    },
    RunStep {
        session_handle: SessionHandle,
        #[serde(default)]
        feeds: BTreeMap<String, Tensor>,
        #[serde(default)]
        fetches: Vec<String>,
        #[serde(default)]
        targets: Vec<String>,
    },
    CloseSession {
        session_handle: SessionHandle,
    },
    /// Release the named containers; an empty list means every container.
    Reset {
        #[serde(default)]
        containers: Vec<String>,
    },
    Status,
    Shutdown,
}

/// A request tagged with a connection-local id echoed back in the response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello {
        protocol_version: u32,
        job_name: String,
        task_index: u32,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: Response,
}

/// Status codes shared by the server and its clients.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Aborted,
    DeadlineExceeded,
    Cancelled,
    Unavailable,
    ResourceExhausted,
    Internal,
}

/// Per-session configuration. Fields left unset inherit the server default.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for each network-facing call; `0` or unset means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_in_ms: Option<u64>,
    /// Upper bound on the total number of fetched elements per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fetch_elements: Option<usize>,
}

impl SessionConfig {
    pub fn with_operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_in_ms = Some(ms);
        self
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_in_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Overlay `self` on top of `base`: set fields win.
    pub fn merged_over(&self, base: &SessionConfig) -> SessionConfig {
        SessionConfig {
            operation_timeout_in_ms: self.operation_timeout_in_ms.or(base.operation_timeout_in_ms),
            max_fetch_elements: self.max_fetch_elements.or(base.max_fetch_elements),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &SessionConfig::default()
    }
}

/// One node of a computation graph. Inputs prefixed with `^` are control
/// dependencies and carry no value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub name: String,
    pub op: Op,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Placement constraint of the form `/job:<name>/task:<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl NodeDef {
    pub fn data_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|input| !input.starts_with('^'))
            .map(String::as_str)
    }

    pub fn control_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|input| input.strip_prefix('^'))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Const {
        value: Tensor,
    },
    Placeholder {
        #[serde(default)]
        shape: Option<Vec<usize>>,
    },
    Fill {
        shape: Vec<usize>,
        value: f32,
    },
    Variable {
        #[serde(default)]
        container: String,
        #[serde(default)]
        shared_name: String,
    },
    Assign,
    Identity,
    Add,
    Shape,
    ReduceMin,
    ReduceMax,
    NoOp,
    FifoQueue {
        capacity: usize,
        #[serde(default)]
        container: String,
        #[serde(default)]
        shared_name: String,
    },
    Enqueue,
    Dequeue,
    QueueSize,
}

impl Op {
    /// Number of data inputs the op consumes.
    pub fn arity(&self) -> usize {
        match self {
            Op::Const { .. }
            | Op::Placeholder { .. }
            | Op::Fill { .. }
            | Op::Variable { .. }
            | Op::FifoQueue { .. }
            | Op::NoOp => 0,
            Op::Identity
            | Op::Shape
            | Op::ReduceMin
            | Op::ReduceMax
            | Op::Dequeue
            | Op::QueueSize => 1,
            Op::Assign | Op::Add | Op::Enqueue => 2,
        }
    }
}

/// Payload of a successful `CreateSession`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionCreated {
    pub session_handle: SessionHandle,
}

/// Payload of a successful `RunStep`; one tensor per fetch, in order.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunStepResult {
    pub tensors: Vec<Tensor>,
}

/// Payload of a successful `Reset`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResetResult {
    /// Containers that existed and were cleared.
    pub cleared: Vec<String>,
    pub released_resources: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub resources: Vec<String>,
}

/// Payload of a successful `Status`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerStatus {
    pub job_name: String,
    pub task_index: u32,
    pub protocol: String,
    pub session_count: usize,
    pub default_container: String,
    pub containers: Vec<ContainerSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tag_format() {
        let req = Request::Status;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"cmd":"status"}"#);
    }

    #[test]
    fn run_step_defaults() {
        let json = r#"{"cmd":"run_step","session_handle":"s1"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::RunStep {
                session_handle,
                feeds,
                fetches,
                targets,
            } => {
                assert_eq!(session_handle, "s1");
                assert!(feeds.is_empty());
                assert!(fetches.is_empty());
                assert!(targets.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reset_without_containers_means_all() {
        let req: Request = serde_json::from_str(r#"{"cmd":"reset"}"#).unwrap();
        match req {
            Request::Reset { containers } => assert!(containers.is_empty()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn frame_wraps_request() {
        let frame = RequestFrame {
            id: 7,
            request: Request::CloseSession {
                session_handle: "abc".to_string(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""id":7"#));
        assert!(json.contains("close_session"));
    }

    #[test]
    fn response_error_uses_snake_case_code() {
        let resp = Response::error(ErrorCode::FailedPrecondition, "uninitialized");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("failed_precondition"));
        match serde_json::from_str::<Response>(&json).unwrap() {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::FailedPrecondition);
                assert_eq!(message, "uninitialized");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn node_def_splits_control_inputs() {
        let node = NodeDef {
            name: "init".to_string(),
            op: Op::NoOp,
            inputs: vec!["^a".to_string(), "b".to_string(), "^c".to_string()],
            device: None,
        };
        assert_eq!(node.data_inputs().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(node.control_inputs().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn variable_op_defaults_to_default_container() {
        let json = r#"{"name":"v0","op":{"kind":"variable"}}"#;
        let node: NodeDef = serde_json::from_str(json).unwrap();
        match node.op {
            Op::Variable {
                container,
                shared_name,
            } => {
                assert!(container.is_empty());
                assert!(shared_name.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn session_config_merge_prefers_explicit_fields() {
        let server = SessionConfig {
            operation_timeout_in_ms: Some(1000),
            max_fetch_elements: Some(10),
        };
        let client = SessionConfig::default().with_operation_timeout_ms(5);
        let merged = client.merged_over(&server);
        assert_eq!(merged.operation_timeout_in_ms, Some(5));
        assert_eq!(merged.max_fetch_elements, Some(10));
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let config = SessionConfig::default().with_operation_timeout_ms(0);
        assert!(config.operation_timeout().is_none());
        let config = SessionConfig::default().with_operation_timeout_ms(5);
        assert_eq!(config.operation_timeout(), Some(Duration::from_millis(5)));
    }
}
