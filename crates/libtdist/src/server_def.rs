use tdist_proto::Message;
use tdist_proto::cluster::v1 as proto;
use tdist_protocol::{GRPC_PROTOCOL, SessionConfig};

use crate::cluster::{ClusterSpec, JobTasks};
use crate::error::{Error, Result};
use crate::text_format;

/// Identifies which task of a cluster a server process instantiates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDef {
    pub cluster: ClusterSpec,
    pub job_name: String,
    pub task_index: u32,
    pub protocol: String,
    pub default_session_config: SessionConfig,
}

impl ServerDef {
    pub fn new(
        cluster: ClusterSpec,
        job_name: impl Into<String>,
        task_index: u32,
        protocol: impl Into<String>,
    ) -> Result<Self> {
        let def = Self {
            cluster,
            job_name: job_name.into(),
            task_index,
            protocol: protocol.into(),
            default_session_config: SessionConfig::default(),
        };
        def.validate()?;
        Ok(def)
    }

    /// Build a def from a cluster, inferring the job when the cluster has a
    /// single job and the task when that job has a single task.
    pub fn from_cluster(
        cluster: ClusterSpec,
        job_name: Option<&str>,
        task_index: Option<u32>,
    ) -> Result<Self> {
        let job_name = match job_name {
            Some(name) => name.to_string(),
            None => {
                let mut jobs = cluster.jobs();
                match (jobs.next(), jobs.next()) {
                    (Some(only), None) => only.to_string(),
                    _ => {
                        return Err(Error::InvalidArgument(
                            "job_name must be given unless the cluster has exactly one job"
                                .to_string(),
                        ));
                    }
                }
            }
        };

        let task_index = match task_index {
            Some(index) => index,
            None => {
                let indices = cluster
                    .task_indices(&job_name)
                    .map_err(|e| Error::InvalidArgument(e.message()))?;
                match indices.as_slice() {
                    [only] => *only,
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "task_index must be given: job '{job_name}' has {} tasks",
                            indices.len()
                        )));
                    }
                }
            }
        };

        Self::new(cluster, job_name, task_index, GRPC_PROTOCOL)
    }

    /// Single-job, single-task def bound to an ephemeral local port.
    pub fn local(config: SessionConfig) -> Result<Self> {
        let cluster = ClusterSpec::new([("local", JobTasks::from(["localhost:0"]))])?;
        Ok(Self::new(cluster, "local", 0, GRPC_PROTOCOL)?.with_default_session_config(config))
    }

    pub fn with_default_session_config(mut self, config: SessionConfig) -> Self {
        self.default_session_config = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol != GRPC_PROTOCOL {
            return Err(Error::InvalidArgument(format!(
                "unsupported protocol '{}' (expected '{GRPC_PROTOCOL}')",
                self.protocol
            )));
        }
        self.cluster
            .task_address(&self.job_name, self.task_index)
            .map_err(|e| Error::InvalidArgument(e.message()))?;
        Ok(())
    }

    /// Address of the task this def instantiates.
    pub fn task_address(&self) -> Result<&str> {
        self.cluster
            .task_address(&self.job_name, self.task_index)
            .map_err(|e| Error::InvalidArgument(e.message()))
    }

    /// Record form, as carried in a serialized ServerDef.
    pub fn to_proto(&self) -> proto::ServerDef {
        let config = &self.default_session_config;
        proto::ServerDef {
            cluster: Some(self.cluster.as_cluster_def()),
            job_name: self.job_name.clone(),
            task_index: self.task_index,
            protocol: self.protocol.clone(),
            default_session_config: (!config.is_empty()).then(|| proto::SessionConfigDef {
                operation_timeout_in_ms: config.operation_timeout_in_ms,
                max_fetch_elements: config
                    .max_fetch_elements
                    .map(|max| u64::try_from(max).unwrap_or(u64::MAX)),
            }),
        }
    }

    pub fn from_proto(def: &proto::ServerDef) -> Result<Self> {
        let cluster = match &def.cluster {
            Some(cluster) => ClusterSpec::from_cluster_def(cluster)?,
            None => ClusterSpec::default(),
        };
        let protocol = if def.protocol.is_empty() {
            GRPC_PROTOCOL.to_string()
        } else {
            def.protocol.clone()
        };
        let default_session_config = match &def.default_session_config {
            Some(config) => SessionConfig {
                operation_timeout_in_ms: config.operation_timeout_in_ms,
                max_fetch_elements: config
                    .max_fetch_elements
                    .map(|max| {
                        usize::try_from(max).map_err(|_| {
                            Error::InvalidArgument(format!(
                                "max_fetch_elements {max} does not fit this platform"
                            ))
                        })
                    })
                    .transpose()?,
            },
            None => SessionConfig::default(),
        };

        let def = Self {
            cluster,
            job_name: def.job_name.clone(),
            task_index: def.task_index,
            protocol,
            default_session_config,
        };
        def.validate()?;
        Ok(def)
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    /// Decode and validate a serialized ServerDef.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let def = proto::ServerDef::decode(bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed ServerDef: {e}")))?;
        Self::from_proto(&def)
    }

    /// Canonical text form of the record.
    pub fn to_text(&self) -> String {
        text_format::server_def(&self.to_proto())
    }
}
