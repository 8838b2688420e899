use std::collections::BTreeMap;

use tdist_proto::cluster::v1::{ClusterDef, JobDef};
use tdist_protocol::parse_address;

use crate::error::{Error, Result};
use crate::text_format;

/// Task addresses of one job, as supplied by a caller.
///
/// `Dense` assigns indices by position; `Sparse` uses explicit keys so jobs
/// may have holes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTasks {
    Dense(Vec<String>),
    Sparse(BTreeMap<i64, String>),
}

impl JobTasks {
    pub fn sparse<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        JobTasks::Sparse(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }

    /// Parse a command-line job `name=host:port,host:port` into a dense job.
    pub fn parse_arg(raw: &str) -> Result<(String, JobTasks)> {
        let (name, addresses) = raw.split_once('=').ok_or_else(|| {
            Error::InvalidArgument(format!(
                "invalid job '{raw}' (expected name=host:port,...)"
            ))
        })?;
        let addresses: Vec<&str> = addresses
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect();
        if addresses.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "job '{raw}' lists no addresses"
            )));
        }
        Ok((name.trim().to_string(), JobTasks::from(addresses)))
    }
}

impl<S: Into<String>> From<Vec<S>> for JobTasks {
    fn from(addresses: Vec<S>) -> Self {
        JobTasks::Dense(addresses.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for JobTasks {
    fn from(addresses: [S; N]) -> Self {
        JobTasks::Dense(addresses.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> From<BTreeMap<i64, S>> for JobTasks {
    fn from(entries: BTreeMap<i64, S>) -> Self {
        JobTasks::sparse(entries)
    }
}

/// Immutable description of every job and task in a cluster.
///
/// Two specs are equal iff they resolve to the same job → index → address
/// mapping, regardless of whether they were built from dense or sparse input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSpec {
    jobs: BTreeMap<String, BTreeMap<u32, String>>,
}

impl ClusterSpec {
    pub fn new<I, K, T>(jobs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<JobTasks>,
    {
        let mut resolved = BTreeMap::new();
        for (name, tasks) in jobs {
            let name = name.into();
            if name.is_empty() {
                return Err(Error::InvalidArgument("job name must not be empty".to_string()));
            }
            let tasks = normalize_tasks(&name, tasks.into())?;
            if resolved.insert(name.clone(), tasks).is_some() {
                return Err(Error::InvalidArgument(format!("job '{name}' is defined twice")));
            }
        }
        Ok(Self { jobs: resolved })
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Job names in lexicographic order.
    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    fn job(&self, job: &str) -> Result<&BTreeMap<u32, String>> {
        self.jobs
            .get(job)
            .ok_or_else(|| Error::NotFound(format!("no such job in cluster: '{job}'")))
    }

    pub fn num_tasks(&self, job: &str) -> Result<usize> {
        Ok(self.job(job)?.len())
    }

    /// Present task indices, ascending.
    pub fn task_indices(&self, job: &str) -> Result<Vec<u32>> {
        Ok(self.job(job)?.keys().copied().collect())
    }

    pub fn task_address(&self, job: &str, index: u32) -> Result<&str> {
        self.job(job)?
            .get(&index)
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(format!("no task {index} in job '{job}'")))
    }

    /// Dense view of a job, with `None` for holes up to the highest index.
    pub fn job_tasks(&self, job: &str) -> Result<Vec<Option<String>>> {
        let tasks = self.job(job)?;
        let Some(&max) = tasks.keys().next_back() else {
            return Ok(Vec::new());
        };
        Ok((0..=max).map(|i| tasks.get(&i).cloned()).collect())
    }

    /// Per-job description: dense when indices are exactly `0..n`.
    pub fn as_map(&self) -> BTreeMap<String, JobTasks> {
        self.jobs
            .iter()
            .map(|(name, tasks)| {
                let dense = tasks.keys().enumerate().all(|(pos, idx)| pos as u32 == *idx);
                let described = if dense {
                    JobTasks::Dense(tasks.values().cloned().collect())
                } else {
                    JobTasks::Sparse(tasks.iter().map(|(k, v)| (i64::from(*k), v.clone())).collect())
                };
                (name.clone(), described)
            })
            .collect()
    }

    /// Record form of the cluster, with jobs in lexicographic order.
    pub fn as_cluster_def(&self) -> ClusterDef {
        ClusterDef {
            job: self
                .jobs
                .iter()
                .map(|(name, tasks)| JobDef {
                    name: name.clone(),
                    tasks: tasks
                        .iter()
                        .map(|(index, address)| (*index, address.clone()))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Rebuild a spec from its record, validated like [`ClusterSpec::new`].
    pub fn from_cluster_def(def: &ClusterDef) -> Result<Self> {
        Self::new(def.job.iter().map(|job| {
            let tasks = job
                .tasks
                .iter()
                .map(|(index, address)| (i64::from(*index), address.clone()));
            (job.name.clone(), JobTasks::sparse(tasks))
        }))
    }

    /// Canonical text form: jobs lexicographic, tasks by ascending index.
    pub fn to_text(&self) -> String {
        text_format::cluster_def(&self.as_cluster_def())
    }
}

fn normalize_tasks(job: &str, tasks: JobTasks) -> Result<BTreeMap<u32, String>> {
    let entries: Vec<(i64, String)> = match tasks {
        JobTasks::Dense(addresses) => addresses
            .into_iter()
            .enumerate()
            .map(|(i, a)| (i as i64, a))
            .collect(),
        JobTasks::Sparse(entries) => entries.into_iter().collect(),
    };

    let mut out = BTreeMap::new();
    for (index, address) in entries {
        let index = u32::try_from(index).map_err(|_| {
            Error::InvalidArgument(format!("task index {index} of job '{job}' is out of range"))
        })?;
        parse_address(&address).map_err(|e| {
            Error::InvalidArgument(format!("job '{job}' task {index}: {e}"))
        })?;
        out.insert(index, address);
    }
    Ok(out)
}
