use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tdist_protocol::Tensor;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fully-qualified resource name: owning container plus resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub container: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// What kind of resource a graph node wants when it resolves a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSpec {
    Variable,
    Queue { capacity: usize },
}

/// Server-side state owned by exactly one container.
pub struct Resource {
    key: ResourceKey,
    released: AtomicBool,
    kind: ResourceKind,
}

pub enum ResourceKind {
    Variable(Variable),
    Queue(FifoQueue),
}

impl Resource {
    pub fn new(key: ResourceKey, spec: ResourceSpec) -> Self {
        let kind = match spec {
            ResourceSpec::Variable => ResourceKind::Variable(Variable::new()),
            ResourceSpec::Queue { capacity } => ResourceKind::Queue(FifoQueue::new(capacity)),
        };
        Self {
            key,
            released: AtomicBool::new(false),
            kind,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ResourceKind::Variable(_) => "variable",
            ResourceKind::Queue(_) => "queue",
        }
    }

    /// Whether this resource satisfies `spec` (same kind, same capacity).
    pub fn matches(&self, spec: ResourceSpec) -> bool {
        match (&self.kind, spec) {
            (ResourceKind::Variable(_), ResourceSpec::Variable) => true,
            (ResourceKind::Queue(q), ResourceSpec::Queue { capacity }) => q.capacity == capacity,
            _ => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn as_variable(&self) -> Result<&Variable> {
        match &self.kind {
            ResourceKind::Variable(v) => Ok(v),
            ResourceKind::Queue(_) => Err(Error::InvalidArgument(format!(
                "resource '{}' is a queue, not a variable",
                self.key
            ))),
        }
    }

    pub fn as_queue(&self) -> Result<&FifoQueue> {
        match &self.kind {
            ResourceKind::Queue(q) => Ok(q),
            ResourceKind::Variable(_) => Err(Error::InvalidArgument(format!(
                "resource '{}' is a variable, not a queue",
                self.key
            ))),
        }
    }

    pub async fn read_variable(&self) -> Result<Tensor> {
        self.as_variable()?.read(&self.key).await
    }

    pub async fn assign_variable(&self, value: Tensor) -> Result<()> {
        self.as_variable()?.assign(&self.key, value).await
    }

    /// Drop the backing state. Waits for in-flight operations on this
    /// resource to finish, so every later operation observes the release.
    pub async fn release(&self) {
        match &self.kind {
            ResourceKind::Variable(v) => v.release().await,
            ResourceKind::Queue(q) => q.release().await,
        }
        self.released.store(true, Ordering::Release);
    }
}

enum VariableState {
    Uninitialized,
    Ready(Tensor),
    Released,
}

pub struct Variable {
    state: RwLock<VariableState>,
}

impl Variable {
    fn new() -> Self {
        Self {
            state: RwLock::new(VariableState::Uninitialized),
        }
    }

    async fn read(&self, key: &ResourceKey) -> Result<Tensor> {
        match &*self.state.read().await {
            VariableState::Ready(value) => Ok(value.clone()),
            VariableState::Uninitialized => Err(Error::FailedPrecondition(format!(
                "attempting to use uninitialized value {key}"
            ))),
            VariableState::Released => Err(released(key)),
        }
    }

    async fn assign(&self, key: &ResourceKey, value: Tensor) -> Result<()> {
        let mut state = self.state.write().await;
        if matches!(*state, VariableState::Released) {
            return Err(released(key));
        }
        *state = VariableState::Ready(value);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(*self.state.read().await, VariableState::Ready(_))
    }

    async fn release(&self) {
        *self.state.write().await = VariableState::Released;
    }
}

struct QueueState {
    items: VecDeque<Tensor>,
    released: bool,
}

/// Bounded FIFO queue. Blocked producers and consumers wait without holding
/// the state lock.
pub struct FifoQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl FifoQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                released: false,
            }),
            changed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn enqueue(
        &self,
        key: &ResourceKey,
        value: Tensor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut value = Some(value);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.released {
                    return Err(released(key));
                }
                if state.items.len() < self.capacity {
                    if let Some(value) = value.take() {
                        state.items.push_back(value);
                    }
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("enqueue to {key} was cancelled")));
                }
            }
        }
    }

    pub async fn dequeue(&self, key: &ResourceKey, cancel: &CancellationToken) -> Result<Tensor> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.released {
                    return Err(released(key));
                }
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(item);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("dequeue from {key} was cancelled")));
                }
            }
        }
    }

    pub async fn size(&self, key: &ResourceKey) -> Result<usize> {
        let state = self.state.lock().await;
        if state.released {
            return Err(released(key));
        }
        Ok(state.items.len())
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        state.released = true;
        state.items.clear();
        drop(state);
        self.changed.notify_waiters();
    }
}

fn released(key: &ResourceKey) -> Error {
    Error::Aborted(format!(
        "resource {key} was released by a container reset"
    ))
}
