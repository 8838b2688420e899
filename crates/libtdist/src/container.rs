use std::collections::BTreeMap;
use std::sync::Arc;

use tdist_protocol::{ContainerSummary, ResetResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceKey, ResourceSpec};

#[derive(Default)]
struct Container {
    resources: BTreeMap<String, Arc<Resource>>,
}

/// Per-server mapping from container name to the resources created in it.
///
/// The default container is addressed by the empty name and stored under
/// the server's job name; it always exists.
pub struct ContainerRegistry {
    default_container: String,
    containers: Mutex<BTreeMap<String, Container>>,
}

impl ContainerRegistry {
    pub fn new(default_container: impl Into<String>) -> Self {
        let default_container = default_container.into();
        let mut containers = BTreeMap::new();
        containers.insert(default_container.clone(), Container::default());
        Self {
            default_container,
            containers: Mutex::new(containers),
        }
    }

    pub fn default_container(&self) -> &str {
        &self.default_container
    }

    /// Map the empty container name onto the default container.
    pub fn resolve_container<'a>(&'a self, name: &'a str) -> &'a str {
        if name.is_empty() {
            &self.default_container
        } else {
            name
        }
    }

    /// Look up `key`, creating an empty resource on first use.
    pub async fn lookup_or_create(
        &self,
        key: &ResourceKey,
        spec: ResourceSpec,
    ) -> Result<Arc<Resource>> {
        let mut containers = self.containers.lock().await;
        let container = containers.entry(key.container.clone()).or_default();
        if let Some(existing) = container.resources.get(&key.name) {
            if !existing.matches(spec) {
                return Err(Error::InvalidArgument(format!(
                    "resource {key} already exists as an incompatible {}",
                    existing.kind_name()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let resource = Arc::new(Resource::new(key.clone(), spec));
        container
            .resources
            .insert(key.name.clone(), Arc::clone(&resource));
        debug!(resource = %key, kind = resource.kind_name(), "resource created");
        Ok(resource)
    }

    pub async fn lookup(&self, key: &ResourceKey) -> Option<Arc<Resource>> {
        self.containers
            .lock()
            .await
            .get(&key.container)
            .and_then(|c| c.resources.get(&key.name))
            .cloned()
    }

    /// Release every resource of the named containers (all containers when
    /// `names` is empty). Unknown names are ignored.
    ///
    /// The registry lock is held for the whole reset, so lookups racing with
    /// it resolve either to the old resources (then observe the release) or
    /// to fresh ones created afterwards.
    pub async fn reset(&self, names: &[String]) -> ResetResult {
        let mut containers = self.containers.lock().await;

        let targets: Vec<String> = if names.is_empty() {
            containers.keys().cloned().collect()
        } else {
            let mut wanted: Vec<String> = names
                .iter()
                .map(|n| self.resolve_container(n).to_string())
                .filter(|n| containers.contains_key(n))
                .collect();
            wanted.sort();
            wanted.dedup();
            wanted
        };

        let mut released_resources = 0;
        for name in &targets {
            let Some(container) = containers.remove(name) else {
                continue;
            };
            for resource in container.resources.values() {
                resource.release().await;
                released_resources += 1;
            }
        }
        containers
            .entry(self.default_container.clone())
            .or_default();

        info!(
            containers = ?targets,
            released = released_resources,
            "containers reset"
        );
        ResetResult {
            cleared: targets,
            released_resources,
        }
    }

    pub async fn summary(&self) -> Vec<ContainerSummary> {
        self.containers
            .lock()
            .await
            .iter()
            .map(|(name, container)| ContainerSummary {
                name: name.clone(),
                resources: container.resources.keys().cloned().collect(),
            })
            .collect()
    }
}
