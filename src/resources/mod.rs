//! Resource handlers for the cloud API.
//!
//! Each submodule maps one cloud concept onto a [`LifecycleDriver`]:
//!
//! - [`vm`] - virtual machines, including the stop/modify/restart resize
//!   flow and a list-flavor lookup
//! - [`public_ip`] - elastic addresses and their VM attachment
//! - [`keypair`] - SSH key pairs with one-shot private key capture
//! - [`placement_group`] - placement groups
//! - [`reserved_instance`] - reserved capacity purchases
//! - [`image`] - machine images and the most-recent-image lookup
//!
//! The handlers share one wire convention: every action is a JSON POST,
//! describe actions filter with `{"Filters": {<IdField>: [id]}}` and
//! return a collection, and mutations address entities by their id
//! field. The helpers here fold that convention into the closure slots
//! the driver expects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::client::CloudApi;
use crate::driver::{DeleteFn, FetchFn, LifecycleDriver, SubmitFn, UpdateStep};
use crate::error::Result;
use crate::hooks::{CallFrame, Hook};
use crate::poll::PollTarget;
use crate::state::ResourceData;

pub mod image;
pub mod keypair;
pub mod placement_group;
pub mod public_ip;
pub mod reserved_instance;
pub mod vm;

/// Default interval between status probes.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Builds a submit closure posting `action` with the in-flight payload.
pub(crate) fn submit_action(api: &Arc<dyn CloudApi>, action: &'static str) -> SubmitFn {
    let api = Arc::clone(api);
    Box::new(move |payload| {
        let api = Arc::clone(&api);
        Box::pin(async move { api.call(action, payload).await })
    })
}

/// Builds a fetch closure describing one entity by id filter.
///
/// Returns the first element of the response collection, `None` when the
/// collection is empty or the API answers not-found.
pub(crate) fn fetch_one(
    api: &Arc<dyn CloudApi>,
    action: &'static str,
    filter_key: &'static str,
    collection: &'static str,
) -> FetchFn {
    let api = Arc::clone(api);
    Box::new(move |handle| {
        let api = Arc::clone(&api);
        Box::pin(async move {
            let mut filters = Map::new();
            filters.insert(filter_key.to_string(), json!([handle.as_str()]));
            match api.call(action, json!({ "Filters": filters })).await {
                Ok(response) => Ok(response.pointer(&format!("/{collection}/0")).cloned()),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
    })
}

/// Builds a delete closure addressing the entity by `id_key`.
pub(crate) fn delete_action(
    api: &Arc<dyn CloudApi>,
    action: &'static str,
    id_key: &'static str,
) -> DeleteFn {
    let api = Arc::clone(api);
    Box::new(move |handle| {
        let api = Arc::clone(&api);
        Box::pin(async move {
            let mut payload = Map::new();
            payload.insert(id_key.to_string(), json!(handle.as_str()));
            api.call(action, Value::Object(payload)).await
        })
    })
}

/// One tag on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct TagSpec {
    pub key: String,
    pub value: String,
}

pub(crate) fn tag_specs(data: &ResourceData) -> Result<Vec<TagSpec>> {
    Ok(data
        .declared_str_map("tags")?
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| TagSpec { key, value })
        .collect())
}

/// Update step re-tagging an entity when its declared tags changed.
pub(crate) fn tags_step(api: &Arc<dyn CloudApi>) -> UpdateStep {
    UpdateStep::new(
        "tags",
        ["tags"],
        Box::new(|data, handle| {
            Ok(json!({
                "ResourceIds": [handle.as_str()],
                "Tags": serde_json::to_value(tag_specs(data)?)?,
            }))
        }),
        submit_action(api, "CreateTags"),
    )
}

/// Hook polling an entity's status until it satisfies a [`PollTarget`].
///
/// Probes by describing the entity through the shared filter convention
/// and reading `status_pointer` off the first collection element. An
/// empty collection or a not-found answer counts as absence, which the
/// target's absence policy interprets.
pub struct StatusWait {
    api: Arc<dyn CloudApi>,
    action: &'static str,
    filter_key: &'static str,
    collection: &'static str,
    status_pointer: &'static str,
    target: PollTarget,
    interval: Duration,
}

impl StatusWait {
    /// Creates a status wait probing through `action`.
    pub fn new(
        api: Arc<dyn CloudApi>,
        action: &'static str,
        filter_key: &'static str,
        collection: &'static str,
        status_pointer: &'static str,
        target: PollTarget,
    ) -> Self {
        Self {
            api,
            action,
            filter_key,
            collection,
            status_pointer,
            target,
            interval: POLL_INTERVAL,
        }
    }

    /// Overrides the probe interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait::async_trait]
impl Hook for StatusWait {
    async fn run(&self, frame: &mut CallFrame) -> Result<()> {
        let handle = frame.handle()?.clone();
        let mut target = self.target.clone();
        target.entity = format!("{} '{}'", target.entity, handle);

        let (action, filter_key) = (self.action, self.filter_key);
        let (collection, status_pointer) = (self.collection, self.status_pointer);
        target
            .wait(self.interval, &frame.budget, || {
                let api = Arc::clone(&self.api);
                let handle = handle.clone();
                async move {
                    let mut filters = Map::new();
                    filters.insert(filter_key.to_string(), json!([handle.as_str()]));
                    let response = match api.call(action, json!({ "Filters": filters })).await {
                        Ok(response) => response,
                        Err(e) if e.is_not_found() => return Ok(None),
                        Err(e) => return Err(e),
                    };
                    let status = response
                        .pointer(&format!("/{collection}/0{status_pointer}"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string);
                    Ok(status)
                }
            })
            .await?;
        Ok(())
    }
}

/// Registry of lifecycle drivers keyed by resource type name.
pub struct Registry {
    handlers: RwLock<HashMap<String, Arc<LifecycleDriver>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with all built-in resource handlers.
    pub fn with_builtins(api: Arc<dyn CloudApi>) -> Result<Self> {
        let registry = Self::new();
        registry.register("vm", Arc::new(vm::handler(Arc::clone(&api))?));
        registry.register("public_ip", Arc::new(public_ip::handler(Arc::clone(&api))?));
        registry.register("keypair", Arc::new(keypair::handler(Arc::clone(&api))?));
        registry.register(
            "placement_group",
            Arc::new(placement_group::handler(Arc::clone(&api))?),
        );
        registry.register(
            "reserved_instance",
            Arc::new(reserved_instance::handler(Arc::clone(&api))?),
        );
        registry.register("image", Arc::new(image::handler(api)?));
        Ok(registry)
    }

    /// Registers a handler under a resource type name.
    pub fn register(&self, name: impl Into<String>, handler: Arc<LifecycleDriver>) {
        self.handlers.write().insert(name.into(), handler);
    }

    /// Gets a handler by resource type name.
    pub fn get(&self, name: &str) -> Option<Arc<LifecycleDriver>> {
        self.handlers.read().get(name).cloned()
    }

    /// Checks whether a resource type is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Lists registered resource type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EntityHandle;

    fn noop_driver(name: &str) -> LifecycleDriver {
        LifecycleDriver::builder(name)
            .create(
                Box::new(|_| Ok(json!({}))),
                Box::new(|_| Box::pin(async { Ok(json!({})) })),
                Box::new(|_| Ok(EntityHandle::new("x"))),
            )
            .read(Box::new(|_| Box::pin(async { Ok(None) })))
            .delete(Box::new(|_| Box::pin(async { Ok(json!({})) })))
            .build()
            .unwrap()
    }

    #[test]
    fn test_registry_lookup_and_listing() {
        let registry = Registry::new();
        registry.register("vm", Arc::new(noop_driver("vm")));
        registry.register("image", Arc::new(noop_driver("image")));

        assert!(registry.contains("vm"));
        assert!(!registry.contains("subnet"));
        assert_eq!(registry.get("image").unwrap().resource(), "image");
        assert_eq!(registry.names(), vec!["image".to_string(), "vm".to_string()]);
    }
}
