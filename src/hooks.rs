//! Extension points for resource-specific lifecycle behavior.
//!
//! The lifecycle driver owns the control flow; resource handlers inject
//! behavior at named phases: filling a request before it is sent, waiting
//! for a freshly created entity to become ready, cleaning up an
//! attachment before deletion. Hooks for a phase run in registration
//! order and the first failure short-circuits the rest.
//!
//! Hooks receive a [`CallFrame`], the typed per-invocation context. It is
//! owned by one lifecycle step and never shared across invocations, so
//! hooks may freely mutate the in-flight request or record computed
//! fields without synchronization.

use std::fmt;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::budget::Budget;
use crate::error::{Error, Result};
use crate::state::{EntityHandle, ResourceData};

/// Lifecycle phases a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before the create request is submitted.
    PreCreate,
    /// After the create call succeeded and the handle was extracted.
    PostCreate,
    /// After a describe returned a live entity.
    PostRead,
    /// Before an update step request is submitted.
    PreUpdate,
    /// After an update step settled.
    PostUpdate,
    /// Before the delete call is submitted.
    PreDelete,
    /// After the delete call succeeded.
    PostDelete,
    /// After the whole lifecycle step succeeded.
    OnSuccess,
    /// After the whole lifecycle step failed.
    OnError,
    /// After every lifecycle step, success or failure.
    OnExit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PreCreate => "pre-create",
            Phase::PostCreate => "post-create",
            Phase::PostRead => "post-read",
            Phase::PreUpdate => "pre-update",
            Phase::PostUpdate => "post-update",
            Phase::PreDelete => "pre-delete",
            Phase::PostDelete => "post-delete",
            Phase::OnSuccess => "on-success",
            Phase::OnError => "on-error",
            Phase::OnExit => "on-exit",
        };
        f.write_str(name)
    }
}

/// Kind of lifecycle step a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Create a new entity.
    Create,
    /// Refresh local state from the remote entity.
    Read,
    /// Apply changed field groups to an existing entity.
    Update,
    /// Delete the entity.
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Create => "create",
            OpKind::Read => "read",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Typed per-invocation context passed to every hook.
#[derive(Debug)]
pub struct CallFrame {
    /// Which lifecycle step this frame belongs to.
    pub op: OpKind,
    /// Name of the update step currently running, if any.
    pub step: Option<String>,
    /// Declared, prior, and computed fields for the resource instance.
    pub data: ResourceData,
    /// The in-flight request payload. Pre-phase hooks may rewrite it.
    pub request: Value,
    /// The response payload, once the remote call has succeeded.
    pub response: Option<Value>,
    /// The entity handle, once assigned.
    pub handle: Option<EntityHandle>,
    /// Time budget for the current lifecycle step.
    pub budget: Budget,
    /// Failure description, set for on-error and on-exit hooks.
    pub error: Option<String>,
}

impl CallFrame {
    /// Creates a frame for one lifecycle step.
    pub fn new(op: OpKind, data: ResourceData, budget: Budget) -> Self {
        Self {
            op,
            step: None,
            data,
            request: Value::Null,
            response: None,
            handle: None,
            budget,
            error: None,
        }
    }

    /// Returns the assigned handle.
    ///
    /// Fails if the driver has not assigned one yet; hooks before handle
    /// extraction must not call this.
    pub fn handle(&self) -> Result<&EntityHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Internal("no entity handle assigned in this frame".to_string()))
    }

    /// Returns the recorded response payload.
    pub fn response(&self) -> Result<&Value> {
        self.response
            .as_ref()
            .ok_or_else(|| Error::Internal("no response recorded in this frame".to_string()))
    }
}

/// A resource-specific extension run at a lifecycle phase.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Runs the hook against the current frame.
    async fn run(&self, frame: &mut CallFrame) -> Result<()>;
}

/// Adapter turning a synchronous closure into a [`Hook`].
struct SyncHook<F>(F);

#[async_trait]
impl<F> Hook for SyncHook<F>
where
    F: Fn(&mut CallFrame) -> Result<()> + Send + Sync,
{
    async fn run(&self, frame: &mut CallFrame) -> Result<()> {
        (self.0)(frame)
    }
}

struct NamedHook {
    name: String,
    hook: Box<dyn Hook>,
}

/// Ordered hook registrations keyed by phase.
///
/// A resource handler populates one set at construction time; the
/// lifecycle driver invokes [`HookSet::run`] at each fixed point. A phase
/// with no registrations is a no-op.
#[derive(Default)]
pub struct HookSet {
    slots: IndexMap<Phase, Vec<NamedHook>>,
}

impl HookSet {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook at the end of a phase's execution order.
    pub fn register(&mut self, phase: Phase, name: impl Into<String>, hook: Box<dyn Hook>) {
        self.slots.entry(phase).or_default().push(NamedHook {
            name: name.into(),
            hook,
        });
    }

    /// Registers a synchronous closure as a hook.
    pub fn register_fn<F>(&mut self, phase: Phase, name: impl Into<String>, f: F)
    where
        F: Fn(&mut CallFrame) -> Result<()> + Send + Sync + 'static,
    {
        self.register(phase, name, Box::new(SyncHook(f)));
    }

    /// Returns true if any hook is registered for `phase`.
    pub fn has_hooks(&self, phase: Phase) -> bool {
        self.slots.get(&phase).is_some_and(|hooks| !hooks.is_empty())
    }

    /// Runs the hooks registered for `phase`, in registration order.
    ///
    /// The first error aborts the remaining hooks of the phase and
    /// propagates unchanged. Completed phases are never re-run by the
    /// driver, and this method never retries a hook.
    pub async fn run(&self, phase: Phase, frame: &mut CallFrame) -> Result<()> {
        let Some(hooks) = self.slots.get(&phase) else {
            return Ok(());
        };
        for named in hooks {
            debug!(phase = %phase, hook = %named.name, op = %frame.op, "running hook");
            if let Err(e) = named.hook.run(frame).await {
                debug!(phase = %phase, hook = %named.name, error = %e, "hook failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (phase, hooks) in &self.slots {
            map.entry(
                &phase.to_string(),
                &hooks.iter().map(|h| h.name.as_str()).collect::<Vec<_>>(),
            );
        }
        map.finish()
    }
}
