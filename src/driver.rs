//! Lifecycle orchestration for one resource type.
//!
//! Every resource handler follows the same canonical sequence: Create,
//! wait for ready, Read back; Update changed field groups in order, each
//! settling before the next; Delete, wait for gone. The driver owns that
//! control flow and composes the retry executor, the state poller (via
//! hooks), and the hook registry; resource-specific behavior is injected
//! through closures and [`Hook`] registrations.
//!
//! Failure semantics: terminal errors abort the current step and surface
//! verbatim; once a create has assigned a handle, later failures are
//! wrapped in [`Error::CreateIncomplete`] carrying that handle so the
//! caller can record the entity instead of orphaning it; update step
//! failures are wrapped in [`Error::UpdateFailed`] naming the step.
//! Partial progress is surfaced, never rolled back.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::Budget;
use crate::error::{Error, Result};
use crate::hooks::{CallFrame, Hook, HookSet, OpKind, Phase};
use crate::output::EntityState;
use crate::retry::RetryPolicy;
use crate::state::{EntityHandle, ResourceData};

/// Builds the create request payload from declared fields.
pub type BuildRequestFn = Box<dyn Fn(&ResourceData) -> Result<Value> + Send + Sync>;

/// Builds an update step request from declared fields and the handle.
pub type BuildStepFn = Box<dyn Fn(&ResourceData, &EntityHandle) -> Result<Value> + Send + Sync>;

/// Submits a request payload to the remote API.
pub type SubmitFn = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Extracts the durable handle from a create response.
pub type ExtractHandleFn = Box<dyn Fn(&Value) -> Result<EntityHandle> + Send + Sync>;

/// Fetches the remote view of the entity, `None` when it does not exist.
pub type FetchFn =
    Box<dyn Fn(EntityHandle) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// Submits the delete call for the entity.
pub type DeleteFn = Box<dyn Fn(EntityHandle) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Per-step wall-clock limits for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    /// Limit for create including its ready wait.
    #[serde(with = "humantime_serde")]
    pub create: Duration,
    /// Limit for a refresh read.
    #[serde(with = "humantime_serde")]
    pub read: Duration,
    /// Limit for all update steps together.
    #[serde(with = "humantime_serde")]
    pub update: Duration,
    /// Limit for delete including its gone wait.
    #[serde(with = "humantime_serde")]
    pub delete: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(600),
            read: Duration::from_secs(300),
            update: Duration::from_secs(600),
            delete: Duration::from_secs(600),
        }
    }
}

/// One independently applicable group of updatable fields.
///
/// A step runs only when at least one of its trigger fields changed, and
/// steps run strictly in registration order. The optional `after` hook
/// is the step's own settle wait, run once its submit succeeded.
pub struct UpdateStep {
    name: String,
    fields: Vec<String>,
    build: BuildStepFn,
    submit: SubmitFn,
    after: Option<Box<dyn Hook>>,
}

impl UpdateStep {
    /// Creates a step triggered by changes to `fields`.
    pub fn new<I, S>(name: impl Into<String>, fields: I, build: BuildStepFn, submit: SubmitFn) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            build,
            submit,
            after: None,
        }
    }

    /// Attaches the step's settle wait.
    pub fn with_after(mut self, after: Box<dyn Hook>) -> Self {
        self.after = Some(after);
        self
    }

    /// Returns the step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the trigger fields.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Result of a create or update, carrying the refreshed entity view.
#[derive(Debug)]
pub struct Applied {
    /// The entity's durable handle.
    pub handle: EntityHandle,
    /// Flattened remote state after the read-back.
    pub state: EntityState,
    /// Resource data including fields computed by hooks.
    pub data: ResourceData,
}

/// Result of a refresh read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The entity exists; local state was refreshed.
    Found(Applied),
    /// The entity no longer exists remotely. Not an error: the caller
    /// decides whether to recreate or to forget it.
    Absent,
}

/// Lifecycle driver for one resource type.
///
/// Built once per handler via [`LifecycleDriver::builder`] and shared;
/// each method drives one lifecycle step for one entity. Callers
/// serialize operations per entity; the driver adds no locking.
pub struct LifecycleDriver {
    resource: String,
    hooks: HookSet,
    retry: RetryPolicy,
    timeouts: StepTimeouts,
    build_create: BuildRequestFn,
    submit_create: SubmitFn,
    extract_handle: ExtractHandleFn,
    fetch: FetchFn,
    update_steps: Vec<UpdateStep>,
    submit_delete: DeleteFn,
}

impl std::fmt::Debug for LifecycleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleDriver")
            .field("resource", &self.resource)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl LifecycleDriver {
    /// Starts building a driver for `resource`.
    pub fn builder(resource: impl Into<String>) -> DriverBuilder {
        DriverBuilder::new(resource)
    }

    /// Returns the resource type name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Creates the entity and waits until it is ready.
    ///
    /// Sequence: build request, pre-create hooks, retrying submit, handle
    /// extraction, post-create hooks (ready waits), read-back, post-read
    /// hooks. Errors after handle extraction come back as
    /// [`Error::CreateIncomplete`] so the caller records the handle.
    pub async fn create(&self, data: ResourceData, cancel: &CancellationToken) -> Result<Applied> {
        let budget = Budget::with_deadline(cancel.clone(), self.timeouts.create);
        let mut frame = CallFrame::new(OpKind::Create, data, budget);
        info!(resource = %self.resource, "creating entity");

        let result = self.create_flow(&mut frame).await;
        let assigned = frame.handle.clone();
        let finished = self.finish(frame, result).await;
        match (finished, assigned) {
            (Err(e), Some(handle)) => {
                Err(Error::create_incomplete(&self.resource, handle.as_str(), e))
            }
            (other, _) => other,
        }
    }

    /// Refreshes local state from the remote entity.
    ///
    /// Absence is the distinguished [`ReadOutcome::Absent`], not an
    /// error. Post-read hooks run for found entities only.
    pub async fn read(
        &self,
        handle: &EntityHandle,
        data: ResourceData,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome> {
        let budget = Budget::with_deadline(cancel.clone(), self.timeouts.read);
        let mut frame = CallFrame::new(OpKind::Read, data, budget);
        frame.handle = Some(handle.clone());

        let result = self.read_flow(&mut frame).await;
        self.finish(frame, result).await
    }

    /// Applies changed field groups to the entity, in step order.
    ///
    /// Steps whose trigger fields are unchanged issue no remote calls.
    /// Each step settles (via its `after` wait) before the next starts;
    /// a failing step aborts the remainder and is wrapped in
    /// [`Error::UpdateFailed`]. Ends with a read-back.
    pub async fn update(
        &self,
        handle: &EntityHandle,
        data: ResourceData,
        cancel: &CancellationToken,
    ) -> Result<Applied> {
        let budget = Budget::with_deadline(cancel.clone(), self.timeouts.update);
        let mut frame = CallFrame::new(OpKind::Update, data, budget);
        frame.handle = Some(handle.clone());

        let result = self.update_flow(&mut frame).await;
        self.finish(frame, result).await
    }

    /// Deletes the entity and waits until it is gone.
    ///
    /// Idempotent: a remote not-found is success, and when the delete
    /// call fails ambiguously a verification read that confirms absence
    /// is also success. Any other failure surfaces the original error.
    pub async fn delete(
        &self,
        handle: &EntityHandle,
        data: ResourceData,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let budget = Budget::with_deadline(cancel.clone(), self.timeouts.delete);
        let mut frame = CallFrame::new(OpKind::Delete, data, budget);
        frame.handle = Some(handle.clone());

        let result = self.delete_flow(&mut frame).await;
        self.finish(frame, result).await
    }

    async fn create_flow(&self, frame: &mut CallFrame) -> Result<Applied> {
        frame.request = (self.build_create)(&frame.data)?;
        self.hooks.run(Phase::PreCreate, frame).await?;

        let label = format!("create {}", self.resource);
        let response = self
            .retry
            .execute(&label, &frame.budget, || {
                (self.submit_create)(frame.request.clone())
            })
            .await?;

        let handle = (self.extract_handle)(&response)?;
        info!(resource = %self.resource, handle = %handle, "entity created");
        frame.handle = Some(handle);
        frame.response = Some(response);

        self.hooks.run(Phase::PostCreate, frame).await?;
        self.read_back(frame).await
    }

    async fn read_flow(&self, frame: &mut CallFrame) -> Result<ReadOutcome> {
        let handle = frame.handle()?.clone();
        let label = format!("read {}", self.resource);
        let fetched = self
            .retry
            .execute(&label, &frame.budget, || (self.fetch)(handle.clone()))
            .await?;

        match fetched {
            None => {
                info!(resource = %self.resource, handle = %handle, "entity absent");
                Ok(ReadOutcome::Absent)
            }
            Some(raw) => {
                frame.response = Some(raw);
                self.hooks.run(Phase::PostRead, frame).await?;

                let raw = frame.response()?.clone();
                let mut state = EntityState::from_entity(&handle, raw);
                state.merge_computed(&frame.data);
                Ok(ReadOutcome::Found(Applied {
                    handle,
                    state,
                    data: frame.data.clone(),
                }))
            }
        }
    }

    async fn update_flow(&self, frame: &mut CallFrame) -> Result<Applied> {
        let handle = frame.handle()?.clone();

        for step in &self.update_steps {
            if !frame.data.any_changed(step.fields.iter()) {
                debug!(
                    resource = %self.resource,
                    step = %step.name,
                    "trigger fields unchanged, skipping step"
                );
                continue;
            }

            frame.step = Some(step.name.clone());
            let outcome = self.run_step(step, &handle, frame).await;
            frame.step = None;
            if let Err(e) = outcome {
                return Err(Error::update_failed(
                    &self.resource,
                    &step.name,
                    handle.as_str(),
                    e,
                ));
            }
        }

        self.read_back(frame).await
    }

    async fn run_step(
        &self,
        step: &UpdateStep,
        handle: &EntityHandle,
        frame: &mut CallFrame,
    ) -> Result<()> {
        info!(
            resource = %self.resource,
            step = %step.name,
            handle = %handle,
            "applying update step"
        );
        frame.request = (step.build)(&frame.data, handle)?;
        self.hooks.run(Phase::PreUpdate, frame).await?;

        let label = format!("update {} ({})", self.resource, step.name);
        let response = self
            .retry
            .execute(&label, &frame.budget, || (step.submit)(frame.request.clone()))
            .await?;
        frame.response = Some(response);

        if let Some(after) = &step.after {
            after.run(frame).await?;
        }
        self.hooks.run(Phase::PostUpdate, frame).await
    }

    async fn delete_flow(&self, frame: &mut CallFrame) -> Result<()> {
        let handle = frame.handle()?.clone();
        self.hooks.run(Phase::PreDelete, frame).await?;

        let label = format!("delete {}", self.resource);
        let outcome = self
            .retry
            .execute(&label, &frame.budget, || {
                (self.submit_delete)(handle.clone())
            })
            .await;

        match outcome {
            Ok(response) => {
                frame.response = Some(response);
            }
            Err(e) if e.is_not_found() => {
                info!(resource = %self.resource, handle = %handle, "entity already absent");
                return Ok(());
            }
            Err(e) => {
                // The call may have taken effect even though it failed;
                // one verification read decides.
                warn!(
                    resource = %self.resource,
                    handle = %handle,
                    error = %e,
                    "delete call failed, verifying remote state"
                );
                match (self.fetch)(handle.clone()).await {
                    Ok(None) => {
                        info!(
                            resource = %self.resource,
                            handle = %handle,
                            "entity confirmed absent after failed delete call"
                        );
                        return Ok(());
                    }
                    Ok(Some(_)) | Err(_) => return Err(e),
                }
            }
        }

        self.hooks.run(Phase::PostDelete, frame).await?;
        info!(resource = %self.resource, handle = %handle, "entity deleted");
        Ok(())
    }

    /// Reads the entity back after a mutation; absence here is an error.
    async fn read_back(&self, frame: &mut CallFrame) -> Result<Applied> {
        match self.read_flow(frame).await? {
            ReadOutcome::Found(applied) => Ok(applied),
            ReadOutcome::Absent => Err(Error::not_found(frame.handle()?.as_str())),
        }
    }

    /// Runs the terminal phases. On success, on-success and on-exit hook
    /// failures propagate; on failure they are logged and the original
    /// error wins.
    async fn finish<T>(&self, mut frame: CallFrame, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.hooks.run(Phase::OnSuccess, &mut frame).await?;
                self.hooks.run(Phase::OnExit, &mut frame).await?;
                Ok(value)
            }
            Err(e) => {
                frame.error = Some(e.to_string());
                if let Err(hook_err) = self.hooks.run(Phase::OnError, &mut frame).await {
                    warn!(resource = %self.resource, error = %hook_err, "on-error hook failed");
                }
                if let Err(hook_err) = self.hooks.run(Phase::OnExit, &mut frame).await {
                    warn!(resource = %self.resource, error = %hook_err, "on-exit hook failed");
                }
                Err(e)
            }
        }
    }
}

/// Builder for [`LifecycleDriver`].
pub struct DriverBuilder {
    resource: String,
    hooks: HookSet,
    retry: RetryPolicy,
    timeouts: StepTimeouts,
    build_create: Option<BuildRequestFn>,
    submit_create: Option<SubmitFn>,
    extract_handle: Option<ExtractHandleFn>,
    fetch: Option<FetchFn>,
    update_steps: Vec<UpdateStep>,
    submit_delete: Option<DeleteFn>,
}

impl DriverBuilder {
    /// Creates a builder with default retry and timeout settings.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            hooks: HookSet::new(),
            retry: RetryPolicy::default(),
            timeouts: StepTimeouts::default(),
            build_create: None,
            submit_create: None,
            extract_handle: None,
            fetch: None,
            update_steps: Vec::new(),
            submit_delete: None,
        }
    }

    /// Sets the hook registrations.
    pub fn hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    /// Sets the retry policy shared by all remote calls.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the per-step timeouts.
    pub fn timeouts(mut self, timeouts: StepTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the create operation.
    pub fn create(
        mut self,
        build: BuildRequestFn,
        submit: SubmitFn,
        extract: ExtractHandleFn,
    ) -> Self {
        self.build_create = Some(build);
        self.submit_create = Some(submit);
        self.extract_handle = Some(extract);
        self
    }

    /// Sets the read operation.
    pub fn read(mut self, fetch: FetchFn) -> Self {
        self.fetch = Some(fetch);
        self
    }

    /// Appends an update step; order of calls is execution order.
    pub fn step(mut self, step: UpdateStep) -> Self {
        self.update_steps.push(step);
        self
    }

    /// Sets the delete operation.
    pub fn delete(mut self, submit: DeleteFn) -> Self {
        self.submit_delete = Some(submit);
        self
    }

    /// Builds the driver, checking that every operation is wired.
    pub fn build(self) -> Result<LifecycleDriver> {
        let missing = |what: &str, resource: &str| {
            Error::Internal(format!("lifecycle driver for '{resource}' is missing its {what}"))
        };
        Ok(LifecycleDriver {
            build_create: self
                .build_create
                .ok_or_else(|| missing("create request builder", &self.resource))?,
            submit_create: self
                .submit_create
                .ok_or_else(|| missing("create submit", &self.resource))?,
            extract_handle: self
                .extract_handle
                .ok_or_else(|| missing("handle extractor", &self.resource))?,
            fetch: self
                .fetch
                .ok_or_else(|| missing("read operation", &self.resource))?,
            submit_delete: self
                .submit_delete
                .ok_or_else(|| missing("delete operation", &self.resource))?,
            resource: self.resource,
            hooks: self.hooks,
            retry: self.retry,
            timeouts: self.timeouts,
            update_steps: self.update_steps,
        })
    }
}
