//! Integration tests for the hook extension points.
//!
//! Covers:
//! - Which phases fire for each lifecycle operation
//! - Pre-phase request rewrites reaching the wire
//! - Computed fields merged into the final state
//! - Step settle hooks running before the post-update phase
//! - Operation and step labels visible on the call frame

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::ScriptedApi;
use stratoform::client::{pluck_str, CloudApi};
use stratoform::driver::{DeleteFn, FetchFn, LifecycleDriver, SubmitFn, UpdateStep};
use stratoform::error::Result;
use stratoform::hooks::{CallFrame, Hook, HookSet, OpKind, Phase};
use stratoform::retry::RetryPolicy;
use stratoform::state::{EntityHandle, ResourceData};

const ALL_PHASES: [Phase; 10] = [
    Phase::PreCreate,
    Phase::PostCreate,
    Phase::PreUpdate,
    Phase::PostUpdate,
    Phase::PreDelete,
    Phase::PostDelete,
    Phase::PostRead,
    Phase::OnSuccess,
    Phase::OnError,
    Phase::OnExit,
];

fn submit_via(api: &Arc<ScriptedApi>, action: &'static str) -> SubmitFn {
    let api = Arc::clone(api);
    Box::new(move |payload| {
        let api = Arc::clone(&api);
        Box::pin(async move { api.call(action, payload).await })
    })
}

fn fetch_via(api: &Arc<ScriptedApi>) -> FetchFn {
    let api = Arc::clone(api);
    Box::new(move |handle| {
        let api = Arc::clone(&api);
        Box::pin(async move {
            let response = api
                .call("ReadVms", json!({"Filters": {"VmIds": [handle.as_str()]}}))
                .await?;
            Ok(response.pointer("/Vms/0").cloned())
        })
    })
}

fn delete_via(api: &Arc<ScriptedApi>) -> DeleteFn {
    let api = Arc::clone(api);
    Box::new(move |handle| {
        let api = Arc::clone(&api);
        Box::pin(async move {
            api.call("DeleteVm", json!({"VmId": handle.as_str()})).await
        })
    })
}

fn build_driver(api: &Arc<ScriptedApi>, hooks: HookSet, steps: Vec<UpdateStep>) -> LifecycleDriver {
    let mut builder = LifecycleDriver::builder("vm")
        .hooks(hooks)
        .retry(RetryPolicy::constant(
            Duration::from_secs(60),
            Duration::from_millis(10),
        ))
        .create(
            Box::new(|data| Ok(json!({"ImageId": data.require_str("image_id")?}))),
            submit_via(api, "CreateVm"),
            Box::new(|response| {
                Ok(EntityHandle::new(pluck_str("CreateVm", response, "/Vm/VmId")?))
            }),
        )
        .read(fetch_via(api))
        .delete(delete_via(api));
    for step in steps {
        builder = builder.step(step);
    }
    builder.build().unwrap()
}

fn recording_hooks(log: &Arc<Mutex<Vec<Phase>>>) -> HookSet {
    let mut hooks = HookSet::new();
    for phase in ALL_PHASES {
        let log = Arc::clone(log);
        hooks.register_fn(phase, "record", move |_frame| {
            log.lock().push(phase);
            Ok(())
        });
    }
    hooks
}

fn vm_type_step(api: &Arc<ScriptedApi>) -> UpdateStep {
    UpdateStep::new(
        "vm-type",
        ["vm_type"],
        Box::new(|data, handle| {
            Ok(json!({"VmId": handle.as_str(), "VmType": data.require_str("vm_type")?}))
        }),
        submit_via(api, "UpdateVm"),
    )
}

/// Hook pushing a fixed label onto a shared log.
struct PushLabel {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Hook for PushLabel {
    async fn run(&self, _frame: &mut CallFrame) -> Result<()> {
        self.log.lock().push(self.label);
        Ok(())
    }
}

// ==== SECTION 1: PHASES PER OPERATION ====

/// Update fires the update phases around each applied step.
#[tokio::test]
async fn test_update_fires_update_phases_around_the_step() {
    let api = Arc::new(ScriptedApi::new());
    api.script("UpdateVm", Ok(json!({})));
    api.script(
        "ReadVms",
        Ok(json!({"Vms": [{"VmId": "vm-1", "State": "running"}]})),
    );

    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = build_driver(&api, recording_hooks(&log), vec![vm_type_step(&api)]);
    let data = ResourceData::new()
        .with("vm_type", json!("m4.large"))
        .with_prior("vm_type", json!("t2.small"));

    driver
        .update(&EntityHandle::new("vm-1"), data, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            Phase::PreUpdate,
            Phase::PostUpdate,
            Phase::PostRead,
            Phase::OnSuccess,
            Phase::OnExit,
        ]
    );
}

/// Delete fires its phases and nothing create- or read-flavored.
#[tokio::test]
async fn test_delete_fires_delete_phases_only() {
    let api = Arc::new(ScriptedApi::new());
    api.script("DeleteVm", Ok(json!({})));

    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = build_driver(&api, recording_hooks(&log), Vec::new());

    driver
        .delete(
            &EntityHandle::new("vm-1"),
            ResourceData::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            Phase::PreDelete,
            Phase::PostDelete,
            Phase::OnSuccess,
            Phase::OnExit,
        ]
    );
}

/// Post-read fires for a found entity but not for an absent one.
#[tokio::test]
async fn test_post_read_fires_only_when_found() {
    let api = Arc::new(ScriptedApi::new());
    api.script(
        "ReadVms",
        Ok(json!({"Vms": [{"VmId": "vm-1", "State": "running"}]})),
    );
    api.script("ReadVms", Ok(json!({"Vms": []})));

    let log = Arc::new(Mutex::new(Vec::new()));
    let driver = build_driver(&api, recording_hooks(&log), Vec::new());
    let handle = EntityHandle::new("vm-1");

    driver
        .read(&handle, ResourceData::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        *log.lock(),
        vec![Phase::PostRead, Phase::OnSuccess, Phase::OnExit]
    );

    log.lock().clear();
    driver
        .read(&handle, ResourceData::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(*log.lock(), vec![Phase::OnSuccess, Phase::OnExit]);
}

// ==== SECTION 2: FRAME REWRITES ====

/// A pre-create hook edits the request and the edit reaches the wire.
#[tokio::test]
async fn test_pre_create_rewrite_reaches_the_wire() {
    let api = Arc::new(ScriptedApi::new());
    api.script("CreateVm", Ok(json!({"Vm": {"VmId": "vm-1"}})));
    api.script(
        "ReadVms",
        Ok(json!({"Vms": [{"VmId": "vm-1", "State": "running"}]})),
    );

    let mut hooks = HookSet::new();
    hooks.register_fn(Phase::PreCreate, "stamp-client-token", |frame| {
        if let Some(request) = frame.request.as_object_mut() {
            request.insert("ClientToken".to_string(), json!("token-1"));
        }
        Ok(())
    });

    let driver = build_driver(&api, hooks, Vec::new());
    let data = ResourceData::new().with("image_id", json!("img-1"));
    driver.create(data, &CancellationToken::new()).await.unwrap();

    let payload = api.payload_of("CreateVm").unwrap();
    assert_eq!(payload["ClientToken"], json!("token-1"));
    assert_eq!(payload["ImageId"], json!("img-1"));
}

/// A post-read hook computes fields that land in the final state.
#[tokio::test]
async fn test_post_read_computed_fields_merge_into_state() {
    let api = Arc::new(ScriptedApi::new());
    api.script(
        "ReadVms",
        Ok(json!({"Vms": [{"VmId": "vm-1", "State": "running", "PublicIp": "203.0.113.7"}]})),
    );

    let mut hooks = HookSet::new();
    hooks.register_fn(Phase::PostRead, "derive-endpoint", |frame| {
        let ip = frame
            .response()?
            .pointer("/PublicIp")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);
        if let Some(ip) = ip {
            frame.data.set_computed("endpoint", json!(format!("https://{ip}:8443")));
        }
        Ok(())
    });

    let driver = build_driver(&api, hooks, Vec::new());
    let outcome = driver
        .read(
            &EntityHandle::new("vm-1"),
            ResourceData::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match outcome {
        stratoform::driver::ReadOutcome::Found(applied) => {
            assert_eq!(applied.state.attr("endpoint"), Some("https://203.0.113.7:8443"));
        }
        other => panic!("expected a found entity, got {other:?}"),
    }
}

// ==== SECTION 3: STEP SETTLE ORDERING ====

/// A step's settle hook runs after its submit and before post-update.
#[tokio::test]
async fn test_step_settle_hook_runs_before_post_update() {
    let api = Arc::new(ScriptedApi::new());
    api.script("UpdateVm", Ok(json!({})));
    api.script(
        "ReadVms",
        Ok(json!({"Vms": [{"VmId": "vm-1", "State": "running"}]})),
    );

    let log = Arc::new(Mutex::new(Vec::new()));
    let step = vm_type_step(&api).with_after(Box::new(PushLabel {
        label: "settle",
        log: Arc::clone(&log),
    }));
    let mut hooks = HookSet::new();
    hooks.register(
        Phase::PostUpdate,
        "post",
        Box::new(PushLabel {
            label: "post-update",
            log: Arc::clone(&log),
        }),
    );

    let driver = build_driver(&api, hooks, vec![step]);
    let data = ResourceData::new()
        .with("vm_type", json!("m4.large"))
        .with_prior("vm_type", json!("t2.small"));
    driver
        .update(&EntityHandle::new("vm-1"), data, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*log.lock(), vec!["settle", "post-update"]);
}

// ==== SECTION 4: FRAME LABELS ====

/// Hooks can tell which operation and step they are running under.
#[tokio::test]
async fn test_frame_labels_identify_op_and_step() {
    let api = Arc::new(ScriptedApi::new());
    api.script("UpdateVm", Ok(json!({})));
    api.script(
        "ReadVms",
        Ok(json!({"Vms": [{"VmId": "vm-1", "State": "running"}]})),
    );

    let seen = Arc::new(Mutex::new(None));
    let mut hooks = HookSet::new();
    {
        let seen = Arc::clone(&seen);
        hooks.register_fn(Phase::PreUpdate, "observe", move |frame| {
            *seen.lock() = Some((frame.op, frame.step.clone()));
            Ok(())
        });
    }

    let driver = build_driver(&api, hooks, vec![vm_type_step(&api)]);
    let data = ResourceData::new()
        .with("vm_type", json!("m4.large"))
        .with_prior("vm_type", json!("t2.small"));
    driver
        .update(&EntityHandle::new("vm-1"), data, &CancellationToken::new())
        .await
        .unwrap();

    let seen = seen.lock();
    let (op, step) = seen.as_ref().unwrap();
    assert_eq!(*op, OpKind::Update);
    assert_eq!(step.as_deref(), Some("vm-type"));
}
