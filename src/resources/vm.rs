//! Virtual machine resource handler.
//!
//! Drives the full VM lifecycle: launch and wait until running, apply
//! field changes in dependency order, terminate and wait until gone.
//! Changing `vm_type` requires the machine to be stopped, so that change
//! expands into three steps: stop and wait, modify, restart and wait.
//! The remaining update steps (security groups, tags) apply in place.
//!
//! ### Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `image_id` | Yes | Image to launch from |
//! | `vm_type` | No | Machine size (default: t2.small) |
//! | `keypair_name` | No | SSH key pair to install |
//! | `subnet_id` | No | Subnet to launch into |
//! | `security_group_ids` | No | Security group IDs (exclusive with `nics`) |
//! | `nics` | No | Explicit network interface specs (exclusive with `security_group_ids`) |
//! | `user_data` | No | Boot script, plain text; encoded on the wire automatically |
//! | `placement_zone` | No | Subregion to place the machine in |
//! | `placement_tenancy` | No | Tenancy: default, dedicated (default: default) |
//! | `tags` | No | Tags as key-value pairs |
//! | `termination_protection` | No | Refuse deletion while true (default: false) |
//!
//! ### Example
//!
//! ```rust,ignore
//! use stratoform::resources::Registry;
//! use stratoform::state::ResourceData;
//! use serde_json::json;
//!
//! let registry = Registry::with_builtins(api)?;
//! let vm = registry.get("vm").unwrap();
//! let data = ResourceData::new()
//!     .with("image_id", json!("img-0abcdef12"))
//!     .with("vm_type", json!("t2.medium"))
//!     .with("tags", json!({"Name": "web-01"}));
//! let applied = vm.create(data, &cancel).await?;
//! ```

use std::sync::Arc;

use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{delete_action, fetch_one, submit_action, tag_specs, tags_step, StatusWait, TagSpec};
use crate::client::{pluck_str, CloudApi};
use crate::driver::{LifecycleDriver, UpdateStep};
use crate::error::{Error, Result};
use crate::hooks::{CallFrame, HookSet, Phase};
use crate::output::EntityState;
use crate::poll::{OnAbsent, PollTarget};
use crate::state::{EntityHandle, ResourceData};

/// VM lifecycle states as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
    Unknown(String),
}

impl VmState {
    fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The wire spelling of the state.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Error => "error",
            Self::Unknown(other) => other,
        }
    }
}

/// VM configuration parsed from declared fields.
#[derive(Debug, Clone)]
struct VmConfig {
    image_id: String,
    vm_type: String,
    keypair_name: Option<String>,
    subnet_id: Option<String>,
    security_group_ids: Vec<String>,
    nics: Vec<Value>,
    user_data: Option<String>,
    placement_zone: Option<String>,
    placement_tenancy: Option<String>,
    tags: Vec<TagSpec>,
}

impl VmConfig {
    fn from_data(data: &ResourceData) -> Result<Self> {
        let nics = match data.declared_raw("nics") {
            Some(Value::Array(nics)) => nics.clone(),
            Some(_) => {
                return Err(Error::invalid_field("nics", "expected a list of nic objects"));
            }
            None => Vec::new(),
        };

        Ok(Self {
            image_id: data.require_str("image_id")?,
            vm_type: data
                .declared_str("vm_type")?
                .unwrap_or_else(|| "t2.small".to_string()),
            keypair_name: data.declared_str("keypair_name")?,
            subnet_id: data.declared_str("subnet_id")?,
            security_group_ids: data.declared_vec_str("security_group_ids")?.unwrap_or_default(),
            nics,
            user_data: data.declared_str("user_data")?,
            placement_zone: data.declared_str("placement_zone")?,
            placement_tenancy: data.declared_str("placement_tenancy")?,
            tags: tag_specs(data)?,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PlacementSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    subregion_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenancy: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateVmRequest {
    image_id: String,
    vm_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    keypair_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    security_group_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    nics: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    placement: Option<PlacementSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<TagSpec>,
}

fn build_create_request(data: &ResourceData) -> Result<Value> {
    let config = VmConfig::from_data(data)?;
    let placement = if config.placement_zone.is_some() || config.placement_tenancy.is_some() {
        Some(PlacementSpec {
            subregion_name: config.placement_zone,
            tenancy: config.placement_tenancy,
        })
    } else {
        None
    };

    Ok(serde_json::to_value(CreateVmRequest {
        image_id: config.image_id,
        vm_type: config.vm_type,
        keypair_name: config.keypair_name,
        subnet_id: config.subnet_id,
        security_group_ids: config.security_group_ids,
        nics: config.nics,
        user_data: config.user_data,
        placement,
        tags: config.tags,
    })?)
}

/// Rejects requests declaring both flat security groups and explicit nics.
fn check_network_exclusivity(frame: &mut CallFrame) -> Result<()> {
    if frame.data.declared_raw("security_group_ids").is_some()
        && frame.data.declared_raw("nics").is_some()
    {
        return Err(Error::invalid_field(
            "nics",
            "security_group_ids and nics are mutually exclusive; attach groups to each nic instead",
        ));
    }
    Ok(())
}

/// Encodes the boot script for the wire. Declared user_data is plain text.
fn encode_user_data(frame: &mut CallFrame) -> Result<()> {
    if let Some(request) = frame.request.as_object_mut() {
        let encoded = request
            .get("UserData")
            .and_then(Value::as_str)
            .map(|plain| base64::engine::general_purpose::STANDARD.encode(plain));
        if let Some(encoded) = encoded {
            request.insert("UserData".to_string(), Value::String(encoded));
        }
    }
    Ok(())
}

/// Fills the tenancy default when a placement was given without one.
fn placement_defaults(frame: &mut CallFrame) -> Result<()> {
    if let Some(placement) = frame
        .request
        .get_mut("Placement")
        .and_then(Value::as_object_mut)
    {
        placement
            .entry("Tenancy".to_string())
            .or_insert_with(|| json!("default"));
    }
    Ok(())
}

/// Refuses deletion while termination protection is declared.
fn check_termination_protection(frame: &mut CallFrame) -> Result<()> {
    if frame
        .data
        .declared_bool("termination_protection")?
        .unwrap_or(false)
    {
        return Err(Error::invalid_field(
            "termination_protection",
            "disable termination protection before deleting this vm",
        ));
    }
    Ok(())
}

fn vm_status_wait(api: &Arc<dyn CloudApi>, target: PollTarget) -> StatusWait {
    StatusWait::new(Arc::clone(api), "ReadVms", "VmIds", "Vms", "/State", target)
}

fn stop_for_resize(api: &Arc<dyn CloudApi>) -> UpdateStep {
    UpdateStep::new(
        "stop-for-resize",
        ["vm_type"],
        Box::new(|_, handle| Ok(json!({ "VmId": handle.as_str() }))),
        submit_action(api, "StopVm"),
    )
    .with_after(Box::new(vm_status_wait(
        api,
        PollTarget::new("vm", OnAbsent::Fail)
            .target([VmState::Stopped.as_str()])
            .pending([VmState::Running.as_str(), VmState::Stopping.as_str()])
            .failure([VmState::Error.as_str()]),
    )))
}

fn modify_vm_type(api: &Arc<dyn CloudApi>) -> UpdateStep {
    UpdateStep::new(
        "vm-type",
        ["vm_type"],
        Box::new(|data, handle| {
            Ok(json!({
                "VmId": handle.as_str(),
                "VmType": data.require_str("vm_type")?,
            }))
        }),
        submit_action(api, "UpdateVm"),
    )
}

fn restart_after_resize(api: &Arc<dyn CloudApi>) -> UpdateStep {
    UpdateStep::new(
        "restart-after-resize",
        ["vm_type"],
        Box::new(|_, handle| Ok(json!({ "VmId": handle.as_str() }))),
        submit_action(api, "StartVm"),
    )
    .with_after(Box::new(vm_status_wait(
        api,
        PollTarget::new("vm", OnAbsent::Fail)
            .target([VmState::Running.as_str()])
            .pending([VmState::Stopped.as_str(), VmState::Pending.as_str()])
            .failure([VmState::Error.as_str()]),
    )))
}

fn update_security_groups(api: &Arc<dyn CloudApi>) -> UpdateStep {
    UpdateStep::new(
        "security-groups",
        ["security_group_ids"],
        Box::new(|data, handle| {
            Ok(json!({
                "VmId": handle.as_str(),
                "SecurityGroupIds": data.declared_vec_str("security_group_ids")?.unwrap_or_default(),
            }))
        }),
        submit_action(api, "UpdateVm"),
    )
}

/// Builds the VM lifecycle driver.
pub fn handler(api: Arc<dyn CloudApi>) -> Result<LifecycleDriver> {
    let mut hooks = HookSet::new();
    hooks.register_fn(Phase::PreCreate, "network-exclusivity", check_network_exclusivity);
    hooks.register_fn(Phase::PreCreate, "encode-user-data", encode_user_data);
    hooks.register_fn(Phase::PreCreate, "placement-defaults", placement_defaults);
    hooks.register(
        Phase::PostCreate,
        "wait-running",
        Box::new(vm_status_wait(
            &api,
            PollTarget::new("vm", OnAbsent::Fail)
                .target([VmState::Running.as_str()])
                .pending([VmState::Pending.as_str()])
                .failure([VmState::Error.as_str()]),
        )),
    );
    hooks.register_fn(Phase::PreDelete, "termination-protection", check_termination_protection);
    hooks.register(
        Phase::PostDelete,
        "wait-terminated",
        Box::new(vm_status_wait(
            &api,
            PollTarget::new("vm", OnAbsent::Done)
                .target([VmState::Terminated.as_str()])
                .pending([
                    VmState::Running.as_str(),
                    VmState::Stopping.as_str(),
                    VmState::Stopped.as_str(),
                    VmState::ShuttingDown.as_str(),
                ]),
        )),
    );

    LifecycleDriver::builder("vm")
        .hooks(hooks)
        .create(
            Box::new(build_create_request),
            submit_action(&api, "CreateVm"),
            Box::new(|response| {
                Ok(EntityHandle::new(pluck_str("CreateVm", response, "/Vm/VmId")?))
            }),
        )
        .read(fetch_one(&api, "ReadVms", "VmIds", "Vms"))
        .step(stop_for_resize(&api))
        .step(modify_vm_type(&api))
        .step(restart_after_resize(&api))
        .step(update_security_groups(&api))
        .step(tags_step(&api))
        .delete(delete_action(&api, "DeleteVm", "VmId"))
        .build()
}

/// Looks up VMs matching the declared filters.
///
/// Filters: `vm_ids`, `states`, and `tags` (matched as `key=value`
/// pairs). An empty result is not an error; list lookups may legitimately
/// match nothing.
pub async fn find_vms(api: &Arc<dyn CloudApi>, query: &ResourceData) -> Result<Vec<EntityState>> {
    let mut filters = serde_json::Map::new();
    if let Some(vm_ids) = query.declared_vec_str("vm_ids")? {
        filters.insert("VmIds".to_string(), json!(vm_ids));
    }
    if let Some(states) = query.declared_vec_str("states")? {
        for state in &states {
            if matches!(VmState::from_str(state), VmState::Unknown(_)) {
                return Err(Error::invalid_field(
                    "states",
                    format!("unknown vm state '{state}'"),
                ));
            }
        }
        filters.insert("States".to_string(), json!(states));
    }
    if let Some(tags) = query.declared_str_map("tags")? {
        let pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        filters.insert("Tags".to_string(), json!(pairs));
    }

    let response = api.call("ReadVms", json!({ "Filters": filters })).await?;
    let vms = match response.get("Vms").and_then(Value::as_array) {
        Some(vms) => vms.clone(),
        None => Vec::new(),
    };
    debug!(matched = vms.len(), "vm lookup complete");

    vms.iter()
        .map(|vm| {
            let id = pluck_str("ReadVms", vm, "/VmId")?;
            Ok(EntityState::from_entity(&EntityHandle::new(id), vm.clone()))
        })
        .collect()
}
