//! Placement group resource handler.
//!
//! The smallest handler: placement groups are created, described, and
//! deleted, with no status waits and no update steps. Every field change
//! means replacing the group.
//!
//! ### Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `placement_group_name` | Yes | Group name, also the entity handle |
//! | `strategy` | No | Spread strategy: cluster, spread (default: cluster) |

use std::sync::Arc;

use serde_json::{json, Value};

use super::{delete_action, fetch_one, submit_action};
use crate::client::{pluck_str, CloudApi};
use crate::driver::LifecycleDriver;
use crate::error::{Error, Result};
use crate::hooks::{CallFrame, HookSet, Phase};
use crate::state::{EntityHandle, ResourceData};

const STRATEGIES: [&str; 2] = ["cluster", "spread"];

fn build_create_request(data: &ResourceData) -> Result<Value> {
    Ok(json!({
        "PlacementGroupName": data.require_str("placement_group_name")?,
        "Strategy": data
            .declared_str("strategy")?
            .unwrap_or_else(|| "cluster".to_string()),
    }))
}

/// Normalizes the declared strategy to its wire spelling and rejects
/// unknown ones.
fn normalize_strategy(frame: &mut CallFrame) -> Result<()> {
    let Some(request) = frame.request.as_object_mut() else {
        return Ok(());
    };
    let Some(declared) = request.get("Strategy").and_then(Value::as_str) else {
        return Ok(());
    };

    let normalized = declared.to_lowercase();
    if !STRATEGIES.contains(&normalized.as_str()) {
        return Err(Error::invalid_field(
            "strategy",
            format!("unknown strategy '{declared}'; expected one of {STRATEGIES:?}"),
        ));
    }
    request.insert("Strategy".to_string(), json!(normalized));
    Ok(())
}

/// Builds the placement group lifecycle driver.
pub fn handler(api: Arc<dyn CloudApi>) -> Result<LifecycleDriver> {
    let mut hooks = HookSet::new();
    hooks.register_fn(Phase::PreCreate, "normalize-strategy", normalize_strategy);

    LifecycleDriver::builder("placement_group")
        .hooks(hooks)
        .create(
            Box::new(build_create_request),
            submit_action(&api, "CreatePlacementGroup"),
            Box::new(|response| {
                Ok(EntityHandle::new(pluck_str(
                    "CreatePlacementGroup",
                    response,
                    "/PlacementGroup/PlacementGroupName",
                )?))
            }),
        )
        .read(fetch_one(
            &api,
            "ReadPlacementGroups",
            "PlacementGroupNames",
            "PlacementGroups",
        ))
        .delete(delete_action(
            &api,
            "DeletePlacementGroup",
            "PlacementGroupName",
        ))
        .build()
}
