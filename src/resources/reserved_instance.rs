//! Reserved instance resource handler.
//!
//! Reservations are purchased, not provisioned: the purchase settles
//! synchronously and the capacity has no mutable fields, so the handler
//! carries no status waits and no update steps. Deleting a reservation
//! cancels the remaining commitment.
//!
//! ### Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `vm_type` | Yes | VM type the capacity is reserved for |
//! | `vm_count` | No | Number of reserved slots (default: 1) |
//! | `term_months` | No | Commitment length: 12 or 36 (default: 12) |
//! | `subregion_name` | No | Subregion the capacity is pinned to |

use std::sync::Arc;

use serde_json::{json, Value};

use super::{delete_action, fetch_one, submit_action};
use crate::client::{pluck_str, CloudApi};
use crate::driver::LifecycleDriver;
use crate::error::{Error, Result};
use crate::hooks::{CallFrame, HookSet, Phase};
use crate::state::{EntityHandle, ResourceData};

const TERMS: [i64; 2] = [12, 36];

fn build_create_request(data: &ResourceData) -> Result<Value> {
    let mut request = json!({
        "VmType": data.require_str("vm_type")?,
        "VmCount": data.declared_i64("vm_count")?.unwrap_or(1),
        "TermMonths": data.declared_i64("term_months")?.unwrap_or(12),
    });
    if let Some(subregion) = data.declared_str("subregion_name")? {
        request["SubregionName"] = json!(subregion);
    }
    Ok(request)
}

/// Rejects commitments the capacity API does not sell.
fn check_commitment(frame: &mut CallFrame) -> Result<()> {
    let Some(request) = frame.request.as_object() else {
        return Ok(());
    };
    if let Some(count) = request.get("VmCount").and_then(Value::as_i64) {
        if count < 1 {
            return Err(Error::invalid_field(
                "vm_count",
                format!("must reserve at least one slot, got {count}"),
            ));
        }
    }
    if let Some(term) = request.get("TermMonths").and_then(Value::as_i64) {
        if !TERMS.contains(&term) {
            return Err(Error::invalid_field(
                "term_months",
                format!("unsupported term {term}; expected one of {TERMS:?}"),
            ));
        }
    }
    Ok(())
}

/// Builds the reserved instance lifecycle driver.
pub fn handler(api: Arc<dyn CloudApi>) -> Result<LifecycleDriver> {
    let mut hooks = HookSet::new();
    hooks.register_fn(Phase::PreCreate, "check-commitment", check_commitment);

    LifecycleDriver::builder("reserved_instance")
        .hooks(hooks)
        .create(
            Box::new(build_create_request),
            submit_action(&api, "PurchaseReservedVm"),
            Box::new(|response| {
                Ok(EntityHandle::new(pluck_str(
                    "PurchaseReservedVm",
                    response,
                    "/ReservedVm/ReservedVmId",
                )?))
            }),
        )
        .read(fetch_one(
            &api,
            "ReadReservedVms",
            "ReservedVmIds",
            "ReservedVms",
        ))
        .delete(delete_action(&api, "DeleteReservedVm", "ReservedVmId"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::hooks::OpKind;

    fn frame_with_request(request: Value) -> CallFrame {
        let mut frame = CallFrame::new(OpKind::Create, ResourceData::new(), Budget::unbounded());
        frame.request = request;
        frame
    }

    #[test]
    fn test_purchase_request_carries_defaults() {
        let request =
            build_create_request(&ResourceData::new().with("vm_type", json!("m4.large"))).unwrap();
        assert_eq!(request["VmType"], json!("m4.large"));
        assert_eq!(request["VmCount"], json!(1));
        assert_eq!(request["TermMonths"], json!(12));
        assert!(request.get("SubregionName").is_none());
    }

    #[test]
    fn test_zero_count_is_rejected() {
        let mut frame = frame_with_request(json!({"VmCount": 0}));
        assert!(matches!(
            check_commitment(&mut frame),
            Err(Error::InvalidField { field, .. }) if field == "vm_count"
        ));
    }

    #[test]
    fn test_unsupported_term_is_rejected() {
        let mut frame = frame_with_request(json!({"TermMonths": 24}));
        assert!(matches!(
            check_commitment(&mut frame),
            Err(Error::InvalidField { field, .. }) if field == "term_months"
        ));
    }
}
