//! Public IP resource handler.
//!
//! Allocation is synchronous, so this handler has no status waits. The
//! interesting part is the attachment: a declared `vm_id` links the
//! address to that machine, clearing it unlinks, and deletion unlinks a
//! still-attached address first so the release cannot fail on a dangling
//! link.
//!
//! ### Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `vm_id` | No | VM to attach the address to; clear to detach |
//! | `tags` | No | Tags as key-value pairs |
//!
//! ### Example
//!
//! ```rust,ignore
//! let data = ResourceData::new().with("vm_id", json!("vm-0a1b2c"));
//! let applied = registry.get("public_ip").unwrap().create(data, &cancel).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{delete_action, fetch_one, submit_action, tag_specs, tags_step};
use crate::client::{pluck_str, CloudApi};
use crate::driver::{LifecycleDriver, SubmitFn, UpdateStep};
use crate::error::Result;
use crate::hooks::{CallFrame, Hook, HookSet, Phase};
use crate::state::{EntityHandle, ResourceData};

fn build_create_request(data: &ResourceData) -> Result<Value> {
    let tags = tag_specs(data)?;
    if tags.is_empty() {
        Ok(json!({}))
    } else {
        Ok(json!({ "Tags": serde_json::to_value(tags)? }))
    }
}

/// Submit closure for the attachment step.
///
/// The step's request declares the desired link: a payload carrying a
/// `VmId` links, one without unlinks. Dispatching on the payload shape
/// keeps link and unlink in a single ordered step.
fn attachment_submit(api: &Arc<dyn CloudApi>) -> SubmitFn {
    let api = Arc::clone(api);
    Box::new(move |payload| {
        let api = Arc::clone(&api);
        Box::pin(async move {
            let action = if payload.get("VmId").is_some() {
                "LinkPublicIp"
            } else {
                "UnlinkPublicIp"
            };
            api.call(action, payload).await
        })
    })
}

fn attachment_step(api: &Arc<dyn CloudApi>) -> UpdateStep {
    UpdateStep::new(
        "attachment",
        ["vm_id"],
        Box::new(|data, handle| match data.declared_str("vm_id")? {
            Some(vm_id) => Ok(json!({ "PublicIpId": handle.as_str(), "VmId": vm_id })),
            None => Ok(json!({ "PublicIpId": handle.as_str() })),
        }),
        attachment_submit(api),
    )
}

/// Links the address right after allocation when a `vm_id` was declared.
struct LinkOnCreate {
    api: Arc<dyn CloudApi>,
}

#[async_trait]
impl Hook for LinkOnCreate {
    async fn run(&self, frame: &mut CallFrame) -> Result<()> {
        let Some(vm_id) = frame.data.declared_str("vm_id")? else {
            return Ok(());
        };
        let handle = frame.handle()?.clone();
        info!(public_ip = %handle, vm_id = %vm_id, "linking address to vm");
        self.api
            .call(
                "LinkPublicIp",
                json!({ "PublicIpId": handle.as_str(), "VmId": vm_id }),
            )
            .await?;
        Ok(())
    }
}

/// Unlinks a still-attached address before releasing it.
///
/// The remote view decides whether a link exists; declared fields may be
/// stale by deletion time.
struct UnlinkOnDelete {
    api: Arc<dyn CloudApi>,
}

#[async_trait]
impl Hook for UnlinkOnDelete {
    async fn run(&self, frame: &mut CallFrame) -> Result<()> {
        let handle = frame.handle()?.clone();
        let response = match self
            .api
            .call(
                "ReadPublicIps",
                json!({ "Filters": { "PublicIpIds": [handle.as_str()] } }),
            )
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let attached_to = response
            .pointer("/PublicIps/0/VmId")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        if let Some(vm_id) = attached_to {
            info!(public_ip = %handle, vm_id = %vm_id, "unlinking address before release");
            self.api
                .call("UnlinkPublicIp", json!({ "PublicIpId": handle.as_str() }))
                .await?;
        }
        Ok(())
    }
}

/// Builds the public IP lifecycle driver.
pub fn handler(api: Arc<dyn CloudApi>) -> Result<LifecycleDriver> {
    let mut hooks = HookSet::new();
    hooks.register(
        Phase::PostCreate,
        "link-on-create",
        Box::new(LinkOnCreate {
            api: Arc::clone(&api),
        }),
    );
    hooks.register(
        Phase::PreDelete,
        "unlink-on-delete",
        Box::new(UnlinkOnDelete {
            api: Arc::clone(&api),
        }),
    );

    LifecycleDriver::builder("public_ip")
        .hooks(hooks)
        .create(
            Box::new(build_create_request),
            submit_action(&api, "CreatePublicIp"),
            Box::new(|response| {
                Ok(EntityHandle::new(pluck_str(
                    "CreatePublicIp",
                    response,
                    "/PublicIp/PublicIpId",
                )?))
            }),
        )
        .read(fetch_one(&api, "ReadPublicIps", "PublicIpIds", "PublicIps"))
        .step(attachment_step(&api))
        .step(tags_step(&api))
        .delete(delete_action(&api, "DeletePublicIp", "PublicIpId"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::client::MockCloudApi;
    use crate::hooks::OpKind;

    #[test]
    fn test_create_request_carries_tags_only_when_declared() {
        let bare = build_create_request(&ResourceData::new()).unwrap();
        assert_eq!(bare, json!({}));

        let tagged = build_create_request(
            &ResourceData::new().with("tags", json!({"Name": "nat-ip"})),
        )
        .unwrap();
        assert_eq!(tagged["Tags"][0]["Key"], json!("Name"));
    }

    #[test]
    fn test_attachment_request_shape_encodes_link_and_unlink() {
        let step = attachment_step(&(Arc::new(MockCloudApi::new()) as Arc<dyn CloudApi>));
        assert_eq!(step.name(), "attachment");
        assert_eq!(step.fields(), ["vm_id".to_string()]);
    }

    #[tokio::test]
    async fn test_unlink_on_delete_skips_detached_addresses() {
        let mut mock = MockCloudApi::new();
        mock.expect_call()
            .withf(|action, _| action == "ReadPublicIps")
            .times(1)
            .returning(|_, _| Ok(json!({"PublicIps": [{"PublicIpId": "ip-1"}]})));

        let hook = UnlinkOnDelete {
            api: Arc::new(mock),
        };
        let mut frame = CallFrame::new(OpKind::Delete, ResourceData::new(), Budget::unbounded());
        frame.handle = Some(EntityHandle::new("ip-1"));
        hook.run(&mut frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlink_on_delete_detaches_linked_addresses() {
        let mut mock = MockCloudApi::new();
        mock.expect_call()
            .withf(|action, _| action == "ReadPublicIps")
            .times(1)
            .returning(|_, _| {
                Ok(json!({"PublicIps": [{"PublicIpId": "ip-1", "VmId": "vm-9"}]}))
            });
        mock.expect_call()
            .withf(|action, payload| {
                action == "UnlinkPublicIp" && payload["PublicIpId"] == json!("ip-1")
            })
            .times(1)
            .returning(|_, _| Ok(json!({})));

        let hook = UnlinkOnDelete {
            api: Arc::new(mock),
        };
        let mut frame = CallFrame::new(OpKind::Delete, ResourceData::new(), Budget::unbounded());
        frame.handle = Some(EntityHandle::new("ip-1"));
        hook.run(&mut frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_link_on_create_is_a_no_op_without_vm_id() {
        let hook = LinkOnCreate {
            api: Arc::new(MockCloudApi::new()),
        };
        let mut frame = CallFrame::new(OpKind::Create, ResourceData::new(), Budget::unbounded());
        frame.handle = Some(EntityHandle::new("ip-1"));
        hook.run(&mut frame).await.unwrap();
    }
}
