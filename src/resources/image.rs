//! Machine image resource handler.
//!
//! Images are captured from a running VM and become usable only after
//! the backend finishes snapshotting, so creation waits for the
//! pending to available transition and treats `failed` as terminal.
//! Only tags can change after creation.
//!
//! The module also hosts the image lookup used by data sources: exact
//! name and state filters are pushed to the API, `name_regex` filters
//! client-side, and `most_recent` disambiguates multiple matches by
//! creation date. An ambiguous match without `most_recent` is an error
//! rather than an arbitrary pick.
//!
//! ### Parameters
//!
//! | Parameter | Required | Description |
//! |-----------|----------|-------------|
//! | `image_name` | Yes | Image name |
//! | `vm_id` | Yes | VM to capture the image from |
//! | `description` | No | Free-form description |
//! | `no_reboot` | No | Capture without stopping the VM (default: false) |
//! | `tags` | No | Tags as key-value pairs |

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{delete_action, fetch_one, submit_action, tags_step, StatusWait};
use crate::client::{pluck_str, CloudApi};
use crate::driver::LifecycleDriver;
use crate::error::{Error, Result};
use crate::hooks::{HookSet, Phase};
use crate::output::EntityState;
use crate::poll::{OnAbsent, PollTarget};
use crate::state::{EntityHandle, ResourceData};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateImageRequest {
    image_name: String,
    vm_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_reboot: Option<bool>,
}

fn build_create_request(data: &ResourceData) -> Result<Value> {
    Ok(serde_json::to_value(CreateImageRequest {
        image_name: data.require_str("image_name")?,
        vm_id: data.require_str("vm_id")?,
        description: data.declared_str("description")?,
        no_reboot: data.declared_bool("no_reboot")?,
    })?)
}

/// Builds the image lifecycle driver.
pub fn handler(api: Arc<dyn CloudApi>) -> Result<LifecycleDriver> {
    let mut hooks = HookSet::new();
    hooks.register(
        Phase::PostCreate,
        "wait-available",
        Box::new(StatusWait::new(
            Arc::clone(&api),
            "ReadImages",
            "ImageIds",
            "Images",
            "/State",
            PollTarget::new("image", OnAbsent::Fail)
                .target(["available"])
                .pending(["pending"])
                .failure(["failed"])
                .timeout(Duration::from_secs(600)),
        )),
    );

    LifecycleDriver::builder("image")
        .hooks(hooks)
        .create(
            Box::new(build_create_request),
            submit_action(&api, "CreateImage"),
            Box::new(|response| {
                Ok(EntityHandle::new(pluck_str(
                    "CreateImage",
                    response,
                    "/Image/ImageId",
                )?))
            }),
        )
        .read(fetch_one(&api, "ReadImages", "ImageIds", "Images"))
        .step(tags_step(&api))
        .delete(delete_action(&api, "DeleteImage", "ImageId"))
        .build()
}

fn creation_date(image: &Value) -> Option<DateTime<chrono::FixedOffset>> {
    image
        .get("CreationDate")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

/// Looks up exactly one image.
///
/// Filters: `image_name` and `states` are pushed to the API,
/// `name_regex` filters the result client-side. When several images
/// remain, `most_recent` picks the newest by creation date; without it
/// the ambiguity is an error. No match at all is [`Error::NotFound`].
pub async fn find_image(api: &Arc<dyn CloudApi>, query: &ResourceData) -> Result<EntityState> {
    let mut filters = serde_json::Map::new();
    if let Some(name) = query.declared_str("image_name")? {
        filters.insert("ImageNames".to_string(), json!([name]));
    }
    if let Some(states) = query.declared_vec_str("states")? {
        filters.insert("States".to_string(), json!(states));
    }

    let name_regex = match query.declared_str("name_regex")? {
        Some(pattern) => Some(
            Regex::new(&pattern)
                .map_err(|e| Error::invalid_field("name_regex", e.to_string()))?,
        ),
        None => None,
    };

    let response = api.call("ReadImages", json!({ "Filters": filters })).await?;
    let mut images: Vec<Value> = response
        .get("Images")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if let Some(regex) = &name_regex {
        images.retain(|image| {
            image
                .get("ImageName")
                .and_then(Value::as_str)
                .is_some_and(|name| regex.is_match(name))
        });
    }
    debug!(matched = images.len(), "image lookup complete");

    let image = match images.len() {
        0 => return Err(Error::not_found("image matching the given filters")),
        1 => images.remove(0),
        n => {
            if !query.declared_bool("most_recent")?.unwrap_or(false) {
                return Err(Error::invalid_field(
                    "most_recent",
                    format!("{n} images matched; narrow the filters or set most_recent"),
                ));
            }
            images
                .into_iter()
                .max_by_key(creation_date)
                .ok_or_else(|| Error::not_found("image matching the given filters"))?
        }
    };

    let id = pluck_str("ReadImages", &image, "/ImageId")?;
    Ok(EntityState::from_entity(&EntityHandle::new(id), image))
}
