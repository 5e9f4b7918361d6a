//! Tag schema stamped on every created resource.
//!
//! Tags are how the reconciler recognizes its own resources across runs:
//! probes filter on the `Name` tag plus the stack tag, and teardown only
//! touches resources carrying them.

use chrono::Utc;
use std::collections::BTreeMap;

/// Marks a resource as managed by this tool.
pub const TOOL_TAG: &str = "converge:tool";
pub const TOOL_NAME: &str = "converge";

/// Names the stack the resource belongs to.
pub const STACK_TAG: &str = "converge:stack";

/// RFC 3339 creation timestamp.
pub const CREATED_AT_TAG: &str = "converge:created-at";

/// The `Name` tag carries the cloud-side resource name.
pub const NAME_TAG: &str = "Name";

/// Cloud-side name of a spec: the stack prefix keeps stacks from
/// colliding within one account.
pub fn cloud_name(stack: &str, logical_name: &str) -> String {
    format!("{stack}-{logical_name}")
}

/// Standard tag set for a resource of `stack` named `logical_name`.
pub fn standard_tags(stack: &str, logical_name: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(NAME_TAG.to_string(), cloud_name(stack, logical_name));
    tags.insert(TOOL_TAG.to_string(), TOOL_NAME.to_string());
    tags.insert(STACK_TAG.to_string(), stack.to_string());
    tags.insert(CREATED_AT_TAG.to_string(), Utc::now().to_rfc3339());
    tags
}
