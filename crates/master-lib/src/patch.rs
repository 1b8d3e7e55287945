//! Node status patch operations
//!
//! Extended resources live in the node's `status.capacity` and
//! `status.allocatable` maps. Changes are expressed as JSON Patch (RFC 6902)
//! operations and sent to the object store as one batch.

use crate::error::StoreError;
use crate::models::qualify_label;
use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON Patch verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchVerb {
    Add,
    Replace,
    Remove,
}

/// Status subtree an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    Capacity,
    Allocatable,
}

impl StatusField {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusField::Capacity => "capacity",
            StatusField::Allocatable => "allocatable",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "capacity" => Some(StatusField::Capacity),
            "allocatable" => Some(StatusField::Allocatable),
            _ => None,
        }
    }
}

impl fmt::Display for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation against a node's status subtree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOp {
    pub op: PatchVerb,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl StatusOp {
    /// Build an operation for `resource`, qualifying bare names with the label namespace.
    pub fn new(op: PatchVerb, resource: &str, field: StatusField, value: Option<&str>) -> Self {
        let resource = qualify_label(resource);
        Self {
            op,
            path: format!("/status/{}/{}", field, escape_pointer(&resource)),
            value: value.map(str::to_string),
        }
    }

    pub fn add(resource: &str, field: StatusField, value: &str) -> Self {
        Self::new(PatchVerb::Add, resource, field, Some(value))
    }

    pub fn replace(resource: &str, field: StatusField, value: &str) -> Self {
        Self::new(PatchVerb::Replace, resource, field, Some(value))
    }

    pub fn remove(resource: &str, field: StatusField) -> Self {
        Self::new(PatchVerb::Remove, resource, field, None)
    }

    /// Decompose the path back into the status field and the qualified resource name.
    pub fn target(&self) -> Result<(StatusField, String), StoreError> {
        let invalid = || StoreError::InvalidPatch(self.path.clone());

        let rest = self.path.strip_prefix("/status/").ok_or_else(invalid)?;
        let (field, resource) = rest.split_once('/').ok_or_else(invalid)?;
        let field = StatusField::parse(field).ok_or_else(invalid)?;
        if resource.is_empty() || resource.contains('/') {
            return Err(invalid());
        }
        Ok((field, unescape_pointer(resource)))
    }
}

/// Convert a batch of operations into a JSON Patch document.
pub fn to_json_patch(ops: &[StatusOp]) -> Result<json_patch::Patch, StoreError> {
    let value = serde_json::to_value(ops).map_err(|e| StoreError::InvalidPatch(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| StoreError::InvalidPatch(e.to_string()))
}

/// Escape a JSON pointer reference token.
pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_pointer(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}
