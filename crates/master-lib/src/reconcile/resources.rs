//! Extended resource diffing against node status

use crate::models::{
    annotation_key, annotations, parse_key_list, qualify_label, ExtendedResources,
};
use crate::patch::{StatusField, StatusOp};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Extended resources published by the previous report, from the bookkeeping annotation.
pub fn previous_resources(node: &Node) -> Vec<String> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&annotation_key(annotations::EXTENDED_RESOURCES)))
        .map(|v| parse_key_list(v))
        .unwrap_or_default()
}

/// Compute the status operations that bring the node's capacity in line
/// with `extended_resources`.
///
/// Removals come first, then additions and replacements in resource order.
/// A resource already present with the same integer value yields nothing.
pub fn extended_resource_ops(node: &Node, extended_resources: &ExtendedResources) -> Vec<StatusOp> {
    let empty = BTreeMap::new();
    let capacity = node
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .unwrap_or(&empty);

    let mut ops = Vec::new();

    for resource in previous_resources(node) {
        if extended_resources.contains_key(&resource) {
            continue;
        }
        if capacity.contains_key(&qualify_label(&resource)) {
            ops.push(StatusOp::remove(&resource, StatusField::Capacity));
            ops.push(StatusOp::remove(&resource, StatusField::Allocatable));
        }
    }

    for (resource, value) in extended_resources {
        match capacity.get(&qualify_label(resource)) {
            Some(current) => {
                if !same_value(current, value) {
                    ops.push(StatusOp::replace(resource, StatusField::Capacity, value));
                    ops.push(StatusOp::replace(resource, StatusField::Allocatable, value));
                }
            }
            // Allocatable follows capacity implicitly on add
            None => ops.push(StatusOp::add(resource, StatusField::Capacity, value)),
        }
    }

    ops
}

fn same_value(current: &Quantity, value: &str) -> bool {
    match (quantity_to_i64(current), value.parse::<i64>()) {
        (Some(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Integer value of a resource quantity.
///
/// Accepts the serialized forms the API server produces: plain integers,
/// decimal SI suffixes (`m`, `k`, `M`, ..., `E`), binary SI suffixes (`Ki`,
/// ..., `Ei`) and decimal exponents (`1e3`). Returns `None` when the
/// quantity is malformed, fractional or out of `i64` range.
pub fn quantity_to_i64(quantity: &Quantity) -> Option<i64> {
    let s = quantity.0.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (negative, digits) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut mantissa: i128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        mantissa = mantissa
            .checked_mul(10)?
            .checked_add(i128::from(c.to_digit(10)?))?;
    }

    let (exp10, exp2): (i32, u32) = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        _ => {
            let exp = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            (exp.parse::<i32>().ok()?, 0)
        }
    };

    let exp10 = exp10.checked_sub(i32::try_from(fraction.len()).ok()?)?;
    let mut value = mantissa.checked_mul(1i128.checked_shl(exp2)?)?;
    if exp10 >= 0 {
        value = value.checked_mul(10i128.checked_pow(exp10.unsigned_abs())?)?;
    } else {
        let divisor = 10i128.checked_pow(exp10.unsigned_abs())?;
        if value % divisor != 0 {
            return None;
        }
        value /= divisor;
    }

    if negative {
        value = -value;
    }
    i64::try_from(value).ok()
}
