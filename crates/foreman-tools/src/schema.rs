// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single-place validation of tool arguments against a declared schema.
//!
//! Tool handlers receive already-parsed JSON; the dispatch pipeline runs
//! this check first so handlers never re-validate shape themselves.  The
//! check covers what tool schemas actually use: top-level `required`
//! properties and primitive `type` tags of declared properties.

use serde_json::Value;

/// Validate `args` against the tool's declared JSON schema.
///
/// Returns `Err` with a human-readable message naming the first violation.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let obj = match args.as_object() {
        Some(o) => o,
        None => return Err("arguments must be a JSON object".into()),
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required argument '{key}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(decl) = props.get(key) else { continue };
            let Some(expected) = decl.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !matches_type(value, expected) {
                return Err(format!("argument '{key}' must be of type {expected}"));
            }
        }
    }

    Ok(())
}

fn matches_type(v: &Value, expected: &str) -> bool {
    match expected {
        "string" => v.is_string(),
        "integer" => v.is_i64() || v.is_u64(),
        "number" => v.is_number(),
        "boolean" => v.is_boolean(),
        "array" => v.is_array(),
        "object" => v.is_object(),
        _ => true,
    }
}
