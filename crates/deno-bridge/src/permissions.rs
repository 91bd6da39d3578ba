//! Permission configuration validation and flag rendering.
//!
//! The server process is launched with Deno-style `--allow-<category>`
//! flags. This module validates a caller-supplied permission map and
//! renders it into those flags. No defaulting or broadening happens
//! here; absent categories produce no flag and the engine's defaults
//! apply.

use crate::error::{BridgeError, Result};
use serde_json::{Map, Value};

/// The closed set of permission categories, in flag-rendering order.
pub const PERMISSION_CATEGORIES: [&str; 8] = [
    "read", "write", "net", "env", "sys", "run", "ffi", "import",
];

/// Validate a permission map and render it into launch flags.
///
/// Every present value must be a list of strings naming scopes (paths,
/// `host:port` pairs, variable names, ...). Each present category yields
/// one `--allow-<category>=<comma-joined scopes>` flag. The scope string
/// `"inherit"` is passed through untouched; interpreting it is the
/// engine's job.
pub fn render_permission_flags(permissions: &Map<String, Value>) -> Result<Vec<String>> {
    for (category, value) in permissions {
        if !PERMISSION_CATEGORIES.contains(&category.as_str()) {
            return Err(BridgeError::InvalidPermissions(format!(
                "Unknown permission category: {category}."
            )));
        }
        let Some(entries) = value.as_array() else {
            return Err(BridgeError::InvalidPermissions(format!(
                "Invalid value type for {category}: {}. It should be a list of strings",
                json_type_name(value)
            )));
        };
        if entries.iter().any(|entry| !entry.is_string()) {
            return Err(BridgeError::InvalidPermissions(format!(
                "List values must be strings for {category}."
            )));
        }
    }

    let flags = PERMISSION_CATEGORIES
        .iter()
        .filter_map(|category| {
            let scopes = permissions.get(*category)?.as_array()?;
            let joined = scopes
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",");
            Some(format!("--allow-{category}={joined}"))
        })
        .collect();
    Ok(flags)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_empty_map_renders_no_flags() {
        let flags = render_permission_flags(&Map::new()).unwrap();
        assert!(flags.is_empty());
    }

    #[test]
    fn test_flags_render_in_category_order() {
        let perms = map(json!({
            "net": ["example.com:443"],
            "read": ["foo.txt", "bar.txt"],
            "env": [],
        }));
        let flags = render_permission_flags(&perms).unwrap();
        assert_eq!(
            flags,
            vec![
                "--allow-read=foo.txt,bar.txt",
                "--allow-net=example.com:443",
                "--allow-env=",
            ]
        );
    }

    #[test]
    fn test_non_list_value_names_category() {
        let perms = map(json!({"net": "jsonplaceholder.typicode.com:443"}));
        let err = render_permission_flags(&perms).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Invalid value type for net"), "{msg}");
        assert!(msg.contains("string"), "{msg}");
    }

    #[test]
    fn test_non_string_element_names_category() {
        let perms = map(json!({"net": ["ok", true]}));
        let err = render_permission_flags(&perms).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("List values must be strings for net."), "{msg}");
    }

    #[test]
    fn test_unknown_category_rejected() {
        let perms = map(json!({"network": ["example.com"]}));
        let err = render_permission_flags(&perms).unwrap_err();
        assert!(err.to_string().contains("network"));
    }

    #[test]
    fn test_inherit_scope_passes_through() {
        let perms = map(json!({"env": ["inherit"]}));
        let flags = render_permission_flags(&perms).unwrap();
        assert_eq!(flags, vec!["--allow-env=inherit"]);
    }
}
