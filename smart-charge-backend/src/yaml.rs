//! Merge the secrets file over the config file.
use serde_yml::{Mapping, Value};
use thiserror::Error;

/// An error merging YAML values.
#[derive(Debug, Error)]
pub enum Error {
    /// A value would be replaced by a value of a different kind.
    #[error("Cannot replace {base} with {overlay} at {path}")]
    InvalidTypes {
        path: String,
        base: &'static str,
        overlay: &'static str,
    },
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn child_path(path: &str, key: &Value) -> String {
    let key = key
        .as_str()
        .map_or_else(|| format!("{key:?}"), str::to_string);
    if path.is_empty() {
        key
    } else {
        format!("{path}.{key}")
    }
}

/// Merge `overlay` over `base`.
///
/// Mappings are merged key by key. Any other value is replaced by the one in
/// `overlay`, and a null in `overlay` removes the key.
///
/// # Errors
///
/// If a value would be replaced by a value of a different kind, like a
/// mapping by a string.
pub fn merge_yaml(base: Value, overlay: Value) -> Result<Value, Error> {
    merge_at("", base, overlay)
}

fn merge_at(path: &str, base: Value, overlay: Value) -> Result<Value, Error> {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            merge_mappings(path, base, overlay).map(Value::Mapping)
        }
        (Value::Null, overlay) | (_, overlay @ Value::Null) => Ok(overlay),
        (base, overlay) if kind(&base) == kind(&overlay) => Ok(overlay),
        (base, overlay) => Err(Error::InvalidTypes {
            path: if path.is_empty() {
                "top level".to_string()
            } else {
                path.to_string()
            },
            base: kind(&base),
            overlay: kind(&overlay),
        }),
    }
}

fn merge_mappings(path: &str, mut base: Mapping, overlay: Mapping) -> Result<Mapping, Error> {
    for (key, value) in overlay {
        let old = base.remove(key.clone()).unwrap_or(Value::Null);
        if value.is_null() {
            continue;
        }
        let merged = merge_at(&child_path(path, &key), old, value)?;
        base.insert(key, merged);
    }

    Ok(base
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yml::from_str(s).unwrap()
    }

    #[test]
    fn test_merge_secrets() {
        let config = yaml(
            r"
home_assistant:
    url: http://homeassistant.local:8123
    token: null
scheduler:
    battery_size_kwh: 64
    target_state_of_charge: 100
logging:
    deployment_environment: production
",
        );

        let secrets = yaml(
            r"
home_assistant:
    token: secret
scheduler:
    target_state_of_charge: 80
logging: null
",
        );

        let expected = yaml(
            r"
home_assistant:
    url: http://homeassistant.local:8123
    token: secret
scheduler:
    battery_size_kwh: 64
    target_state_of_charge: 80
",
        );

        assert_eq!(merge_yaml(config, secrets).unwrap(), expected);
    }

    #[test]
    fn test_merge_new_section() {
        let config = yaml("scheduler:\n    battery_size_kwh: 64\n");
        let secrets = yaml("load_balancer:\n    main_fuse_current: 20\n");

        let merged = merge_yaml(config, secrets).unwrap();
        assert_eq!(
            merged,
            yaml("scheduler:\n    battery_size_kwh: 64\nload_balancer:\n    main_fuse_current: 20\n")
        );
    }

    #[test]
    fn test_merge_mismatched_types() {
        let config = yaml("scheduler:\n    battery_size_kwh: 64\n");
        let secrets = yaml("scheduler:\n    battery_size_kwh: big\n");

        let err = merge_yaml(config, secrets).unwrap_err();
        assert!(matches!(
            &err,
            Error::InvalidTypes { path, base: "number", overlay: "string" }
                if path == "scheduler.battery_size_kwh"
        ));
        assert_eq!(
            err.to_string(),
            "Cannot replace number with string at scheduler.battery_size_kwh"
        );
    }

    #[test]
    fn test_merge_mismatched_top_level() {
        let err = merge_yaml(yaml("scheduler: {}\n"), yaml("- secret\n")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot replace mapping with sequence at top level"
        );
    }
}
