//! `key.path=value` assignments applied to the YAML form of a [`Config`].
//!
//! The existing tree decides what a path may hold: a sequence leaf takes a
//! comma list, a bool or number leaf must parse as one, a string leaf keeps
//! the raw text and an unset (null) leaf tries bool, then integer, then
//! string. A guess the typed record rejects falls back to the raw text, so
//! `kube.context=123` still sets a string. Typed deserialization afterwards
//! catches the rest.

use serde_yaml::{Mapping, Value};

use crate::{Config, ConfigError};

/// Split `key.path=value`. The value may itself contain `=`.
pub fn parse_assignment(raw: &str) -> Result<(Vec<String>, String), ConfigError> {
    let (key, value) = raw.split_once('=').ok_or_else(|| ConfigError::BadAssignment(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(|seg| seg.trim().is_empty()) {
        return Err(ConfigError::BadAssignment(raw.to_string()));
    }
    Ok((key.split('.').map(|s| s.trim().to_string()).collect(), value.trim().to_string()))
}

/// Apply every assignment in order; later ones win.
pub fn apply(config: &Config, assignments: &[String]) -> Result<Config, ConfigError> {
    if assignments.is_empty() {
        return Ok(config.clone());
    }
    let mut tree = serde_yaml::to_value(config).map_err(ConfigError::Invalid)?;
    for raw in assignments {
        let (path, value) = parse_assignment(raw)?;
        let dotted = path.join(".");
        let leaf = leaf_mut(&mut tree, &path, &dotted)?;
        let guessed = leaf.is_null();
        *leaf = coerce(leaf, &dotted, &value)?;
        if guessed && !leaf.is_string() && serde_yaml::from_value::<Config>(tree.clone()).is_err() {
            *leaf_mut(&mut tree, &path, &dotted)? = Value::String(value);
        }
    }
    serde_yaml::from_value(tree).map_err(ConfigError::Invalid)
}

fn leaf_mut<'a>(tree: &'a mut Value, path: &[String], dotted: &str) -> Result<&'a mut Value, ConfigError> {
    let mut node = tree;
    for seg in path {
        node = match node {
            Value::Mapping(m) => lookup(m, seg).ok_or_else(|| ConfigError::UnknownKey(dotted.to_string()))?,
            _ => return Err(ConfigError::UnknownKey(dotted.to_string())),
        };
    }
    Ok(node)
}

fn lookup<'a>(m: &'a mut Mapping, key: &str) -> Option<&'a mut Value> {
    m.get_mut(Value::String(key.to_string()))
}

fn coerce(current: &Value, key: &str, raw: &str) -> Result<Value, ConfigError> {
    let bad = |expected: &'static str| ConfigError::BadValue { key: key.to_string(), value: raw.to_string(), expected };
    match current {
        Value::Mapping(_) => Err(bad("a leaf key, not a section")),
        Value::Sequence(_) => Ok(Value::Sequence(
            raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(|s| Value::String(s.to_string())).collect(),
        )),
        Value::Bool(_) => raw.parse::<bool>().map(Value::Bool).map_err(|_| bad("true or false")),
        Value::Number(_) => raw.parse::<i64>().map(|n| Value::Number(n.into())).map_err(|_| bad("an integer")),
        Value::String(_) => Ok(Value::String(raw.to_string())),
        _ => Ok(scalar(raw)),
    }
}

fn scalar(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> Result<Config, ConfigError> {
        apply(&Config::default(), &items.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn nested_paths_take_typed_values() {
        let c = set(&["tap.proxy.front_port=9000", "tap.headless=true", "tap.regex=^api-(v1|v2)$", "bridge.url=http://h:1/api"])
            .expect("applied");
        assert_eq!(c.tap.proxy.front_port, 9000);
        assert!(c.tap.headless);
        assert_eq!(c.tap.regex, "^api-(v1|v2)$");
        assert_eq!(c.bridge.url.as_deref(), Some("http://h:1/api"));
    }

    #[test]
    fn sequences_split_on_commas() {
        let c = set(&["tap.namespaces=shop, billing,"]).expect("applied");
        assert_eq!(c.tap.namespaces, vec!["shop", "billing"]);
    }

    #[test]
    fn later_assignment_wins() {
        let c = set(&["tap.self_namespace=a", "tap.self_namespace=b"]).expect("applied");
        assert_eq!(c.tap.self_namespace, "b");
    }

    #[test]
    fn unknown_paths_are_rejected() {
        assert!(matches!(set(&["tap.nope=1"]), Err(ConfigError::UnknownKey(k)) if k == "tap.nope"));
        assert!(matches!(set(&["tap.regex.deeper=1"]), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        assert!(matches!(set(&["tap.headless"]), Err(ConfigError::BadAssignment(_))));
        assert!(matches!(set(&["tap..headless=true"]), Err(ConfigError::BadAssignment(_))));
        assert!(matches!(set(&["tap.headless=maybe"]), Err(ConfigError::BadValue { .. })));
        assert!(matches!(set(&["tap.proxy=1"]), Err(ConfigError::BadValue { .. })));
    }

    #[test]
    fn unset_string_leaves_keep_numeric_and_boolean_text() {
        let c = set(&["kube.context=123", "bridge.url=true"]).expect("applied");
        assert_eq!(c.kube.context.as_deref(), Some("123"));
        assert_eq!(c.bridge.url.as_deref(), Some("true"));
        let c = set(&["kube.context=prod-eu"]).expect("applied");
        assert_eq!(c.kube.context.as_deref(), Some("prod-eu"));
    }

    #[test]
    fn out_of_range_ports_fail_typed_decode() {
        assert!(matches!(set(&["tap.proxy.hub_port=70000"]), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn value_may_contain_equals() {
        let (path, value) = parse_assignment("bridge.set=tap.regex=x").expect("parsed");
        assert_eq!(path, vec!["bridge", "set"]);
        assert_eq!(value, "tap.regex=x");
    }
}
