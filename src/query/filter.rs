//! Subscription filters
//!
//! A [`Filter`] is a path expression plus zero or more `[key=value]`
//! predicates. Filters decide which change events reach a subscriber and how
//! sequence payloads are narrowed to the records a subscriber asked for.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::query::matcher;

/// A single `key=value` predicate attached to a filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Mapping key the predicate inspects
    pub key: String,
    /// Expected value in stringified form
    pub value: String,
}

/// A parsed subscription filter
#[derive(Debug, Clone)]
pub struct Filter {
    expression: String,
    path: String,
    conditions: Vec<Condition>,
    wildcard_regex: Option<Regex>,
}

impl Filter {
    /// Create a filter from an expression string.
    ///
    /// Bracketed `[key=value]` predicates are extracted; the remaining string
    /// is the bare path used for equivalence tests.
    pub fn new(expression: &str) -> Self {
        let (path, conditions) = extract_conditions(expression);

        let wildcard_regex = if path.contains("[*]") {
            match Regex::new(&wildcard_pattern(&path)) {
                Ok(re) => Some(re),
                Err(e) => {
                    debug!(path = %path, error = %e, "failed to compile wildcard filter pattern");
                    None
                }
            }
        } else {
            None
        };

        Self {
            expression: expression.to_string(),
            path,
            conditions,
            wildcard_regex,
        }
    }

    /// The original expression string, predicates included
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The bare path with predicates stripped
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The extracted predicate list
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Last dotted component of the filter path (e.g. `positions` for
    /// `.data.positions`), when the path has one.
    pub fn target_field(&self) -> Option<&str> {
        let last = self.path.rsplit('.').next()?;
        if last.is_empty() || last == self.path {
            None
        } else {
            Some(last)
        }
    }

    /// Does a change at `path` carrying `value` match this filter?
    ///
    /// Path equivalence first (exact, ancestor, descendant, wildcard); when
    /// predicates are present, they are evaluated against the changed value,
    /// descending along the remaining suffix when the change is a strict
    /// ancestor of the filter path.
    pub fn is_match(&self, path: &str, value: &Value) -> bool {
        let filter_below_change = is_descendant(&self.path, path);
        let equivalent = path == self.path
            || filter_below_change
            || is_descendant(path, &self.path)
            || self
                .wildcard_regex
                .as_ref()
                .is_some_and(|re| re.is_match(path));

        if !equivalent {
            return false;
        }
        if self.conditions.is_empty() {
            return true;
        }

        if filter_below_change && path != self.path {
            match matcher::get_relative(value, relative_suffix(&self.path, path)) {
                Ok(sub_value) => matches_conditions(&sub_value, &self.conditions),
                Err(_) => false,
            }
        } else {
            matches_conditions(value, &self.conditions)
        }
    }
}

/// Is `child` a strict or equal descendant path of `parent`?
///
/// Every path descends from the root; otherwise the child must extend the
/// parent through a property (`.`) or index (`[`) boundary so that `.user`
/// is not mistaken for an ancestor of `.users`.
pub fn is_descendant(child: &str, parent: &str) -> bool {
    if parent == "." || parent.is_empty() {
        return true;
    }
    let Some(rest) = child.strip_prefix(parent) else {
        return false;
    };
    rest.starts_with('.') || rest.starts_with('[')
}

/// The remainder of `child` after stripping the ancestor `parent`.
pub fn relative_suffix<'a>(child: &'a str, parent: &str) -> &'a str {
    if parent == "." || parent.is_empty() {
        child
    } else {
        &child[parent.len().min(child.len())..]
    }
}

/// Split an expression into its bare path and `[key=value]` predicates.
///
/// Predicate keys may not contain `=` or brackets; values run to the closing
/// bracket. Both sides are whitespace-trimmed. Index (`[0]`) and wildcard
/// (`[*]`) brackets are left in the path untouched.
pub fn extract_conditions(expression: &str) -> (String, Vec<Condition>) {
    let mut path = String::with_capacity(expression.len());
    let mut conditions = Vec::new();
    let mut rest = expression;

    while let Some(open) = rest.find('[') {
        let (before, bracketed) = rest.split_at(open);
        path.push_str(before);

        let Some(close) = bracketed.find(']') else {
            // Unbalanced bracket: leave it for the parser to reject.
            path.push_str(bracketed);
            rest = "";
            break;
        };

        let inner = &bracketed[1..close];
        match inner.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                conditions.push(Condition {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                });
            }
            _ => path.push_str(&bracketed[..=close]),
        }

        rest = &bracketed[close + 1..];
    }

    path.push_str(rest);
    (path, conditions)
}

/// Does `value` satisfy every condition?
///
/// Sequences match when any element is a mapping satisfying all conditions;
/// mappings must satisfy all conditions themselves; scalars never match.
pub fn matches_conditions(value: &Value, conditions: &[Condition]) -> bool {
    if conditions.is_empty() {
        return true;
    }

    match value {
        Value::Array(items) => items.iter().any(|item| item_matches(item, conditions)),
        Value::Object(_) => item_matches(value, conditions),
        _ => false,
    }
}

/// Narrow `value` by the conditions, for payload delivery.
///
/// Sequences are restricted to the matching elements (`None` when nothing
/// survives); a mapping passes whole or not at all; scalars pass through
/// unfiltered.
pub fn narrow_by_conditions(value: &Value, conditions: &[Condition]) -> Option<Value> {
    if conditions.is_empty() {
        return Some(value.clone());
    }

    match value {
        Value::Array(items) => {
            let filtered: Vec<Value> = items
                .iter()
                .filter(|&item| item.is_object() && item_matches(item, conditions))
                .cloned()
                .collect();
            if filtered.is_empty() {
                None
            } else {
                Some(Value::Array(filtered))
            }
        }
        Value::Object(_) => {
            if item_matches(value, conditions) {
                Some(value.clone())
            } else {
                None
            }
        }
        other => Some(other.clone()),
    }
}

/// Apply predicates to a query result.
///
/// Sequences are restricted to matching elements (possibly leaving an empty
/// sequence); a non-matching mapping collapses to `null`; scalars pass
/// through unfiltered.
pub fn apply_conditions(value: Value, conditions: &[Condition]) -> Value {
    if conditions.is_empty() {
        return value;
    }

    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| item_matches(item, conditions))
                .collect(),
        ),
        Value::Object(_) => {
            if item_matches(&value, conditions) {
                value
            } else {
                Value::Null
            }
        }
        other => other,
    }
}

fn item_matches(item: &Value, conditions: &[Condition]) -> bool {
    let Some(map) = item.as_object() else {
        return false;
    };
    conditions.iter().all(|condition| {
        map.get(&condition.key)
            .is_some_and(|field| value_to_string(field).trim() == condition.value)
    })
}

/// Stringify a JSON value for predicate comparison.
///
/// Numbers render in their shortest decimal form, booleans as
/// `true`/`false`, strings literally. Comparison is case-sensitive.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn wildcard_pattern(path: &str) -> String {
    let quoted = regex::escape(path);
    let pattern = quoted.replace(r"\[\*\]", r"\[\d+\]");
    format!("^{pattern}$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_match() {
        let filter = Filter::new(".users[0].status");
        assert!(filter.is_match(".users[0].status", &json!("away")));
    }

    #[test]
    fn test_parent_path_match() {
        let filter = Filter::new(".users[0].status");
        assert!(filter.is_match(".users[0]", &json!({"status": "away"})));
    }

    #[test]
    fn test_child_path_match() {
        let filter = Filter::new(".users");
        assert!(filter.is_match(".users[0].status", &json!("away")));
    }

    #[test]
    fn test_root_match() {
        let filter = Filter::new(".");
        assert!(filter.is_match(".users[0].status", &json!("away")));
    }

    #[test]
    fn test_wildcard_match() {
        let filter = Filter::new(".users[*].status");
        assert!(filter.is_match(".users[0].status", &json!("away")));
        assert!(filter.is_match(".users[17].status", &json!("away")));
        assert!(!filter.is_match(".users[0].name", &json!("bob")));
    }

    #[test]
    fn test_no_match() {
        let filter = Filter::new(".config.timeout");
        assert!(!filter.is_match(".users[0].status", &json!("away")));
    }

    #[test]
    fn test_sibling_no_match() {
        let filter = Filter::new(".users[1].status");
        assert!(!filter.is_match(".users[0].status", &json!("away")));
    }

    #[test]
    fn test_prefix_is_not_ancestor() {
        // ".user" must not match a change at ".users"
        let filter = Filter::new(".user");
        assert!(!filter.is_match(".users", &json!({})));
    }

    #[test]
    fn test_extract_single_condition() {
        let (path, conditions) = extract_conditions(".data.positions[trader=abc]");
        assert_eq!(path, ".data.positions");
        assert_eq!(
            conditions,
            vec![Condition {
                key: "trader".into(),
                value: "abc".into()
            }]
        );
    }

    #[test]
    fn test_extract_multiple_conditions() {
        let (path, conditions) = extract_conditions(".data.positions[trader=abc][side=long]");
        assert_eq!(path, ".data.positions");
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].key, "side");
        assert_eq!(conditions[1].value, "long");
    }

    #[test]
    fn test_extract_trims_whitespace() {
        let (_, conditions) = extract_conditions(".x[ trader = abc ]");
        assert_eq!(conditions[0].key, "trader");
        assert_eq!(conditions[0].value, "abc");
    }

    #[test]
    fn test_extract_leaves_indices_and_wildcards() {
        let (path, conditions) = extract_conditions(".users[0].tags[*]");
        assert_eq!(path, ".users[0].tags[*]");
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_extract_value_may_contain_equals() {
        let (_, conditions) = extract_conditions(".x[k=a=b]");
        assert_eq!(conditions[0].key, "k");
        assert_eq!(conditions[0].value, "a=b");
    }

    #[test]
    fn test_conditions_on_sequence() {
        let filter = Filter::new(".data.positions[trader=abc]");
        let matching = json!([{"trader": "abc", "amt": 10}, {"trader": "xyz", "amt": 20}]);
        let not_matching = json!([{"trader": "xyz", "amt": 20}]);
        assert!(filter.is_match(".data.positions", &matching));
        assert!(!filter.is_match(".data.positions", &not_matching));
    }

    #[test]
    fn test_conditions_are_case_sensitive() {
        let filter = Filter::new(".data.positions[trader=ABC]");
        let data = json!([{"trader": "abc"}]);
        assert!(!filter.is_match(".data.positions", &data));
    }

    #[test]
    fn test_conditions_descend_from_ancestor_change() {
        // Change at the root carries the whole tree; the filter descends to
        // .data.positions before applying its predicate.
        let filter = Filter::new(".data.positions[trader=abc]");
        let tree = json!({"data": {"positions": [{"trader": "abc"}]}});
        assert!(filter.is_match(".", &tree));

        let other = json!({"data": {"positions": [{"trader": "xyz"}]}});
        assert!(!filter.is_match(".", &other));
    }

    #[test]
    fn test_numeric_condition_uses_decimal_form() {
        let filter = Filter::new(".data.positions[amt=10]");
        let data = json!([{"amt": 10}]);
        assert!(filter.is_match(".data.positions", &data));
    }

    #[test]
    fn test_boolean_condition() {
        let filter = Filter::new(".data.flags[active=true]");
        let data = json!([{"active": true}]);
        assert!(filter.is_match(".data.flags", &data));
    }

    #[test]
    fn test_narrow_preserves_order_and_restricts() {
        let conditions = vec![
            Condition {
                key: "k".into(),
                value: "1".into(),
            },
            Condition {
                key: "v".into(),
                value: "x".into(),
            },
        ];
        let data = json!([
            {"k": 1, "v": "x", "n": "first"},
            {"k": 2, "v": "x", "n": "second"},
            {"k": 1, "v": "x", "n": "third"}
        ]);
        let narrowed = narrow_by_conditions(&data, &conditions).unwrap();
        let items = narrowed.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["n"], json!("first"));
        assert_eq!(items[1]["n"], json!("third"));
    }

    #[test]
    fn test_narrow_empty_result_is_none() {
        let conditions = vec![Condition {
            key: "k".into(),
            value: "9".into(),
        }];
        let data = json!([{"k": 1}]);
        assert!(narrow_by_conditions(&data, &conditions).is_none());
    }

    #[test]
    fn test_narrow_scalar_passes_through() {
        let conditions = vec![Condition {
            key: "k".into(),
            value: "1".into(),
        }];
        assert_eq!(
            narrow_by_conditions(&json!("hello"), &conditions),
            Some(json!("hello"))
        );
    }

    #[test]
    fn test_apply_conditions_filters_sequence() {
        let conditions = vec![Condition {
            key: "trader".into(),
            value: "abc".into(),
        }];
        let data = json!([{"trader": "abc"}, {"trader": "xyz"}]);
        let applied = apply_conditions(data, &conditions);
        assert_eq!(applied, json!([{"trader": "abc"}]));

        let none = apply_conditions(json!([{"trader": "xyz"}]), &conditions);
        assert_eq!(none, json!([]));
    }

    #[test]
    fn test_target_field() {
        assert_eq!(Filter::new(".data.positions").target_field(), Some("positions"));
        assert_eq!(Filter::new(".").target_field(), None);
    }

    #[test]
    fn test_expression_preserved() {
        let filter = Filter::new(".data.positions[trader=abc]");
        assert_eq!(filter.expression(), ".data.positions[trader=abc]");
        assert_eq!(filter.path(), ".data.positions");
    }
}
