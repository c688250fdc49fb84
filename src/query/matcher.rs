//! Path evaluation over JSON trees
//!
//! Walks parsed path segments against `serde_json::Value` data: single-value
//! lookup, wildcard-expanding multi-value matching, and in-place set/delete.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{GalenaError, Result};
use crate::query::parser::{self, Segment};

/// One result of a wildcard-aware match: the concrete path and its value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Concrete path with wildcards replaced by realized indices
    pub path: String,
    /// The value at that path
    pub value: Value,
}

/// Retrieve the value at `path`.
///
/// Wildcards are rejected with `InvalidOperation`; use [`find_matches`] for
/// multi-value lookup. Any miss along the way yields `PathNotFound`.
pub fn get(root: &Value, path: &str) -> Result<Value> {
    let segments = parser::parse(path)?;
    navigate(root, &segments).cloned()
}

/// Retrieve the value at a relative suffix of a longer path.
///
/// The suffix is the remainder after stripping an ancestor prefix, so it may
/// begin with either `.` or `[`.
pub fn get_relative(root: &Value, suffix: &str) -> Result<Value> {
    if suffix.is_empty() || suffix == "." {
        return Ok(root.clone());
    }
    let segments = parser::parse_segments(suffix)?;
    navigate(root, &segments).cloned()
}

/// Find all values matching `path`, expanding wildcards.
///
/// Missing intermediate paths produce an empty result rather than an error.
pub fn find_matches(root: &Value, path: &str) -> Result<Vec<MatchResult>> {
    let segments = parser::parse(path)?;
    let mut results = Vec::new();
    collect_matches(root, &segments, String::new(), &mut results);
    Ok(results)
}

/// Set the value at `path`, replacing whatever was there.
///
/// Missing intermediate mappings are created when the next segment is a
/// property; numeric segments never create sequences implicitly, so an
/// out-of-bounds or missing index fails with `PathNotFound`.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = parser::parse(path)?;
    let segments = strip_root(&segments);
    if segments.is_empty() {
        return Err(GalenaError::InvalidOperation(
            "cannot replace the root through a path set".to_string(),
        ));
    }
    set_value(root, segments, value)
}

/// Delete the value at `path`.
///
/// Mapping entries are removed; sequence slots are replaced with `null` so
/// sibling indices stay stable.
pub fn delete(root: &mut Value, path: &str) -> Result<()> {
    let segments = parser::parse(path)?;
    let segments = strip_root(&segments);
    if segments.is_empty() {
        return Err(GalenaError::InvalidOperation(
            "cannot delete the root through a path delete".to_string(),
        ));
    }
    delete_value(root, segments)
}

fn strip_root(segments: &[Segment]) -> &[Segment] {
    match segments.first() {
        Some(Segment::Root) => &segments[1..],
        _ => segments,
    }
}

fn navigate<'a>(data: &'a Value, segments: &[Segment]) -> Result<&'a Value> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(data);
    };

    match segment {
        Segment::Root => navigate(data, rest),
        Segment::Property(name) => {
            let child = data
                .as_object()
                .and_then(|map| map.get(name))
                .ok_or(GalenaError::PathNotFound)?;
            navigate(child, rest)
        }
        Segment::Index(index) => {
            let child = data
                .as_array()
                .and_then(|items| items.get(*index))
                .ok_or(GalenaError::PathNotFound)?;
            navigate(child, rest)
        }
        Segment::Wildcard => Err(GalenaError::InvalidOperation(
            "wildcards are not supported in get".to_string(),
        )),
    }
}

fn collect_matches(
    data: &Value,
    segments: &[Segment],
    current_path: String,
    results: &mut Vec<MatchResult>,
) {
    let Some((segment, rest)) = segments.split_first() else {
        let path = if current_path.is_empty() {
            ".".to_string()
        } else {
            current_path
        };
        results.push(MatchResult {
            path,
            value: data.clone(),
        });
        return;
    };

    match segment {
        Segment::Root => collect_matches(data, rest, current_path, results),
        Segment::Property(name) => {
            if let Some(child) = data.as_object().and_then(|map| map.get(name)) {
                collect_matches(child, rest, format!("{current_path}.{name}"), results);
            }
        }
        Segment::Index(index) => {
            if let Some(child) = data.as_array().and_then(|items| items.get(*index)) {
                collect_matches(child, rest, format!("{current_path}[{index}]"), results);
            }
        }
        Segment::Wildcard => {
            if let Some(items) = data.as_array() {
                for (i, item) in items.iter().enumerate() {
                    collect_matches(item, rest, format!("{current_path}[{i}]"), results);
                }
            }
        }
    }
}

fn set_value(data: &mut Value, segments: &[Segment], value: Value) -> Result<()> {
    if segments.len() == 1 {
        return set_final(data, &segments[0], value);
    }
    let (segment, rest) = segments
        .split_first()
        .ok_or_else(|| GalenaError::Internal("empty segment list in set".to_string()))?;

    match segment {
        Segment::Root => set_value(data, rest, value),
        Segment::Property(name) => {
            let map = data.as_object_mut().ok_or(GalenaError::PathNotFound)?;
            if !map.contains_key(name.as_str()) {
                // Only mappings are created implicitly; a missing key whose
                // next segment is an index fails instead of conjuring a
                // sequence of some guessed length.
                if matches!(rest.first(), Some(Segment::Property(_))) {
                    map.insert(name.clone(), Value::Object(Map::new()));
                } else {
                    return Err(GalenaError::PathNotFound);
                }
            }
            let child = map.get_mut(name.as_str()).ok_or(GalenaError::PathNotFound)?;
            set_value(child, rest, value)
        }
        Segment::Index(index) => {
            let child = data
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or(GalenaError::PathNotFound)?;
            set_value(child, rest, value)
        }
        Segment::Wildcard => Err(GalenaError::InvalidOperation(
            "wildcards are not supported in set".to_string(),
        )),
    }
}

fn set_final(data: &mut Value, segment: &Segment, value: Value) -> Result<()> {
    match segment {
        Segment::Property(name) => {
            let map = data.as_object_mut().ok_or(GalenaError::PathNotFound)?;
            map.insert(name.clone(), value);
            Ok(())
        }
        Segment::Index(index) => {
            let slot = data
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or(GalenaError::PathNotFound)?;
            *slot = value;
            Ok(())
        }
        Segment::Wildcard => Err(GalenaError::InvalidOperation(
            "wildcards are not supported in set".to_string(),
        )),
        Segment::Root => Err(GalenaError::InvalidOperation(
            "cannot replace the root through a path set".to_string(),
        )),
    }
}

fn delete_value(data: &mut Value, segments: &[Segment]) -> Result<()> {
    if segments.len() == 1 {
        return delete_final(data, &segments[0]);
    }
    let (segment, rest) = segments
        .split_first()
        .ok_or_else(|| GalenaError::Internal("empty segment list in delete".to_string()))?;

    match segment {
        Segment::Root => delete_value(data, rest),
        Segment::Property(name) => {
            let child = data
                .as_object_mut()
                .and_then(|map| map.get_mut(name.as_str()))
                .ok_or(GalenaError::PathNotFound)?;
            delete_value(child, rest)
        }
        Segment::Index(index) => {
            let child = data
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or(GalenaError::PathNotFound)?;
            delete_value(child, rest)
        }
        Segment::Wildcard => Err(GalenaError::InvalidOperation(
            "wildcards are not supported in delete".to_string(),
        )),
    }
}

fn delete_final(data: &mut Value, segment: &Segment) -> Result<()> {
    match segment {
        Segment::Property(name) => {
            let map = data.as_object_mut().ok_or(GalenaError::PathNotFound)?;
            map.remove(name.as_str())
                .map(|_| ())
                .ok_or(GalenaError::PathNotFound)
        }
        Segment::Index(index) => {
            // Sequence length is preserved: the slot becomes null so sibling
            // indices keep meaning the same elements.
            let slot = data
                .as_array_mut()
                .and_then(|items| items.get_mut(*index))
                .ok_or(GalenaError::PathNotFound)?;
            *slot = Value::Null;
            Ok(())
        }
        Segment::Wildcard => Err(GalenaError::InvalidOperation(
            "wildcards are not supported in delete".to_string(),
        )),
        Segment::Root => Err(GalenaError::InvalidOperation(
            "cannot delete the root through a path delete".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "users": [
                {"id": 1, "name": "alice", "status": "online"},
                {"id": 2, "name": "bob", "status": "offline"}
            ],
            "config": {"timeout": 30}
        })
    }

    #[test]
    fn test_get_property() {
        let data = sample();
        assert_eq!(get(&data, ".config.timeout").unwrap(), json!(30));
    }

    #[test]
    fn test_get_index() {
        let data = sample();
        assert_eq!(get(&data, ".users[1].name").unwrap(), json!("bob"));
    }

    #[test]
    fn test_get_root() {
        let data = sample();
        assert_eq!(get(&data, ".").unwrap(), data);
    }

    #[test]
    fn test_get_missing_key() {
        let data = sample();
        assert!(matches!(
            get(&data, ".missing"),
            Err(GalenaError::PathNotFound)
        ));
    }

    #[test]
    fn test_get_index_out_of_range() {
        let data = sample();
        assert!(matches!(
            get(&data, ".users[5]"),
            Err(GalenaError::PathNotFound)
        ));
    }

    #[test]
    fn test_get_property_on_array() {
        let data = sample();
        assert!(matches!(
            get(&data, ".users.name"),
            Err(GalenaError::PathNotFound)
        ));
    }

    #[test]
    fn test_get_rejects_wildcard() {
        let data = sample();
        assert!(matches!(
            get(&data, ".users[*]"),
            Err(GalenaError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_get_relative_with_bracket_suffix() {
        let data = sample();
        let users = get(&data, ".users").unwrap();
        assert_eq!(get_relative(&users, "[0].status").unwrap(), json!("online"));
    }

    #[test]
    fn test_find_matches_wildcard() {
        let data = sample();
        let matches = find_matches(&data, ".users[*].status").unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].path, ".users[0].status");
        assert_eq!(matches[0].value, json!("online"));
        assert_eq!(matches[1].path, ".users[1].status");
        assert_eq!(matches[1].value, json!("offline"));
    }

    #[test]
    fn test_find_matches_paths_are_distinct() {
        let data = sample();
        let matches = find_matches(&data, ".users[*]").unwrap();
        assert_eq!(matches.len(), 2);
        assert_ne!(matches[0].path, matches[1].path);
    }

    #[test]
    fn test_find_matches_missing_path_is_empty() {
        let data = sample();
        assert!(find_matches(&data, ".missing[*].x").unwrap().is_empty());
    }

    #[test]
    fn test_find_matches_exact_path() {
        let data = sample();
        let matches = find_matches(&data, ".config.timeout").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, ".config.timeout");
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let mut data = sample();
        set(&mut data, ".users[0].status", json!("away")).unwrap();
        assert_eq!(get(&data, ".users[0].status").unwrap(), json!("away"));
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let mut data = sample();
        set(&mut data, ".a.b.c", json!(1)).unwrap();
        assert_eq!(get(&data, ".a.b.c").unwrap(), json!(1));
    }

    #[test]
    fn test_set_does_not_create_sequences() {
        let mut data = sample();
        assert!(matches!(
            set(&mut data, ".items[0]", json!(1)),
            Err(GalenaError::PathNotFound)
        ));
    }

    #[test]
    fn test_set_index_out_of_range() {
        let mut data = sample();
        assert!(matches!(
            set(&mut data, ".users[9].status", json!("x")),
            Err(GalenaError::PathNotFound)
        ));
    }

    #[test]
    fn test_set_rejects_wildcard() {
        let mut data = sample();
        assert!(matches!(
            set(&mut data, ".users[*].status", json!("x")),
            Err(GalenaError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_delete_mapping_entry() {
        let mut data = sample();
        delete(&mut data, ".config.timeout").unwrap();
        assert!(matches!(
            get(&data, ".config.timeout"),
            Err(GalenaError::PathNotFound)
        ));
    }

    #[test]
    fn test_delete_sequence_slot_preserves_length() {
        let mut data = sample();
        delete(&mut data, ".users[0]").unwrap();
        assert_eq!(get(&data, ".users[0]").unwrap(), Value::Null);
        assert_eq!(get(&data, ".users[1].name").unwrap(), json!("bob"));
        assert_eq!(data["users"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_delete_missing_entry() {
        let mut data = sample();
        assert!(matches!(
            delete(&mut data, ".config.missing"),
            Err(GalenaError::PathNotFound)
        ));
    }
}
