// Module: JsonPath
// Restricted JSON path evaluation: `$` root, `.field`, `[N]`, `.length()`.

use serde_json::Value;

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    /// `.length()` / `.size()`: count of an array or string. Terminal only.
    Length,
}

/// Parses a path into segments. Returns `None` on any syntax the
/// restricted grammar does not cover (filters, unions, recursive
/// descent, unbalanced brackets).
fn parse(path: &str) -> Option<Vec<Segment>> {
    let mut rest = path.trim();
    if let Some(stripped) = rest.strip_prefix('$') {
        rest = stripped;
    }

    let mut segments = Vec::new();
    let mut chars = rest.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                let field_start = chars.peek().map(|&(i, _)| i).unwrap_or(rest.len());
                while let Some(&(_, fc)) = chars.peek() {
                    if fc == '.' || fc == '[' {
                        break;
                    }
                    chars.next();
                }
                let field_end = chars.peek().map(|&(i, _)| i).unwrap_or(rest.len());
                let field = &rest[field_start..field_end];
                if field.is_empty() {
                    return None;
                }
                if field == "length()" || field == "size()" {
                    segments.push(Segment::Length);
                } else if field.contains('(') || field.contains(')') {
                    return None;
                } else {
                    segments.push(Segment::Field(field.to_string()));
                }
            }
            '[' => {
                chars.next();
                let idx_start = chars.peek().map(|&(i, _)| i).unwrap_or(rest.len());
                while let Some(&(_, ic)) = chars.peek() {
                    if ic == ']' {
                        break;
                    }
                    chars.next();
                }
                let idx_end = chars.peek().map(|&(i, _)| i).unwrap_or(rest.len());
                match chars.next() {
                    Some((_, ']')) => {}
                    _ => return None, // unbalanced bracket
                }
                let index: usize = rest[idx_start..idx_end].trim().parse().ok()?;
                segments.push(Segment::Index(index));
            }
            _ if start == 0 => {
                // Bare path without `$.` prefix: first segment is a field.
                while let Some(&(_, fc)) = chars.peek() {
                    if fc == '.' || fc == '[' {
                        break;
                    }
                    chars.next();
                }
                let field_end = chars.peek().map(|&(i, _)| i).unwrap_or(rest.len());
                let field = &rest[..field_end];
                if field == "length()" || field == "size()" {
                    segments.push(Segment::Length);
                } else if field.contains('(') || field.contains(')') {
                    return None;
                } else {
                    segments.push(Segment::Field(field.to_string()));
                }
            }
            _ => return None,
        }
    }

    // length()/size() must close the path.
    for (i, seg) in segments.iter().enumerate() {
        if *seg == Segment::Length && i != segments.len() - 1 {
            return None;
        }
    }

    Some(segments)
}

/// Evaluates a path against a JSON tree, returning a clone of the
/// addressed subtree. `None` when the path misses or is malformed.
pub fn evaluate(root: &Value, path: &str) -> Option<Value> {
    let segments = parse(path)?;
    let mut current = root;

    for segment in &segments {
        match segment {
            Segment::Field(name) => {
                current = current.as_object()?.get(name)?;
            }
            Segment::Index(index) => {
                current = current.as_array()?.get(*index)?;
            }
            Segment::Length => {
                let count = match current {
                    Value::Array(items) => items.len(),
                    Value::String(s) => s.chars().count(),
                    _ => return None,
                };
                return Some(Value::from(count));
            }
        }
    }

    Some(current.clone())
}

/// Presence check for `EXISTS` / `NOT_EXISTS` operators.
pub fn exists(root: &Value, path: &str) -> bool {
    evaluate(root, path).is_some()
}

/// String form of a JSON value for placeholder expansion and assertion
/// messages: strings come out unquoted, null becomes the empty string,
/// everything else is serialized compactly.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> Value {
        json!({
            "data": {
                "token": "abc",
                "items": [{"id": 1}, {"id": 2}, {"id": 3}],
                "empty": null
            },
            "count": 42
        })
    }

    #[test]
    fn test_root_and_fields() {
        let v = tree();
        assert_eq!(evaluate(&v, "$.data.token"), Some(json!("abc")));
        assert_eq!(evaluate(&v, "$.count"), Some(json!(42)));
        assert_eq!(evaluate(&v, "$"), Some(v.clone()));
    }

    #[test]
    fn test_bare_path_without_dollar() {
        let v = tree();
        assert_eq!(evaluate(&v, "data.token"), Some(json!("abc")));
    }

    #[test]
    fn test_array_index() {
        let v = tree();
        assert_eq!(evaluate(&v, "$.data.items[1].id"), Some(json!(2)));
        assert_eq!(evaluate(&v, "$.data.items[9]"), None);
    }

    #[test]
    fn test_length_and_size() {
        let v = tree();
        assert_eq!(evaluate(&v, "$.data.items.length()"), Some(json!(3)));
        assert_eq!(evaluate(&v, "$.data.items.size()"), Some(json!(3)));
        assert_eq!(evaluate(&v, "$.data.token.length()"), Some(json!(3)));
        // length() em objeto não é definido
        assert_eq!(evaluate(&v, "$.data.length()"), None);
        // length() não pode estar no meio do path
        assert_eq!(evaluate(&v, "$.data.items.length().x"), None);
    }

    #[test]
    fn test_missing_keys() {
        let v = tree();
        assert_eq!(evaluate(&v, "$.nope"), None);
        assert_eq!(evaluate(&v, "$.data.nope.deeper"), None);
        assert!(!exists(&v, "$.nope"));
        assert!(exists(&v, "$.data.empty")); // null existe, é presente
    }

    #[test]
    fn test_malformed_paths() {
        let v = tree();
        assert_eq!(evaluate(&v, "$.data.items[1"), None);
        assert_eq!(evaluate(&v, "$.data.items[x]"), None);
        assert_eq!(evaluate(&v, "$..token"), None);
        assert_eq!(evaluate(&v, "$.data.foo()"), None);
    }

    #[test]
    fn test_stringify_forms() {
        assert_eq!(stringify(&json!("abc")), "abc");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(stringify(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_scalar_round_trip() {
        // Extrair um alvo escalar devolve a forma serializada do subtree.
        let v = json!({"a": {"b": [10, 20]}});
        let extracted = evaluate(&v, "$.a.b[1]").unwrap();
        assert_eq!(stringify(&extracted), "20");
    }
}
