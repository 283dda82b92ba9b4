//! JSON extraction utilities for parsing LLM responses.
//!
//! Model replies mix prose, markdown code fences and one or more JSON
//! objects. These helpers locate the objects without assuming the reply is
//! well formed, so callers can parse each fragment independently and skip
//! the broken ones.
//!
//! # Example
//!
//! ```
//! use ruleforge::utils::json_extraction::extract_json_objects;
//!
//! let reply = "Rule 1: {\"name\": \"a\"}\nRule 2: {\"name\": \"b\", oops}";
//! let fragments = extract_json_objects(reply);
//! assert_eq!(fragments.len(), 2);
//! assert!(fragments[0].parse().is_some());
//! assert!(fragments[1].parse().is_none());
//! ```

use regex::Regex;
use serde_json::Value;

/// One `{ ... }` span found in free text.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonFragment {
    /// Byte offset of the opening brace.
    pub offset: usize,
    pub text: String,
    /// False when the reply ended before the closing brace.
    pub complete: bool,
}

impl JsonFragment {
    /// Parses the fragment as a JSON object.
    pub fn parse(&self) -> Option<serde_json::Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.text).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

/// Finds the index of the brace closing the object that starts at `s[0]`.
///
/// This function properly handles:
/// - Nested braces
/// - String literals (including escaped quotes)
///
/// # Returns
///
/// The index of the matching closing '}', or None if not found.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Returns every outermost `{ ... }` span in `content`, in order.
///
/// Objects nested in an array (`[{...}, {...}]`) come back as separate
/// fragments. A trailing unterminated object is returned with
/// `complete == false`.
pub fn extract_json_objects(content: &str) -> Vec<JsonFragment> {
    let mut fragments = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel) = content[cursor..].find('{') {
        let start = cursor + rel;
        let rest = &content[start..];
        match find_matching_brace(rest) {
            Some(end) => {
                fragments.push(JsonFragment {
                    offset: start,
                    text: rest[..=end].to_string(),
                    complete: true,
                });
                cursor = start + end + 1;
            }
            None => {
                fragments.push(JsonFragment {
                    offset: start,
                    text: rest.to_string(),
                    complete: false,
                });
                break;
            }
        }
    }

    fragments
}

/// Returns the body of the first fenced code block, if any.
pub fn extract_from_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```[A-Za-z0-9_+-]*[ \t]*\r?\n?([\s\S]*?)```").ok()?;
    let caps = re.captures(content)?;
    Some(caps.get(1)?.as_str().trim().to_string())
}

/// Strips a surrounding code fence and inline backticks from a one-line answer.
pub fn strip_code_fences(content: &str) -> String {
    let body = extract_from_code_block(content).unwrap_or_else(|| content.trim().to_string());
    body.trim().trim_matches('`').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_matching_brace_nested() {
        let s = r#"{"a": {"b": "}"}, "c": 1} trailing"#;
        let end = find_matching_brace(s).unwrap();
        assert_eq!(&s[..=end], r#"{"a": {"b": "}"}, "c": 1}"#);
    }

    #[test]
    fn test_find_matching_brace_escaped_quote() {
        let s = r#"{"a": "say \"}\""}"#;
        assert_eq!(find_matching_brace(s), Some(s.len() - 1));
    }

    #[test]
    fn test_find_matching_brace_unterminated() {
        assert_eq!(find_matching_brace(r#"{"a": 1"#), None);
    }

    #[test]
    fn test_extract_objects_from_prose() {
        let reply = r#"Sure! Here are the rules:
1. {"name": "age range", "condition": "age >= 0"}
2. {"name": "email", "condition": "email is not null"}
Hope this helps."#;
        let fragments = extract_json_objects(reply);
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.complete));
        assert_eq!(fragments[1].parse().unwrap()["name"], "email");
    }

    #[test]
    fn test_extract_objects_from_array_in_code_block() {
        let reply = "```json\n[{\"name\": \"a\"}, {\"name\": \"b\"}]\n```";
        let names: Vec<String> = extract_json_objects(reply)
            .iter()
            .filter_map(|f| f.parse())
            .map(|m| m["name"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_no_json_yields_nothing() {
        assert!(extract_json_objects("I cannot help with that.").is_empty());
    }

    #[test]
    fn test_truncated_tail_is_marked_incomplete() {
        let fragments = extract_json_objects(r#"{"a": 1} {"b": "#);
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].complete);
        assert!(!fragments[1].complete);
        assert!(fragments[1].parse().is_none());
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```sql\nage >= 0\n```"), "age >= 0");
        assert_eq!(strip_code_fences("`age >= 0`"), "age >= 0");
        assert_eq!(strip_code_fences("  age >= 0 \n"), "age >= 0");
    }
}
