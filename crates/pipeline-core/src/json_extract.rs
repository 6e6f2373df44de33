//! Tolerant JSON object extraction for LLM output.
//!
//! Models wrap JSON in code fences, prepend chatter, or append trailing notes.
//! Extraction tries, in order: the fenced body, the span between the first `{`
//! and the last `}`, and finally a brace-balanced scan that respects strings.

use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Pull the first parseable JSON object out of `text`.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let stripped = strip_code_fences(text);

    if let Some(obj) = parse_object(stripped.trim()) {
        return Some(obj);
    }

    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) {
        if start < end {
            if let Some(obj) = parse_object(&stripped[start..=end]) {
                debug!("json extracted from outer brace span");
                return Some(obj);
            }
        }
    }

    let scanned = balanced_scan(&stripped);
    match &scanned {
        Some(_) => debug!("json extracted by balanced scan"),
        None => warn!(len = text.len(), "no json object found in model output"),
    }
    scanned
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn strip_code_fences(text: &str) -> String {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // Skip an optional language tag on the fence line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].to_string();
        }
        return body.to_string();
    }
    text.to_string()
}

fn balanced_scan(text: &str) -> Option<Map<String, Value>> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(end) => {
                if let Some(obj) = parse_object(&text[start..=end]) {
                    return Some(obj);
                }
                search_from = start + 1;
            }
            None => return None,
        }
    }
    None
}
