//! JSON extraction for spec-phase agent output.
//!
//! Phases run with `--output-format text`, so the payload arrives embedded in
//! prose: either inside a ```json fence or as a raw `{…}` span. Model output
//! also tends to carry literal newlines inside string values, which strict
//! JSON rejects; `fix_json_string` repairs exactly that class of damage.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Extract the JSON candidate from agent output: the last fenced ```json
/// block wins, else the outermost `{…}` span.
pub fn extract_json_payload(output: &str) -> Option<String> {
    if let Some(fenced) = extract_last_fenced(output) {
        return Some(fenced);
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(output[start..=end].to_string())
}

fn extract_last_fenced(output: &str) -> Option<String> {
    let mut result = None;
    let mut rest = output;
    while let Some(open) = rest.find("```json") {
        let after = &rest[open + "```json".len()..];
        match after.find("```") {
            Some(close) => {
                result = Some(after[..close].trim().to_string());
                rest = &after[close + 3..];
            }
            None => break,
        }
    }
    result.filter(|s| !s.is_empty())
}

/// Escape literal newlines, carriage returns, and tabs inside string values.
/// A simple state machine tracking `in_string` and backslash escapes; content
/// outside strings is passed through untouched.
pub fn fix_json_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in input.chars() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                out.push(c);
                escaped = true;
            }
            '"' => {
                out.push(c);
                in_string = !in_string;
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Parse a candidate payload, trying the raw text first and the fixed form
/// second.
pub fn parse_json_lenient(candidate: &str) -> Result<Value> {
    match serde_json::from_str(candidate) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            let fixed = fix_json_string(candidate);
            serde_json::from_str(&fixed)
                .map_err(|_| anyhow!("invalid JSON payload: {first_err}"))
        }
    }
}

/// Heuristic: does the output look cut off mid-payload? True on a trailing
/// `"` or `,`, or a ```json fence opened but never closed.
pub fn truncation_likely(output: &str) -> bool {
    let trimmed = output.trim_end();
    if trimmed.ends_with('"') || trimmed.ends_with(',') {
        return true;
    }
    if let Some(open) = output.rfind("```json") {
        let after = &output[open + "```json".len()..];
        if !after.contains("```") {
            return true;
        }
    }
    false
}

/// Last `max_bytes` of the output on a char boundary, for recovery prompts
/// and failure messages.
pub fn output_tail(output: &str, max_bytes: usize) -> &str {
    if output.len() <= max_bytes {
        return output;
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_fenced_block() {
        let output = "Here is the result:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_payload(output).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_last_fenced_block_wins() {
        let output = "```json\n{\"a\": 1}\n```\nrevised:\n```json\n{\"a\": 2}\n```";
        assert_eq!(extract_json_payload(output).unwrap(), "{\"a\": 2}");
    }

    #[test]
    fn test_raw_span_fallback() {
        let output = "preamble {\"a\": {\"b\": 2}} trailer";
        assert_eq!(extract_json_payload(output).unwrap(), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_no_payload_is_none() {
        assert!(extract_json_payload("no json here").is_none());
        assert!(extract_json_payload("").is_none());
    }

    #[test]
    fn test_fix_escapes_newlines_inside_strings_only() {
        let input = "{\n  \"text\": \"line one\nline two\"\n}";
        let fixed = fix_json_string(input);
        assert_eq!(fixed, "{\n  \"text\": \"line one\\nline two\"\n}");
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["text"], "line one\nline two");
    }

    #[test]
    fn test_fix_preserves_existing_escapes() {
        let input = r#"{"text": "already\nescaped \"quoted\""}"#;
        assert_eq!(fix_json_string(input), input);
    }

    #[test]
    fn test_fix_on_valid_json_is_parse_equivalent() {
        let input = r#"{"a": [1, 2], "b": {"c": "x\ty"}, "d": null}"#;
        let fixed = fix_json_string(input);
        let before: Value = serde_json::from_str(input).unwrap();
        let after: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_lenient_parse_recovers_raw_newlines() {
        let candidate = "{\"summary\": \"first\nsecond\"}";
        let v = parse_json_lenient(candidate).unwrap();
        assert_eq!(v["summary"], "first\nsecond");
    }

    #[test]
    fn test_lenient_parse_reports_original_error() {
        let err = parse_json_lenient("{broken").unwrap_err();
        assert!(err.to_string().contains("invalid JSON payload"));
    }

    #[test]
    fn test_truncation_heuristics() {
        assert!(truncation_likely("{\"a\": \"cut off\""));
        assert!(truncation_likely("{\"a\": 1,"));
        assert!(truncation_likely("```json\n{\"a\": 1}"));
        assert!(!truncation_likely("```json\n{\"a\": 1}\n```"));
        assert!(!truncation_likely("all good."));
    }

    #[test]
    fn test_output_tail_respects_char_boundaries() {
        let text = "héllo wörld";
        let tail = output_tail(text, 4);
        assert!(tail.len() <= 4);
        assert!(text.ends_with(tail));
        assert_eq!(output_tail("short", 100), "short");
    }
}
