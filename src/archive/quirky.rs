//! Extraction of JSON literals from `name = <literal>;` export files.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuirkyJsonError {
    #[error("unterminated JSON literal starting at byte {0}")]
    Unterminated(usize),

    #[error("invalid JSON literal: {0}")]
    Json(#[from] serde_json::Error),
}

/// Collects every JSON literal assigned in `content`.
///
/// Array literals are flattened into the result, object literals are
/// appended as one record each. Content without any assignment is parsed as
/// a single plain JSON document.
pub fn extract_records(content: &str) -> Result<Vec<Value>, QuirkyJsonError> {
    let content = content.trim_start_matches('\u{feff}');
    let bytes = content.as_bytes();
    let mut records = Vec::new();
    let mut found = false;
    let mut pos = 0;

    while let Some(offset) = bytes[pos..].iter().position(|&b| b == b'=') {
        let eq = pos + offset;
        let mut start = eq + 1;
        while start < bytes.len() && bytes[start].is_ascii_whitespace() {
            start += 1;
        }
        if start >= bytes.len() || !matches!(bytes[start], b'[' | b'{') {
            pos = eq + 1;
            continue;
        }
        let end = literal_end(bytes, start).ok_or(QuirkyJsonError::Unterminated(start))?;
        push_flattened(&mut records, serde_json::from_str(&content[start..=end])?);
        found = true;
        pos = end + 1;
    }

    if !found {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            push_flattened(&mut records, serde_json::from_str(trimmed)?);
        }
    }
    Ok(records)
}

/// Index of the bracket closing the literal opened at `start`. Brackets
/// inside string literals, escaped quotes included, do not count.
fn literal_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
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
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn push_flattened(records: &mut Vec<Value>, value: Value) {
    match value {
        Value::Array(items) => records.extend(items),
        other => records.push(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn brackets_inside_strings_do_not_end_the_literal() {
        let content = r#"// header
foo = [1,"a]b",{"x":[2,3]}];
trailing text"#;
        assert_eq!(
            extract_records(content).unwrap(),
            vec![json!(1), json!("a]b"), json!({"x": [2, 3]})]
        );
    }

    #[test]
    fn escaped_quotes_stay_inside_the_string() {
        let content = r#"window.YTD.tweets.part0 = [{"text": "say \"]}\" loud"}]"#;
        assert_eq!(
            extract_records(content).unwrap(),
            vec![json!({"text": "say \"]}\" loud"})]
        );
    }

    #[test]
    fn every_assignment_in_a_file_is_collected() {
        let content = "a = [1, 2];\nb = {\"k\": true};\nc = [3];";
        assert_eq!(
            extract_records(content).unwrap(),
            vec![json!(1), json!(2), json!({"k": true}), json!(3)]
        );
    }

    #[test]
    fn comparisons_and_scalar_assignments_are_skipped() {
        let content = "if (a == b) x = 5;\nwindow.data = [\"ok\"]";
        assert_eq!(extract_records(content).unwrap(), vec![json!("ok")]);
    }

    #[test]
    fn plain_json_is_the_fallback() {
        assert_eq!(
            extract_records("  [{\"id\": 1}]\n").unwrap(),
            vec![json!({"id": 1})]
        );
        assert_eq!(
            extract_records("\u{feff}{\"id\": 1}").unwrap(),
            vec![json!({"id": 1})]
        );
        assert!(extract_records("   ").unwrap().is_empty());
    }

    #[test]
    fn unterminated_literal_is_an_error() {
        assert!(matches!(
            extract_records("x = [1, {\"a\": 2}"),
            Err(QuirkyJsonError::Unterminated(4))
        ));
    }

    #[test]
    fn malformed_literal_is_an_error() {
        assert!(matches!(
            extract_records("x = [1, 2,];"),
            Err(QuirkyJsonError::Json(_))
        ));
        assert!(extract_records("not json at all").is_err());
    }
}
