//! Cell content sanitization
//!
//! Pipeline: trim, truncate to the length limit, reject denylisted content,
//! strip markup (unless HTML is allowed), trim again. Markup is stripped to a
//! fixpoint and every intermediate is checked against the denylist, so nested
//! tags cannot reassemble into a dangerous marker and the output is stable
//! under repeated sanitization.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

/// Rejection raised by the validator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SecurityError {
    /// Value matched a denylisted pattern
    #[error("dangerous content detected: {pattern}")]
    DangerousContent {
        /// Description of the matched pattern
        pattern: String,
    },
}

/// Denylist: (pattern, description)
const DENYLIST: &[(&str, &str)] = &[
    (r"(?i)<\s*script", "script tag"),
    (r"(?i)<\s*/\s*script", "script tag"),
    (r"(?i)<\s*(iframe|object|embed|applet|meta|base)\b", "embedded content tag"),
    (r"(?i)<[^>]*\bon[a-z]+\s*=", "inline event handler"),
    (r"(?i)\b(java|vb)script\s*:", "script URL"),
    (r"(?i)data\s*:\s*text/html", "HTML data URL"),
    (r"(?i)\beval\s*\(", "eval invocation"),
    (r"(?i)\bexpression\s*\(", "CSS expression"),
    (r"(?i)\bnew\s+Function\s*\(", "function constructor"),
    (r"(?i)\b(setTimeout|setInterval)\s*\(", "timer invocation"),
    (r"(?i)\b(window|document|globalThis|self\.top)\s*[.\[]", "global object access"),
    (r"(?i)\bprocess\s*\.\s*(env|exit|mainModule)", "global object access"),
    (r"(?i)__proto__|\bconstructor\s*\.\s*prototype", "prototype access"),
];

static DENYLIST_SET: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new(DENYLIST.iter().map(|(pattern, _)| *pattern)).expect("valid regex"));

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>]*>").expect("valid regex"));

/// Sanitized value plus what happened to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    /// Cleaned value
    pub value: String,
    /// Whether the value was cut to the length limit
    pub truncated: bool,
}

/// First denylist entry matched by `value`, if any
#[must_use]
pub fn find_dangerous(value: &str) -> Option<&'static str> {
    DENYLIST_SET
        .matches(value)
        .iter()
        .next()
        .map(|index| DENYLIST[index].1)
}

/// Sanitize a cell value.
///
/// # Errors
/// `SecurityError::DangerousContent` when the value matches the denylist
pub fn sanitize(value: &str, max_length: usize, allow_html: bool) -> Result<String, SecurityError> {
    sanitize_with_report(value, max_length, allow_html).map(|sanitized| sanitized.value)
}

/// Sanitize a cell value, reporting truncation.
///
/// # Errors
/// `SecurityError::DangerousContent` when the value matches the denylist
pub fn sanitize_with_report(value: &str, max_length: usize, allow_html: bool) -> Result<Sanitized, SecurityError> {
    let trimmed = value.trim();

    let (mut current, truncated) = if trimmed.chars().count() > max_length {
        let cut: String = trimmed.chars().take(max_length).collect();
        (cut.trim_end().to_string(), true)
    } else {
        (trimmed.to_string(), false)
    };

    reject_dangerous(&current)?;

    if !allow_html {
        while TAG.is_match(&current) {
            current = TAG.replace_all(&current, "").into_owned();
            reject_dangerous(&current)?;
        }
        let stripped = current.trim();
        if stripped.len() != current.len() {
            current = stripped.to_string();
        }
    }

    Ok(Sanitized {
        value: current,
        truncated,
    })
}

fn reject_dangerous(value: &str) -> Result<(), SecurityError> {
    match find_dangerous(value) {
        Some(pattern) => Err(SecurityError::DangerousContent {
            pattern: pattern.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn trims_and_passes_plain_text() {
        assert_eq!(sanitize("  Alice  ", 100, false).unwrap(), "Alice");
    }

    #[test]
    fn truncates_to_exact_length() {
        let long = "a".repeat(12_000);
        let result = sanitize_with_report(&long, 10_000, false).unwrap();
        assert_eq!(result.value.chars().count(), 10_000);
        assert!(result.truncated);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let result = sanitize_with_report("ééééé", 3, false).unwrap();
        assert_eq!(result.value, "ééé");
    }

    #[test]
    fn script_tag_rejected_regardless_of_context() {
        for value in [
            "<script>x</script>",
            "hello <SCRIPT src=x> world",
            "before</script>after",
        ] {
            assert!(matches!(
                sanitize(value, 1000, false),
                Err(SecurityError::DangerousContent { .. })
            ));
            assert!(sanitize(value, 1000, true).is_err());
        }
    }

    #[test]
    fn eval_and_global_probing_rejected() {
        assert!(sanitize("eval(atob('x'))", 1000, false).is_err());
        assert!(sanitize("javascript:alert(1)", 1000, false).is_err());
        assert!(sanitize("window.location='x'", 1000, false).is_err());
        assert!(sanitize("<img src=x onerror=alert(1)>", 1000, false).is_err());
    }

    #[test]
    fn benign_words_pass() {
        assert_eq!(sanitize("onion = 3", 100, false).unwrap(), "onion = 3");
        assert_eq!(sanitize("medieval (castle)", 100, false).unwrap(), "medieval (castle)");
        assert_eq!(sanitize("a < b", 100, false).unwrap(), "a < b");
    }

    #[test]
    fn markup_stripped_unless_allowed() {
        assert_eq!(sanitize("<b>bold</b> text", 100, false).unwrap(), "bold text");
        assert_eq!(sanitize("<b>bold</b> text", 100, true).unwrap(), "<b>bold</b> text");
    }

    #[test]
    fn nested_tags_cannot_reassemble_script() {
        assert!(sanitize("<<b>script>alert(1)<</b>/script>", 1000, false).is_err());
    }

    #[test]
    fn truncation_runs_before_pattern_matching() {
        let value = format!("{}<script>", "a".repeat(20));
        assert_eq!(sanitize(&value, 20, false).unwrap(), "a".repeat(20));
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(
            value in "[ a-zA-Z0-9<>/=().:_\\-]{0,80}",
            max_length in 1usize..100,
            allow_html: bool,
        ) {
            if let Ok(once) = sanitize(&value, max_length, allow_html) {
                let twice = sanitize(&once, max_length, allow_html).unwrap();
                prop_assert_eq!(twice, once);
            }
        }
    }
}
