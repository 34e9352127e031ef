//! Pattern checks: a regular expression searched anywhere in the raw source.

use regex::RegexBuilder;
use tracing::debug;

use crate::error::CheckError;

/// Upper bound on the compiled size of a lesson-authored pattern.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// `true` when `pattern` matches somewhere in `source`.
///
/// The assertion name carried by the test is not consulted.
pub fn evaluate(source: &str, pattern: &str) -> Result<bool, CheckError> {
    let re = RegexBuilder::new(pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| {
            debug!(pattern, error = %e, "rejecting pattern");
            CheckError::InvalidRegex
        })?;
    Ok(re.is_match(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_loop_pattern() {
        let source = "for i in range(3):\n    print(i)";
        assert_eq!(evaluate(source, r"for\s+\w+\s+in"), Ok(true));
        assert_eq!(evaluate("print(0)\nprint(1)", r"for\s+\w+\s+in"), Ok(false));
    }

    #[test]
    fn test_matches_inside_comments_and_strings() {
        assert_eq!(evaluate("# use a while loop", "while"), Ok(true));
        assert_eq!(evaluate("s = 'while'", "while"), Ok(true));
    }

    #[test]
    fn test_multiline_flag_in_pattern() {
        let source = "x = 1\ndef f():\n    pass";
        assert_eq!(evaluate(source, r"(?m)^def "), Ok(true));
        assert_eq!(evaluate(source, r"^def "), Ok(false));
    }

    #[test]
    fn test_invalid_regex() {
        assert_eq!(evaluate("anything", "(unclosed"), Err(CheckError::InvalidRegex));
        assert_eq!(evaluate("anything", "[z-a]"), Err(CheckError::InvalidRegex));
    }

    #[test]
    fn test_empty_pattern_matches() {
        assert_eq!(evaluate("", ""), Ok(true));
    }
}
