//! Expected-vs-actual output comparison for test cases.

use serde::{Deserialize, Serialize};

/// Independently toggleable normalization rules. All off means an exact
/// comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputComparison {
    /// Collapse every whitespace run to one space and trim the ends.
    pub ignore_whitespace: bool,
    /// Treat `\r\n` and `\r` as `\n`.
    pub ignore_line_endings: bool,
    pub trim: bool,
    pub ignore_case: bool,
}

impl OutputComparison {
    /// Apply the enabled rules in a fixed order: whitespace, line endings,
    /// trim, case.
    pub fn normalize(&self, text: &str) -> String {
        let mut out = text.to_string();
        if self.ignore_whitespace {
            out = out.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        if self.ignore_line_endings {
            out = out.replace("\r\n", "\n").replace('\r', "\n");
        }
        if self.trim {
            out = out.trim().to_string();
        }
        if self.ignore_case {
            out = out.to_lowercase();
        }
        out
    }

    pub fn matches(&self, expected: &str, actual: &str) -> bool {
        self.normalize(expected) == self.normalize(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_by_default() {
        let rules = OutputComparison::default();
        assert!(rules.matches("Hello\n", "Hello\n"));
        assert!(!rules.matches("Hello\n", "hello"));
    }

    #[test]
    fn case_and_trim_compose() {
        let rules = OutputComparison {
            ignore_case: true,
            trim: true,
            ..OutputComparison::default()
        };
        assert!(rules.matches("Hello\n", "hello"));

        let only_case = OutputComparison {
            ignore_case: true,
            ..OutputComparison::default()
        };
        assert!(!only_case.matches("Hello\n", "hello"));
    }

    #[test]
    fn whitespace_runs_collapse() {
        let rules = OutputComparison {
            ignore_whitespace: true,
            ..OutputComparison::default()
        };
        assert!(rules.matches("1  2\t3\n", " 1 2 3"));
        assert!(!rules.matches("12 3", "1 2 3"));
    }

    #[test]
    fn line_endings_are_unified() {
        let rules = OutputComparison {
            ignore_line_endings: true,
            ..OutputComparison::default()
        };
        assert!(rules.matches("a\nb\n", "a\r\nb\r"));
        assert!(!OutputComparison::default().matches("a\nb\n", "a\r\nb\r\n"));
    }

    #[test]
    fn decodes_partial_settings() {
        let rules: OutputComparison = serde_json::from_str(r#"{"trim": true}"#).unwrap();
        assert!(rules.trim);
        assert!(!rules.ignore_case);
    }
}
