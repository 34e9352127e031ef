//! Lesson steps and the pass/fail roll-up handed to the progress tracker.

use serde::{Deserialize, Serialize};

use crate::types::{TestSpec, Verdict};

/// One lesson step as supplied by the content store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonStep {
    #[serde(default, alias = "starterCode")]
    pub starter_code: String,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
    #[serde(default)]
    pub hints: Vec<String>,
    /// Whether passing every test unlocks the next step.
    #[serde(default)]
    pub checkpoint: bool,
}

impl LessonStep {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Counts over one batch of verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// `true` only when every verdict passed. An empty batch counts as passed.
    pub all_passed: bool,
}

impl BatchSummary {
    pub fn from_verdicts(verdicts: &[Verdict]) -> Self {
        let passed = verdicts.iter().filter(|v| v.passed).count();
        Self {
            total: verdicts.len(),
            passed,
            failed: verdicts.len() - passed,
            all_passed: passed == verdicts.len(),
        }
    }

    pub fn unlocks_next_step(&self, checkpoint: bool) -> bool {
        self.all_passed && checkpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdicts(outcomes: &[bool]) -> Vec<Verdict> {
        let spec = TestSpec::pattern("x");
        outcomes
            .iter()
            .map(|&passed| Verdict::from_spec(&spec, passed, None))
            .collect()
    }

    #[test]
    fn test_counts() {
        let summary = BatchSummary::from_verdicts(&verdicts(&[true, false, true]));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_passed);
        assert!(!summary.unlocks_next_step(true));
    }

    #[test]
    fn test_checkpoint_gates_unlock() {
        let summary = BatchSummary::from_verdicts(&verdicts(&[true, true]));
        assert!(summary.all_passed);
        assert!(summary.unlocks_next_step(true));
        assert!(!summary.unlocks_next_step(false));
    }

    #[test]
    fn test_empty_batch() {
        let summary = BatchSummary::from_verdicts(&[]);
        assert_eq!(summary.total, 0);
        assert!(summary.all_passed);
    }

    #[test]
    fn test_lesson_step_from_json() {
        let step = LessonStep::from_json(
            r##"{
                "starterCode": "# print a greeting\n",
                "tests": [
                    {"type": "runtime", "assertion": "output_contains", "expected": "Hello"},
                    {"kind": "pattern", "assertion": "matches", "expected": "print\\(",
                     "description": "uses print"}
                ],
                "hints": ["Use print()"],
                "checkpoint": true
            }"##,
        )
        .expect("valid step");
        assert_eq!(step.starter_code, "# print a greeting\n");
        assert_eq!(step.tests.len(), 2);
        assert_eq!(step.tests[0], TestSpec::runtime("output_contains", "Hello"));
        assert_eq!(step.tests[1].kind, "pattern");
        assert_eq!(step.tests[1].description.as_deref(), Some("uses print"));
        assert_eq!(step.hints, vec!["Use print()"]);
        assert!(step.checkpoint);
    }

    #[test]
    fn test_lesson_step_defaults() {
        let step = LessonStep::from_json("{}").expect("empty object is a step");
        assert_eq!(step, LessonStep::default());
        assert!(!step.checkpoint);
    }
}
