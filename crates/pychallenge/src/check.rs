//! Test-kind dispatch.

use std::fmt;
use std::str::FromStr;

use crate::error::CheckError;

/// Which evaluator grades a [`TestSpec`](crate::TestSpec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    /// Output of the shared sandbox run.
    Runtime,
    /// Syntax-tree facts of the source.
    Static,
    /// Regular expression over the raw source.
    Pattern,
}

impl TestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::Runtime => "runtime",
            TestKind::Static => "static",
            TestKind::Pattern => "pattern",
        }
    }
}

impl FromStr for TestKind {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runtime" => Ok(TestKind::Runtime),
            "static" => Ok(TestKind::Static),
            "pattern" | "regex" => Ok(TestKind::Pattern),
            other => Err(CheckError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
