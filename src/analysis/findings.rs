//! Findings produced by the risk scanner.
//!
//! A finding is identified by its pattern name. The name determines the
//! [`FindingCategory`] the classifier reasons about.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Pattern names emitted by the scanner.
pub mod patterns {
    /// `eval(...)`, `exec(...)`, `compile(...)`, `new Function(...)`
    pub const EVAL_CALL: &str = "eval-call";
    /// `__import__(name)`, `importlib.import_module`, `require(expr)`, `import(expr)`
    pub const DYNAMIC_IMPORT: &str = "dynamic-import";
    pub const SUBPROCESS_CALL: &str = "subprocess-call";
    pub const OS_COMMAND: &str = "os-command";
    pub const NETWORK_IMPORT: &str = "network-import";
    pub const FILESYSTEM_IMPORT: &str = "filesystem-import";
    pub const FILESYSTEM_WRITE: &str = "filesystem-write";
    pub const SYNTAX_ERROR: &str = "syntax-error";
    pub const UNSUPPORTED_LANGUAGE: &str = "unsupported-language";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingCategory {
    DynamicEval,
    ProcessExec,
    Network,
    Filesystem,
    Unparseable,
}

impl FindingCategory {
    /// Category of a pattern name, `None` for names the scanner never emits.
    pub fn of(pattern: &str) -> Option<Self> {
        use patterns::*;
        match pattern {
            EVAL_CALL | DYNAMIC_IMPORT => Some(FindingCategory::DynamicEval),
            SUBPROCESS_CALL | OS_COMMAND => Some(FindingCategory::ProcessExec),
            NETWORK_IMPORT => Some(FindingCategory::Network),
            FILESYSTEM_IMPORT | FILESYSTEM_WRITE => Some(FindingCategory::Filesystem),
            SYNTAX_ERROR | UNSUPPORTED_LANGUAGE => Some(FindingCategory::Unparseable),
            _ => None,
        }
    }
}

/// Zero-based line and column of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

/// One detected security-relevant pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Finding {
    pub pattern: String,
    pub location: Option<Location>,

    /// The matched callee or module, when known
    pub detail: Option<String>,
}

impl Finding {
    /// A finding with no location, as used when reasoning about names alone.
    pub fn named(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            location: None,
            detail: None,
        }
    }

    pub fn at(pattern: &str, line: usize, column: usize, detail: Option<&str>) -> Self {
        Self {
            pattern: pattern.to_string(),
            location: Some(Location { line, column }),
            detail: detail.map(str::to_string),
        }
    }

    pub fn category(&self) -> Option<FindingCategory> {
        FindingCategory::of(&self.pattern)
    }
}

impl PartialOrd for Finding {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Document order; located findings before unlocated ones, then by name.
impl Ord for Finding {
    fn cmp(&self, other: &Self) -> Ordering {
        let position = match (&self.location, &other.location) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        position
            .then_with(|| self.pattern.cmp(&other.pattern))
            .then_with(|| self.detail.cmp(&other.detail))
    }
}

/// Sorts findings into their canonical order and drops exact duplicates.
pub fn normalize(findings: &mut Vec<Finding>) {
    findings.sort();
    findings.dedup();
}
