//! Static analysis and scoring.
//!
//! Everything here is synchronous and pure: the scanner turns source text
//! into findings, the classifier turns findings into a risk level, and the
//! health scorer turns normalized signals into a score. None of it touches
//! the network or the database, so maintenance jobs reuse it directly.

pub mod classifier;
pub mod findings;
pub mod health;
pub mod lexical;
pub mod scanner;

pub use classifier::{capability_findings, classify, overlay};
pub use findings::{Finding, FindingCategory, Location};
pub use health::{HealthProfile, HealthScorer, HealthSignals};
pub use scanner::{Language, RiskScanner};
