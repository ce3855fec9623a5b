//! Rule-based risk classification.
//!
//! [`classify`] is adapter-agnostic and only looks at finding categories.
//! Source-specific adjustments (ghost packages, transport, provenance) live
//! in [`overlay`] and are applied by adapters on top of the classified level.

use crate::model::{Capability, Dependency, RiskLevel};

use super::findings::{patterns, Finding, FindingCategory};

/// Maps findings to a [`RiskLevel`].
///
/// Precedence:
/// 1. any dynamic evaluation or dynamic import ⇒ `Critical`
/// 2. process execution, with or without network/filesystem access ⇒ `High`
/// 3. network or filesystem access alone ⇒ `Moderate`
/// 4. no findings ⇒ `Safe`
/// 5. only unparseable/unsupported markers ⇒ `Unknown`
///
/// Unparseable markers next to real findings do not mask them.
pub fn classify(findings: &[Finding]) -> RiskLevel {
    if findings.is_empty() {
        return RiskLevel::Safe;
    }

    let mut dynamic_eval = false;
    let mut process_exec = false;
    let mut network = false;
    let mut filesystem = false;
    let mut unparseable = false;

    for finding in findings {
        match finding.category() {
            Some(FindingCategory::DynamicEval) => dynamic_eval = true,
            Some(FindingCategory::ProcessExec) => process_exec = true,
            Some(FindingCategory::Network) => network = true,
            Some(FindingCategory::Filesystem) => filesystem = true,
            Some(FindingCategory::Unparseable) | None => unparseable = true,
        }
    }

    if dynamic_eval {
        RiskLevel::Critical
    } else if process_exec {
        RiskLevel::High
    } else if network || filesystem {
        RiskLevel::Moderate
    } else if unparseable {
        RiskLevel::Unknown
    } else {
        RiskLevel::Safe
    }
}

/// Keyword table mapping capability text to the finding it implies.
const CAPABILITY_KEYWORDS: &[(&str, &str)] = &[
    ("eval", patterns::EVAL_CALL),
    ("execute code", patterns::EVAL_CALL),
    ("run code", patterns::EVAL_CALL),
    ("shell", patterns::SUBPROCESS_CALL),
    ("exec", patterns::SUBPROCESS_CALL),
    ("command", patterns::OS_COMMAND),
    ("terminal", patterns::OS_COMMAND),
    ("fetch", patterns::NETWORK_IMPORT),
    ("http", patterns::NETWORK_IMPORT),
    ("url", patterns::NETWORK_IMPORT),
    ("request", patterns::NETWORK_IMPORT),
    ("download", patterns::NETWORK_IMPORT),
    ("write", patterns::FILESYSTEM_WRITE),
    ("delete", patterns::FILESYSTEM_WRITE),
    ("file", patterns::FILESYSTEM_IMPORT),
    ("directory", patterns::FILESYSTEM_IMPORT),
];

/// Findings implied by declared capabilities (names and descriptions).
///
/// Used where no source code is available, e.g. remote endpoints.
pub fn capability_findings(capabilities: &[Capability]) -> Vec<Finding> {
    let mut findings = Vec::new();
    for capability in capabilities {
        let haystack = format!(
            "{} {}",
            capability.name,
            capability.description.as_deref().unwrap_or("")
        )
        .to_lowercase();
        for (keyword, pattern) in CAPABILITY_KEYWORDS {
            if haystack.contains(keyword) {
                findings.push(Finding {
                    pattern: pattern.to_string(),
                    location: None,
                    detail: Some(capability.name.clone()),
                });
            }
        }
    }
    super::findings::normalize(&mut findings);
    findings
}

/// Adapter-level floors.
///
/// Each helper returns the adjusted level and none of them lowers a level.
/// Only [`ghost`] raises [`RiskLevel::Unknown`]; the other floors leave an
/// unanalyzable entry as it is.
pub mod overlay {
    use super::*;

    /// Dependencies that give a server process, browser or remote-shell reach.
    pub const DANGEROUS_DEPENDENCIES: &[&str] = &[
        "shelljs",
        "execa",
        "node-pty",
        "child-process-promise",
        "puppeteer",
        "playwright",
        "selenium",
        "paramiko",
        "fabric",
        "pexpect",
        "sh",
        "plumbum",
        "docker",
        "invoke",
    ];

    /// Names of runtime dependencies that appear on the denylist.
    pub fn dangerous_dependencies(dependencies: &[Dependency]) -> Vec<String> {
        let mut names: Vec<String> = dependencies
            .iter()
            .filter(|d| d.kind != crate::model::DependencyKind::Dev)
            .map(|d| d.library_name.to_lowercase())
            .filter(|name| DANGEROUS_DEPENDENCIES.contains(&name.as_str()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// A package with no linkable repository cannot be audited, whatever
    /// its code scan said.
    pub fn ghost(level: RiskLevel, has_linked_repository: bool) -> RiskLevel {
        match (has_linked_repository, level) {
            (true, level) => level,
            (false, RiskLevel::Unknown) => RiskLevel::High,
            (false, level) => level.at_least(RiskLevel::High),
        }
    }

    /// Plain-text transport exposes every exchanged payload.
    pub fn insecure_transport(level: RiskLevel, encrypted: bool) -> RiskLevel {
        if encrypted {
            level
        } else {
            level.at_least(RiskLevel::High)
        }
    }

    pub fn unverified(level: RiskLevel, verified: bool) -> RiskLevel {
        if verified {
            level
        } else {
            level.at_least(RiskLevel::Moderate)
        }
    }

    /// Provenance combined with dangerous dependencies.
    ///
    /// Official owners are trusted one step further than everyone else:
    /// official ⇒ `Moderate` floor, unofficial ⇒ `High` floor.
    pub fn dependency_provenance(level: RiskLevel, official: bool, has_dangerous: bool) -> RiskLevel {
        match (official, has_dangerous) {
            (_, false) => level,
            (true, true) => level.at_least(RiskLevel::Moderate),
            (false, true) => level.at_least(RiskLevel::High),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CapabilityKind, DependencyKind};

    fn named(patterns: &[&str]) -> Vec<Finding> {
        patterns.iter().map(|p| Finding::named(*p)).collect()
    }

    #[test]
    fn test_eval_dominates_everything() {
        let findings = named(&[patterns::EVAL_CALL, patterns::NETWORK_IMPORT]);
        assert_eq!(classify(&findings), RiskLevel::Critical);
        let findings = named(&[
            patterns::SYNTAX_ERROR,
            patterns::SUBPROCESS_CALL,
            patterns::DYNAMIC_IMPORT,
        ]);
        assert_eq!(classify(&findings), RiskLevel::Critical);
    }

    #[test]
    fn test_precedence_ladder() {
        assert_eq!(
            classify(&named(&[patterns::SUBPROCESS_CALL, patterns::NETWORK_IMPORT])),
            RiskLevel::High
        );
        assert_eq!(classify(&named(&[patterns::OS_COMMAND])), RiskLevel::High);
        assert_eq!(
            classify(&named(&[patterns::FILESYSTEM_WRITE])),
            RiskLevel::Moderate
        );
        assert_eq!(classify(&[]), RiskLevel::Safe);
        assert_eq!(
            classify(&named(&[patterns::UNSUPPORTED_LANGUAGE])),
            RiskLevel::Unknown
        );
        assert_eq!(
            classify(&named(&[patterns::SYNTAX_ERROR, patterns::NETWORK_IMPORT])),
            RiskLevel::Moderate
        );
    }

    #[test]
    fn test_classification_is_order_independent() {
        let mut findings = named(&[
            patterns::NETWORK_IMPORT,
            patterns::FILESYSTEM_IMPORT,
            patterns::OS_COMMAND,
        ]);
        let forward = classify(&findings);
        findings.reverse();
        assert_eq!(classify(&findings), forward);
    }

    #[test]
    fn test_overlays_only_raise() {
        assert_eq!(overlay::ghost(RiskLevel::Safe, false), RiskLevel::High);
        assert_eq!(overlay::ghost(RiskLevel::Critical, false), RiskLevel::Critical);
        assert_eq!(overlay::ghost(RiskLevel::Safe, true), RiskLevel::Safe);
        assert_eq!(
            overlay::insecure_transport(RiskLevel::Moderate, false),
            RiskLevel::High
        );
        assert_eq!(overlay::unverified(RiskLevel::Safe, false), RiskLevel::Moderate);
        assert_eq!(overlay::unverified(RiskLevel::Unknown, false), RiskLevel::Unknown);
    }

    #[test]
    fn test_ghost_floor_applies_to_unknown() {
        assert_eq!(overlay::ghost(RiskLevel::Unknown, false), RiskLevel::High);
        assert_eq!(overlay::ghost(RiskLevel::Unknown, true), RiskLevel::Unknown);
    }

    #[test]
    fn test_dependency_provenance() {
        let deps = vec![
            Dependency {
                library_name: "Puppeteer".to_string(),
                version_constraint: None,
                ecosystem: "npm".to_string(),
                kind: DependencyKind::Runtime,
            },
            Dependency {
                library_name: "execa".to_string(),
                version_constraint: None,
                ecosystem: "npm".to_string(),
                kind: DependencyKind::Dev,
            },
        ];
        let dangerous = overlay::dangerous_dependencies(&deps);
        assert_eq!(dangerous, vec!["puppeteer".to_string()]);

        assert_eq!(
            overlay::dependency_provenance(RiskLevel::Safe, true, true),
            RiskLevel::Moderate
        );
        assert_eq!(
            overlay::dependency_provenance(RiskLevel::Moderate, false, true),
            RiskLevel::High
        );
        assert_eq!(
            overlay::dependency_provenance(RiskLevel::Safe, false, false),
            RiskLevel::Safe
        );
    }

    #[test]
    fn test_capability_findings() {
        let mut run = Capability::new(CapabilityKind::Tool, "run_shell");
        run.description = Some("Runs a terminal command".to_string());
        let weather = Capability::new(CapabilityKind::Tool, "get_weather");

        let findings = capability_findings(&[run, weather]);
        let names: Vec<_> = findings.iter().map(|f| f.pattern.as_str()).collect();
        assert!(names.contains(&patterns::SUBPROCESS_CALL));
        assert!(names.contains(&patterns::OS_COMMAND));
        assert_eq!(classify(&findings), RiskLevel::High);

        let benign = capability_findings(&[Capability::new(CapabilityKind::Prompt, "summarize")]);
        assert!(benign.is_empty());
    }
}
