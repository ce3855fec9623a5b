//! Risk assessment of a finished entry.
//!
//! Adapters compute an entry's risk level here from what they put on the
//! entry (metadata, dependencies, capabilities, locator), so that the same
//! assessment can be replayed later over stored entries by
//! [`maintenance::recompute_risk`](crate::maintenance::recompute_risk).

use serde_json::Value;

use crate::analysis::{capability_findings, classify, overlay, Finding};
use crate::ecosystem::is_linkable_repository;
use crate::model::{CatalogEntry, RiskLevel, SourceType};

/// Metadata key holding the code scan summary of registry packages.
pub const CODE_RISK_KEY: &str = "code_risk";

/// Metadata key set on container images whose entrypoint runs a shell.
pub const SHELL_ENTRYPOINT_KEY: &str = "shell_entrypoint";

/// Owner segment of a `https://github.com/{owner}/{name}` locator.
pub fn github_owner(locator: &str) -> Option<&str> {
    locator
        .strip_prefix("https://github.com/")
        .and_then(|rest| rest.split('/').next())
        .filter(|owner| !owner.is_empty())
}

/// Whether a source-control entry belongs to an official namespace.
pub fn is_official_owner(locator: &str, official_namespaces: &[String]) -> bool {
    github_owner(locator)
        .map(|owner| {
            official_namespaces
                .iter()
                .any(|ns| ns.eq_ignore_ascii_case(owner))
        })
        .unwrap_or(false)
}

/// Official Docker Hub images live in the `library/` namespace.
pub fn is_official_image(locator: &str) -> bool {
    locator.starts_with("docker:library/")
}

/// Findings recorded under [`CODE_RISK_KEY`], without locations.
pub fn recorded_findings(entry: &CatalogEntry) -> Vec<Finding> {
    entry
        .metadata
        .get(CODE_RISK_KEY)
        .and_then(|summary| summary.get("findings"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("pattern").and_then(Value::as_str))
                .map(Finding::named)
                .collect()
        })
        .unwrap_or_default()
}

/// Risk level of `entry` after every overlay for its source.
///
/// - source control: official ⇒ safe, else unverified ⇒ moderate; a
///   runtime dependency on the denylist floors at moderate for official
///   owners and high for everyone else
/// - npm / PyPI: classified code findings, ghost ⇒ high
/// - container: official ⇒ safe, else moderate; shell entrypoint ⇒ high
/// - endpoint: findings implied by capability names, unverified ⇒
///   moderate, plain `http://` ⇒ high
pub fn assess(entry: &CatalogEntry, official_namespaces: &[String]) -> RiskLevel {
    match entry.source_type {
        SourceType::SourceControl => {
            let official = is_official_owner(&entry.locator, official_namespaces);
            let dangerous = !overlay::dangerous_dependencies(&entry.dependencies).is_empty();
            let level = overlay::unverified(RiskLevel::Safe, official);
            overlay::dependency_provenance(level, official, dangerous)
        }
        SourceType::Npm | SourceType::Pypi => {
            let level = classify(&recorded_findings(entry));
            let linked = entry
                .repository_url
                .as_deref()
                .map(is_linkable_repository)
                .unwrap_or(false);
            overlay::ghost(level, linked)
        }
        SourceType::Container => {
            let level = overlay::unverified(RiskLevel::Safe, is_official_image(&entry.locator));
            let shell = entry
                .metadata
                .get(SHELL_ENTRYPOINT_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if shell {
                level.at_least(RiskLevel::High)
            } else {
                level
            }
        }
        SourceType::Endpoint => {
            let level = classify(&capability_findings(&entry.capabilities));
            let level = overlay::unverified(level, entry.verified);
            overlay::insecure_transport(level, entry.locator.starts_with("https://"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyKind};
    use serde_json::json;

    fn namespaces() -> Vec<String> {
        vec!["modelcontextprotocol".to_string()]
    }

    #[test]
    fn test_github_provenance() {
        let mut entry = CatalogEntry::new(
            "https://github.com/modelcontextprotocol/servers",
            SourceType::SourceControl,
            "servers",
        );
        assert_eq!(assess(&entry, &namespaces()), RiskLevel::Safe);

        entry.dependencies.push(Dependency {
            library_name: "Puppeteer".to_string(),
            version_constraint: None,
            ecosystem: "npm".to_string(),
            kind: DependencyKind::Runtime,
        });
        assert_eq!(assess(&entry, &namespaces()), RiskLevel::Moderate);

        entry.locator = "https://github.com/someone/servers".to_string();
        assert_eq!(assess(&entry, &namespaces()), RiskLevel::High);
    }

    #[test]
    fn test_registry_uses_recorded_findings() {
        let mut entry = CatalogEntry::new("npm:demo", SourceType::Npm, "demo");
        entry.repository_url = Some("https://github.com/acme/demo".to_string());
        entry.metadata.insert(
            CODE_RISK_KEY.to_string(),
            json!({"findings": [{"pattern": "network-import"}]}),
        );
        assert_eq!(assess(&entry, &[]), RiskLevel::Moderate);

        entry.repository_url = None;
        assert_eq!(assess(&entry, &[]), RiskLevel::High);
    }

    #[test]
    fn test_container_shell_entrypoint() {
        let mut entry = CatalogEntry::new("docker:library/node", SourceType::Container, "node");
        assert_eq!(assess(&entry, &[]), RiskLevel::Safe);
        entry.locator = "docker:acme/mcp".to_string();
        assert_eq!(assess(&entry, &[]), RiskLevel::Moderate);
        entry
            .metadata
            .insert(SHELL_ENTRYPOINT_KEY.to_string(), json!(true));
        assert_eq!(assess(&entry, &[]), RiskLevel::High);
    }
}
