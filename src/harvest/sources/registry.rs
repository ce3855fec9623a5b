//! Shared parse step of the npm and PyPI adapters.
//!
//! Both registries hand over the same [`RegistryArtifact`]: registry-side
//! metadata plus the distribution archive bytes. Parsing then:
//! 1. Extracts the archive in memory under the byte ceiling
//! 2. Reads the package manifest found inside it
//! 3. Collects capabilities (declarative section, else registration scan)
//! 4. Scans source members and classifies the findings (`code_risk`)
//! 5. Applies the ghost floor and scores health

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::analysis::{classify, Finding, HealthScorer, HealthSignals, RiskScanner};
use crate::ecosystem::{
    is_linkable_repository, normalize_repository_url, CoreMetadataParser, PackageJsonParser,
    PyprojectParser,
};
use crate::harvest::archive::{ExtractedArchive, SafeArchiveExtractor};
use crate::harvest::sources::{capabilities, risk};
use crate::harvest::traits::HarvestError;
use crate::model::{CatalogEntry, Dependency, Release, SourceType};
use crate::traits::{EcosystemParser, ManifestSummary};

/// Extensions whose members feed the code risk scan.
pub const SCANNED_EXTENSIONS: &[&str] = &["py", "js", "mjs", "cjs", "ts"];

/// What the registry API says about the selected release.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryMetadata {
    pub description: Option<String>,
    pub license: Option<String>,
    pub author: Option<String>,
    pub homepage: Option<String>,

    /// Raw repository link as published, normalized during parse
    pub repository: Option<String>,
    pub readme: Option<String>,
    pub published_at: Option<DateTime<Utc>>,

    /// Downloads over the last month, when the registry reports them
    pub downloads: i64,

    /// Dependencies declared to the registry (PyPI `requires_dist`)
    pub dependencies: Vec<Dependency>,
    pub releases: Vec<Release>,
}

/// A downloaded distribution and its registry metadata.
#[derive(Debug, Clone)]
pub struct RegistryArtifact {
    /// [`SourceType::Npm`] or [`SourceType::Pypi`]
    pub ecosystem: SourceType,

    /// Name as published (PyPI names are normalized into the locator)
    pub name: String,
    pub version: String,
    pub locator: String,

    /// File name or URL of the distribution, for logging
    pub distribution: String,
    pub archive: Vec<u8>,
    pub metadata: RegistryMetadata,
}

/// Limits applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_archive_bytes: u64,
    pub max_scanned_files: usize,
    pub max_scanned_file_bytes: usize,
}

struct CodeScan {
    findings: Vec<(String, Finding)>,
    files_scanned: usize,
    files_skipped: usize,
}

/// Builds and scores the entry for a downloaded distribution.
///
/// # Errors
///
/// - [`HarvestError::UnsafeArchive`] if decompression exceeds the ceiling
/// - [`HarvestError::MalformedSource`] if the archive is unreadable or an
///   npm tarball has no readable `package.json`
pub fn build_entry(
    artifact: &RegistryArtifact,
    limits: RegistryLimits,
    scorer: &HealthScorer,
    now: DateTime<Utc>,
) -> Result<CatalogEntry, HarvestError> {
    let archive = SafeArchiveExtractor::new(limits.max_archive_bytes).extract(&artifact.archive)?;
    debug!(
        locator = %artifact.locator,
        distribution = %artifact.distribution,
        members = archive.len(),
        bytes = archive.total_bytes(),
        skipped = archive.skipped(),
        "Archive extracted"
    );

    let manifest = read_manifest(artifact, &archive)?;
    let meta = &artifact.metadata;

    let mut entry = CatalogEntry::new(&artifact.locator, artifact.ecosystem, &artifact.name);
    entry.version = Some(artifact.version.clone());
    entry.description = manifest
        .as_ref()
        .and_then(|m| m.description.clone())
        .or_else(|| meta.description.clone());
    entry.license = manifest
        .as_ref()
        .and_then(|m| m.license.clone())
        .or_else(|| meta.license.clone());
    entry.author = manifest
        .as_ref()
        .and_then(|m| m.author.clone())
        .or_else(|| meta.author.clone());
    entry.homepage = manifest
        .as_ref()
        .and_then(|m| m.homepage.clone())
        .or_else(|| meta.homepage.clone());
    entry.repository_url = manifest
        .as_ref()
        .and_then(|m| m.repository.clone())
        .into_iter()
        .chain(meta.repository.as_deref().and_then(normalize_repository_url))
        .chain(entry.homepage.as_deref().and_then(normalize_repository_url))
        .find(|url| is_linkable_repository(url));
    entry.downloads = meta.downloads;
    entry.last_activity_at = meta.published_at;
    entry.harvested_at = now;
    entry.releases = meta.releases.clone();
    entry.dependencies = match &manifest {
        Some(m) if !m.dependencies.is_empty() => m.dependencies.clone(),
        _ => meta.dependencies.clone(),
    };

    entry.capabilities = collect_capabilities(artifact, &archive, manifest.as_ref(), limits);

    let scan = scan_sources(&archive, limits);
    let located: Vec<Finding> = scan.findings.iter().map(|(_, f)| f.clone()).collect();
    let code_level = classify(&located);
    entry.metadata.insert(
        risk::CODE_RISK_KEY.to_string(),
        json!({
            "level": code_level.as_str(),
            "files_scanned": scan.files_scanned,
            "files_skipped": scan.files_skipped,
            "findings": scan.findings.iter().map(|(path, f)| json!({
                "pattern": f.pattern,
                "path": path,
                "line": f.location.map(|l| l.line + 1),
                "detail": f.detail,
            })).collect::<Vec<_>>(),
        }),
    );
    entry
        .metadata
        .insert("ghost".to_string(), json!(entry.repository_url.is_none()));
    entry
        .metadata
        .insert("distribution".to_string(), json!(artifact.distribution));

    entry.risk_level = risk::assess(&entry, &[]);

    let has_readme = meta.readme.as_deref().is_some_and(|r| !r.trim().is_empty())
        || archive.iter().any(|m| is_readme(&m.path));
    let signals = HealthSignals {
        downloads: entry.downloads,
        has_readme: has_readme || entry.description.is_some(),
        has_description: entry.description.is_some(),
        has_license: entry.license.is_some(),
        has_linked_repository: entry.repository_url.is_some(),
        has_tests: manifest.as_ref().is_some_and(|m| m.has_tests),
        capability_count: entry.capabilities.len(),
        ..HealthSignals::default()
    }
    .with_activity(meta.published_at, now);
    entry.health_score = scorer.score(&signals);

    Ok(entry)
}

fn is_readme(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    file.starts_with("readme") && path.matches('/').count() <= 1
}

/// Shallowest member named `file_name`.
fn shallowest<'a>(archive: &'a ExtractedArchive, file_name: &str) -> Option<&'a [u8]> {
    archive
        .iter()
        .filter(|m| m.path == file_name || m.path.ends_with(&format!("/{}", file_name)))
        .min_by_key(|m| m.path.matches('/').count())
        .map(|m| m.data.as_slice())
}

fn read_manifest(
    artifact: &RegistryArtifact,
    archive: &ExtractedArchive,
) -> Result<Option<ManifestSummary>, HarvestError> {
    match artifact.ecosystem {
        SourceType::Npm => {
            let bytes = archive
                .find("package/package.json")
                .map(|m| m.data.as_slice())
                .or_else(|| shallowest(archive, "package.json"))
                .ok_or_else(|| {
                    HarvestError::MalformedSource(format!(
                        "{} has no package.json",
                        artifact.distribution
                    ))
                })?;
            Ok(Some(PackageJsonParser.parse(bytes)?))
        }
        _ => {
            let wheel_metadata = archive
                .iter()
                .find(|m| m.path.ends_with(".dist-info/METADATA"))
                .map(|m| (&CoreMetadataParser as &dyn EcosystemParser, m.data.as_slice()));
            let candidates = wheel_metadata
                .into_iter()
                .chain(shallowest(archive, "pyproject.toml").map(|b| (&PyprojectParser as &dyn EcosystemParser, b)))
                .chain(shallowest(archive, "PKG-INFO").map(|b| (&CoreMetadataParser as &dyn EcosystemParser, b)));

            for (parser, bytes) in candidates {
                match parser.parse(bytes) {
                    Ok(summary) => return Ok(Some(summary)),
                    Err(e) => warn!(
                        locator = %artifact.locator,
                        descriptor = parser.descriptor_name(),
                        error = %e,
                        "Unreadable descriptor, trying next"
                    ),
                }
            }
            warn!(locator = %artifact.locator, "No readable descriptor, using registry metadata");
            Ok(None)
        }
    }
}

/// Declarative section first (`mcp.json`, `server.json`, the `mcp` key),
/// registration scan only when none exists.
fn collect_capabilities(
    artifact: &RegistryArtifact,
    archive: &ExtractedArchive,
    manifest: Option<&ManifestSummary>,
    limits: RegistryLimits,
) -> Vec<crate::model::Capability> {
    for declaration in ["mcp.json", "server.json"] {
        if let Some(bytes) = shallowest(archive, declaration) {
            match capabilities::from_manifest_bytes(bytes) {
                Ok(caps) => return caps,
                Err(e) => warn!(
                    locator = %artifact.locator,
                    declaration,
                    error = %e,
                    "Unreadable capability declaration"
                ),
            }
        }
    }
    if let Some(section) = manifest.and_then(|m| m.capability_section.as_ref()) {
        if section.is_object() {
            return capabilities::from_manifest(section);
        }
    }

    let mut found = Vec::new();
    for member in scannable(archive, limits).take(limits.max_scanned_files) {
        if let Ok(text) = std::str::from_utf8(&member.data) {
            capabilities::merge(&mut found, capabilities::scan_registrations(text));
        }
    }
    found
}

fn scannable<'a>(
    archive: &'a ExtractedArchive,
    limits: RegistryLimits,
) -> impl Iterator<Item = &'a crate::harvest::archive::ArchiveMember> {
    archive.iter().filter(move |m| {
        let ext = Path::new(&m.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        SCANNED_EXTENSIONS.contains(&ext.as_str())
            && !m.path.contains("node_modules/")
            && !m.path.ends_with(".d.ts")
            && m.data.len() <= limits.max_scanned_file_bytes
    })
}

fn scan_sources(archive: &ExtractedArchive, limits: RegistryLimits) -> CodeScan {
    let scanner = RiskScanner::new();
    let candidates: Vec<_> = scannable(archive, limits).collect();
    let files_scanned = candidates.len().min(limits.max_scanned_files);

    let mut findings = Vec::new();
    for member in candidates.iter().take(limits.max_scanned_files) {
        for finding in scanner.scan_file(Path::new(&member.path), &member.data) {
            findings.push((member.path.clone(), finding));
        }
    }

    CodeScan {
        findings,
        files_scanned,
        files_skipped: candidates.len() - files_scanned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::HealthProfile;
    use crate::harvest::archive::tests::{tar_gz, zip};
    use crate::model::{CapabilityKind, RiskLevel};

    fn limits() -> RegistryLimits {
        RegistryLimits {
            max_archive_bytes: 1 << 20,
            max_scanned_files: 200,
            max_scanned_file_bytes: 1 << 20,
        }
    }

    fn npm_artifact(archive: Vec<u8>) -> RegistryArtifact {
        RegistryArtifact {
            ecosystem: SourceType::Npm,
            name: "weather-mcp".to_string(),
            version: "1.0.0".to_string(),
            locator: "npm:weather-mcp".to_string(),
            distribution: "weather-mcp-1.0.0.tgz".to_string(),
            archive,
            metadata: RegistryMetadata {
                downloads: 5000,
                ..RegistryMetadata::default()
            },
        }
    }

    fn scorer() -> HealthScorer {
        HealthScorer::new(HealthProfile::registry())
    }

    #[test]
    fn test_npm_package_with_linked_repository() {
        let archive = tar_gz(&[
            (
                "package/package.json",
                br#"{"name":"weather-mcp","license":"MIT","description":"Weather tools",
                     "repository":"github:acme/weather-mcp",
                     "dependencies":{"@modelcontextprotocol/sdk":"^1.0.0"}}"#,
            ),
            (
                "package/dist/index.js",
                b"const https = require('https');\nserver.tool(\"forecast\", {}, async () => {});\n",
            ),
        ]);
        let entry = build_entry(&npm_artifact(archive), limits(), &scorer(), Utc::now()).unwrap();

        assert_eq!(entry.repository_url.as_deref(), Some("https://github.com/acme/weather-mcp"));
        assert_eq!(entry.capabilities, vec![crate::model::Capability::new(CapabilityKind::Tool, "forecast")]);
        assert_eq!(entry.risk_level, RiskLevel::Moderate);
        assert_eq!(entry.metadata["code_risk"]["level"], "moderate");
        assert_eq!(entry.metadata["code_risk"]["findings"][0]["path"], "package/dist/index.js");
        assert_eq!(entry.metadata["ghost"], false);
    }

    #[test]
    fn test_ghost_package_is_floored_at_high() {
        let archive = tar_gz(&[
            (
                "package/package.json",
                br#"{"name":"weather-mcp","license":"MIT","description":"Weather tools","mcp":{"tools":["a","b"]}}"#,
            ),
            ("package/README.md", b"# Weather"),
        ]);
        let mut artifact = npm_artifact(archive);
        artifact.metadata.downloads = 2_000_000;
        artifact.metadata.published_at = Some(Utc::now());

        let entry = build_entry(&artifact, limits(), &scorer(), Utc::now()).unwrap();
        assert!(entry.repository_url.is_none());
        assert_eq!(entry.capabilities.len(), 2);
        assert_eq!(entry.risk_level, RiskLevel::High);
        assert!(entry.health_score > 50);
    }

    #[test]
    fn test_ghost_typescript_with_quoted_brace_is_high() {
        let archive = tar_gz(&[
            ("package/package.json", br#"{"name":"weather-mcp"}"#),
            ("package/index.ts", b"const open = '{';\n"),
        ]);
        let entry = build_entry(&npm_artifact(archive), limits(), &scorer(), Utc::now()).unwrap();

        assert_eq!(entry.metadata["code_risk"]["level"], "safe");
        assert_eq!(entry.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_ghost_floor_lifts_unknown_scan() {
        let archive = tar_gz(&[
            ("package/package.json", br#"{"name":"weather-mcp"}"#),
            ("package/index.ts", b"function broken( {\n"),
        ]);
        let entry = build_entry(&npm_artifact(archive), limits(), &scorer(), Utc::now()).unwrap();

        assert_eq!(entry.metadata["code_risk"]["level"], "unknown");
        assert_eq!(entry.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_eval_in_ghost_package_stays_critical() {
        let archive = tar_gz(&[
            ("package/package.json", br#"{"name":"x"}"#),
            ("package/index.js", b"eval(process.argv[2]);\n"),
        ]);
        let entry = build_entry(&npm_artifact(archive), limits(), &scorer(), Utc::now()).unwrap();
        assert_eq!(entry.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_npm_without_manifest_is_malformed() {
        let archive = tar_gz(&[("package/index.js", b"module.exports = 1;\n")]);
        let err = build_entry(&npm_artifact(archive), limits(), &scorer(), Utc::now()).unwrap_err();
        assert!(matches!(err, HarvestError::MalformedSource(_)));
    }

    #[test]
    fn test_archive_over_ceiling_is_unsafe() {
        let archive = tar_gz(&[("package/package.json", &[b' '; 4096])]);
        let tight = RegistryLimits {
            max_archive_bytes: 1024,
            ..limits()
        };
        let err = build_entry(&npm_artifact(archive), tight, &scorer(), Utc::now()).unwrap_err();
        assert!(matches!(err, HarvestError::UnsafeArchive(_)));
    }

    #[test]
    fn test_wheel_with_core_metadata() {
        let archive = zip(&[
            (
                "mcp_server_time-0.6.2.dist-info/METADATA",
                b"Metadata-Version: 2.1\nName: mcp-server-time\nVersion: 0.6.2\nLicense: MIT\n\
Project-URL: Source, https://github.com/modelcontextprotocol/servers\nRequires-Dist: tzdata\n",
            ),
            (
                "mcp_server_time/server.py",
                b"import subprocess\n\n@server.tool()\ndef get_time():\n    subprocess.run(['date'])\n",
            ),
        ]);
        let artifact = RegistryArtifact {
            ecosystem: SourceType::Pypi,
            name: "mcp-server-time".to_string(),
            version: "0.6.2".to_string(),
            locator: "pypi:mcp-server-time".to_string(),
            distribution: "mcp_server_time-0.6.2-py3-none-any.whl".to_string(),
            archive,
            metadata: RegistryMetadata::default(),
        };
        let entry = build_entry(&artifact, limits(), &scorer(), Utc::now()).unwrap();

        assert_eq!(entry.license.as_deref(), Some("MIT"));
        assert_eq!(entry.dependencies[0].library_name, "tzdata");
        assert_eq!(entry.capabilities[0].name, "get_time");
        assert_eq!(entry.risk_level, RiskLevel::High);
    }
}
