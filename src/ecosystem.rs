//! Ecosystem descriptor parsers.
//!
//! - [`PackageJsonParser`] reads npm `package.json`
//! - [`PyprojectParser`] reads PEP 621 and Poetry `pyproject.toml`
//! - [`parse_requirement`] splits PEP 508 requirement strings
//!
//! Also hosts repository URL normalization, which decides whether a package
//! links to a verifiable source repository.

use crate::model::{Dependency, DependencyKind};
use crate::traits::{EcosystemParser, ManifestSummary, ParseError};
use serde_json::Value as JsonValue;
use toml::Value as TomlValue;

/// Hosts whose repository links count as verifiable source control.
pub const SOURCE_CONTROL_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

const TEST_RUNNERS: &[&str] = &[
    "jest", "mocha", "vitest", "ava", "tap", "pytest", "nose", "nose2", "tox",
];

// ============================================================================
// package.json
// ============================================================================

pub struct PackageJsonParser;

impl EcosystemParser for PackageJsonParser {
    fn ecosystem_id(&self) -> &str {
        "npm"
    }

    fn descriptor_name(&self) -> &str {
        "package.json"
    }

    fn parse(&self, content: &[u8]) -> Result<ManifestSummary, ParseError> {
        let doc: JsonValue = serde_json::from_slice(content)?;
        let obj = doc
            .as_object()
            .ok_or_else(|| ParseError::InvalidContent("package.json is not an object".into()))?;

        let mut summary = ManifestSummary {
            name: json_str(obj.get("name")),
            version: json_str(obj.get("version")),
            description: json_str(obj.get("description")),
            license: json_license(obj.get("license")),
            author: json_person(obj.get("author")),
            homepage: json_str(obj.get("homepage")),
            repository: json_repository(obj.get("repository")),
            capability_section: obj.get("mcp").cloned(),
            ..Default::default()
        };

        for (key, kind) in [
            ("dependencies", DependencyKind::Runtime),
            ("devDependencies", DependencyKind::Dev),
            ("peerDependencies", DependencyKind::Peer),
        ] {
            if let Some(JsonValue::Object(deps)) = obj.get(key) {
                for (name, constraint) in deps {
                    summary.dependencies.push(Dependency {
                        library_name: name.clone(),
                        version_constraint: constraint.as_str().map(str::to_string),
                        ecosystem: "npm".to_string(),
                        kind,
                    });
                }
            }
        }

        let scripted_tests = obj
            .get("scripts")
            .and_then(|s| s.get("test"))
            .and_then(JsonValue::as_str)
            .map(|t| !t.contains("no test specified"))
            .unwrap_or(false);
        summary.has_tests = scripted_tests || has_test_runner(&summary.dependencies);

        Ok(summary)
    }
}

fn json_str(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn json_license(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(JsonValue::Object(o)) => json_str(o.get("type")),
        _ => None,
    }
}

fn json_person(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) => {
            // "Name <email> (url)" shorthand
            let name = s.split(['<', '(']).next().unwrap_or("").trim();
            (!name.is_empty()).then(|| name.to_string())
        }
        Some(JsonValue::Object(o)) => json_str(o.get("name")),
        _ => None,
    }
}

fn json_repository(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) => normalize_repository_url(s),
        Some(JsonValue::Object(o)) => o
            .get("url")
            .and_then(JsonValue::as_str)
            .and_then(normalize_repository_url),
        _ => None,
    }
}

// ============================================================================
// pyproject.toml
// ============================================================================

pub struct PyprojectParser;

impl EcosystemParser for PyprojectParser {
    fn ecosystem_id(&self) -> &str {
        "pypi"
    }

    fn descriptor_name(&self) -> &str {
        "pyproject.toml"
    }

    fn parse(&self, content: &[u8]) -> Result<ManifestSummary, ParseError> {
        let text = std::str::from_utf8(content).map_err(|_| ParseError::NotUtf8)?;
        let doc: TomlValue = toml::from_str(text)?;

        let mut summary = ManifestSummary::default();

        if let Some(project) = doc.get("project") {
            summary.name = toml_str(project.get("name"));
            summary.version = toml_str(project.get("version"));
            summary.description = toml_str(project.get("description"));
            summary.license = match project.get("license") {
                Some(TomlValue::String(s)) => Some(s.clone()),
                Some(TomlValue::Table(t)) => toml_str(t.get("text")),
                _ => None,
            };
            summary.author = project
                .get("authors")
                .and_then(TomlValue::as_array)
                .and_then(|a| a.first())
                .and_then(|p| toml_str(p.get("name")));
            if let Some(TomlValue::Table(urls)) = project.get("urls") {
                summary.homepage = urls
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("homepage"))
                    .and_then(|(_, v)| v.as_str().map(str::to_string));
                summary.repository = urls
                    .iter()
                    .filter_map(|(_, v)| v.as_str())
                    .find_map(|u| normalize_repository_url(u).filter(|n| is_linkable_repository(n)));
            }
            if let Some(TomlValue::Array(deps)) = project.get("dependencies") {
                for raw in deps.iter().filter_map(TomlValue::as_str) {
                    if let Some(dep) = requirement_dependency(raw, DependencyKind::Runtime) {
                        summary.dependencies.push(dep);
                    }
                }
            }
            if let Some(TomlValue::Table(groups)) = project.get("optional-dependencies") {
                for deps in groups.values().filter_map(TomlValue::as_array) {
                    for raw in deps.iter().filter_map(TomlValue::as_str) {
                        if let Some(dep) = requirement_dependency(raw, DependencyKind::Dev) {
                            summary.dependencies.push(dep);
                        }
                    }
                }
            }
        }

        if let Some(poetry) = doc.get("tool").and_then(|t| t.get("poetry")) {
            summary.name = summary.name.or_else(|| toml_str(poetry.get("name")));
            summary.version = summary.version.or_else(|| toml_str(poetry.get("version")));
            summary.description = summary
                .description
                .or_else(|| toml_str(poetry.get("description")));
            summary.license = summary.license.or_else(|| toml_str(poetry.get("license")));
            summary.homepage = summary.homepage.or_else(|| toml_str(poetry.get("homepage")));
            summary.repository = summary.repository.or_else(|| {
                toml_str(poetry.get("repository")).and_then(|u| normalize_repository_url(&u))
            });
            summary.author = summary.author.or_else(|| {
                poetry
                    .get("authors")
                    .and_then(TomlValue::as_array)
                    .and_then(|a| a.first())
                    .and_then(TomlValue::as_str)
                    .map(|s| s.split('<').next().unwrap_or("").trim().to_string())
                    .filter(|s| !s.is_empty())
            });

            push_poetry_table(
                &mut summary.dependencies,
                poetry.get("dependencies"),
                DependencyKind::Runtime,
            );
            push_poetry_table(
                &mut summary.dependencies,
                poetry.get("dev-dependencies"),
                DependencyKind::Dev,
            );
            if let Some(TomlValue::Table(groups)) = poetry.get("group") {
                for group in groups.values() {
                    push_poetry_table(
                        &mut summary.dependencies,
                        group.get("dependencies"),
                        DependencyKind::Dev,
                    );
                }
            }
        }

        let pytest_configured = doc
            .get("tool")
            .and_then(TomlValue::as_table)
            .map(|tools| tools.keys().any(|k| k.starts_with("pytest")))
            .unwrap_or(false);
        summary.has_tests = pytest_configured || has_test_runner(&summary.dependencies);

        Ok(summary)
    }
}

fn toml_str(value: Option<&TomlValue>) -> Option<String> {
    value
        .and_then(TomlValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn push_poetry_table(out: &mut Vec<Dependency>, table: Option<&TomlValue>, kind: DependencyKind) {
    let Some(TomlValue::Table(table)) = table else {
        return;
    };
    for (name, spec) in table {
        if name.eq_ignore_ascii_case("python") {
            continue;
        }
        let constraint = match spec {
            TomlValue::String(s) => Some(s.clone()),
            TomlValue::Table(t) => toml_str(t.get("version")),
            _ => None,
        };
        out.push(Dependency {
            library_name: name.clone(),
            version_constraint: constraint,
            ecosystem: "pypi".to_string(),
            kind,
        });
    }
}

// ============================================================================
// METADATA / PKG-INFO
// ============================================================================

/// Reads Python core metadata (wheel `*.dist-info/METADATA`, sdist `PKG-INFO`).
///
/// The format is RFC 822 style headers followed by an optional body that
/// holds the long description. Continuation lines start with whitespace.
pub struct CoreMetadataParser;

impl EcosystemParser for CoreMetadataParser {
    fn ecosystem_id(&self) -> &str {
        "pypi"
    }

    fn descriptor_name(&self) -> &str {
        "METADATA"
    }

    fn parse(&self, content: &[u8]) -> Result<ManifestSummary, ParseError> {
        let text = std::str::from_utf8(content).map_err(|_| ParseError::NotUtf8)?;
        let mut headers: Vec<(String, String)> = Vec::new();

        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }
        if !headers.iter().any(|(k, _)| k == "metadata-version" || k == "name") {
            return Err(ParseError::InvalidContent(
                "core metadata has no Name header".into(),
            ));
        }

        let first = |key: &str| {
            headers
                .iter()
                .find(|(k, v)| k == key && !v.is_empty() && v != "UNKNOWN")
                .map(|(_, v)| v.clone())
        };

        let mut summary = ManifestSummary {
            name: first("name"),
            version: first("version"),
            description: first("summary"),
            license: first("license-expression").or_else(|| first("license")),
            author: first("author").or_else(|| {
                first("author-email").map(|a| a.split('<').next().unwrap_or("").trim().to_string())
            }),
            homepage: first("home-page"),
            ..Default::default()
        };

        summary.repository = headers
            .iter()
            .filter(|(k, _)| k == "project-url")
            .filter_map(|(_, v)| v.split_once(',').map(|(_, url)| url.trim()))
            .chain(summary.homepage.as_deref())
            .find_map(|u| normalize_repository_url(u).filter(|n| is_linkable_repository(n)));

        summary.dependencies = headers
            .iter()
            .filter(|(k, _)| k == "requires-dist")
            .filter_map(|(_, v)| requirement_dependency(v, DependencyKind::Runtime))
            .collect();
        summary.has_tests = has_test_runner(&summary.dependencies);

        Ok(summary)
    }
}

fn has_test_runner(deps: &[Dependency]) -> bool {
    deps.iter().any(|d| {
        let name = d.library_name.to_ascii_lowercase();
        TEST_RUNNERS.contains(&name.as_str()) || name.starts_with("@jest/")
    })
}

// ============================================================================
// PEP 508 requirements
// ============================================================================

/// A parsed PEP 508 requirement string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: Option<String>,
    pub marker: Option<String>,
}

/// Parses `name[extras] (spec) ; marker` into its parts.
///
/// Returns `None` when no package name can be found.
pub fn parse_requirement(raw: &str) -> Option<Requirement> {
    let (req, marker) = match raw.split_once(';') {
        Some((req, marker)) => (req.trim(), Some(marker.trim().to_string())),
        None => (raw.trim(), None),
    };

    let name_end = req
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(req.len());
    let name = &req[..name_end];
    if name.is_empty() {
        return None;
    }

    let mut rest = req[name_end..].trim();
    if rest.starts_with('[') {
        rest = rest.find(']').map(|i| rest[i + 1..].trim()).unwrap_or("");
    }
    let rest = rest.trim_start_matches('(').trim_end_matches(')').trim();

    Some(Requirement {
        name: name.to_string(),
        constraint: (!rest.is_empty()).then(|| rest.to_string()),
        marker: marker.filter(|m| !m.is_empty()),
    })
}

/// Converts a requirement string into a PyPI [`Dependency`].
///
/// Requirements guarded by an `extra == ...` marker are classified as dev
/// dependencies, whatever kind the caller suggests.
pub fn requirement_dependency(raw: &str, kind: DependencyKind) -> Option<Dependency> {
    let req = parse_requirement(raw)?;
    let kind = if req.marker.as_deref().is_some_and(|m| m.contains("extra")) {
        DependencyKind::Dev
    } else {
        kind
    };
    Some(Dependency {
        library_name: req.name,
        version_constraint: req.constraint,
        ecosystem: "pypi".to_string(),
        kind,
    })
}

/// PEP 503 normalized project name.
pub fn normalize_pypi_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.trim().chars() {
        if c == '-' || c == '_' || c == '.' {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

// ============================================================================
// Repository links
// ============================================================================

/// Normalizes the many spellings of a repository link to `https://host/owner/repo`.
///
/// Handles `git+https://`, `git://`, `git@host:owner/repo.git`, the npm
/// `github:owner/repo` / `owner/repo` shorthands and trailing `.git`.
pub fn normalize_repository_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut url = raw.to_string();
    for (prefix, host) in [
        ("github:", "github.com"),
        ("gitlab:", "gitlab.com"),
        ("bitbucket:", "bitbucket.org"),
    ] {
        if let Some(path) = url.strip_prefix(prefix) {
            url = format!("https://{}/{}", host, path);
        }
    }
    if let Some(path) = url.strip_prefix("git@") {
        url = format!("https://{}", path.replacen(':', "/", 1));
    }
    for prefix in ["git+ssh://git@", "git+https://", "git+http://", "git://", "ssh://git@"] {
        if let Some(path) = url.strip_prefix(prefix) {
            url = format!("https://{}", path);
        }
    }
    let is_shorthand = !url.contains("://")
        && url.split('/').count() == 2
        && !url.starts_with('.')
        && !url.contains(' ');
    if is_shorthand {
        url = format!("https://github.com/{}", url);
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }

    let url = url
        .split('#')
        .next()
        .unwrap_or("")
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_string();
    Some(url)
}

/// Whether `url` points at `owner/repo` on a known source-control host.
pub fn is_linkable_repository(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let host = parsed.host_str().unwrap_or("").trim_start_matches("www.");
    if !SOURCE_CONTROL_HOSTS.contains(&host) {
        return false;
    }
    parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).count() >= 2)
        .unwrap_or(false)
}
