//! Canonical catalog records.
//!
//! Every source adapter normalizes what it finds into a [`CatalogEntry`], and
//! the [`CheckpointStore`](crate::harvest::CheckpointStore) tracks progress
//! per identifier with a [`CheckpointRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Source and Risk Tags
// ============================================================================

/// Which strategy produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    SourceControl,
    Npm,
    Pypi,
    Container,
    Endpoint,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::SourceControl => "source_control",
            SourceType::Npm => "npm",
            SourceType::Pypi => "pypi",
            SourceType::Container => "container",
            SourceType::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_control" => Ok(SourceType::SourceControl),
            "npm" => Ok(SourceType::Npm),
            "pypi" => Ok(SourceType::Pypi),
            "container" => Ok(SourceType::Container),
            "endpoint" => Ok(SourceType::Endpoint),
            other => Err(format!("unknown source type '{}'", other)),
        }
    }
}

/// Trust classification.
///
/// `Safe < Moderate < High < Critical` form a total order used for floors.
/// `Unknown` sits outside that order: it means the input could not be
/// analyzed, and no floor or overlay ever raises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Moderate,
    High,
    Critical,
    Unknown,
}

impl RiskLevel {
    /// Position in the escalation order, `None` for [`RiskLevel::Unknown`].
    pub fn rank(&self) -> Option<u8> {
        match self {
            RiskLevel::Safe => Some(0),
            RiskLevel::Moderate => Some(1),
            RiskLevel::High => Some(2),
            RiskLevel::Critical => Some(3),
            RiskLevel::Unknown => None,
        }
    }

    /// Raises `self` to at least `floor`. Escalation is monotonic: a level
    /// already above the floor is kept, and `Unknown` is returned unchanged.
    pub fn at_least(self, floor: RiskLevel) -> RiskLevel {
        match (self.rank(), floor.rank()) {
            (Some(current), Some(minimum)) if minimum > current => floor,
            _ => self,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
            RiskLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(RiskLevel::Safe),
            "moderate" => Ok(RiskLevel::Moderate),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            "unknown" => Ok(RiskLevel::Unknown),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

// ============================================================================
// Catalog Entry
// ============================================================================

/// Normalized record for one discovered package or server.
///
/// The shape is identical regardless of the source that produced it. The
/// `locator` is the unique key: harvesting the same locator again replaces
/// the scalar fields and every child collection in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Canonical locator (e.g. `https://github.com/owner/repo`, `npm:name`)
    pub locator: String,

    /// Strategy that produced this entry
    pub source_type: SourceType,

    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,

    /// Linked source-control repository, if one could be verified
    pub repository_url: Option<String>,

    pub stars: i64,
    pub forks: i64,
    pub downloads: i64,
    pub open_issues: i64,

    pub risk_level: RiskLevel,
    pub verified: bool,

    /// Composite maintenance signal in `0..=100`
    pub health_score: u8,

    /// Most recent upstream activity (push, release, image update)
    pub last_activity_at: Option<DateTime<Utc>>,

    /// When this entry was produced by a harvest
    pub harvested_at: DateTime<Utc>,

    /// Source-specific extras (code risk, container signals, transport, ...)
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub capabilities: Vec<Capability>,
    pub dependencies: Vec<Dependency>,
    pub releases: Vec<Release>,
    pub contributors: Vec<Contributor>,
}

impl CatalogEntry {
    /// Creates an entry with empty metrics and collections.
    ///
    /// Adapters start from this and fill in what their source exposes.
    pub fn new(locator: impl Into<String>, source_type: SourceType, name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            source_type,
            name: name.into(),
            description: None,
            version: None,
            author: None,
            license: None,
            homepage: None,
            repository_url: None,
            stars: 0,
            forks: 0,
            downloads: 0,
            open_issues: 0,
            risk_level: RiskLevel::Safe,
            verified: false,
            health_score: 0,
            last_activity_at: None,
            harvested_at: Utc::now(),
            metadata: serde_json::Map::new(),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            releases: Vec::new(),
            contributors: Vec::new(),
        }
    }

    /// Number of declared capabilities of the given kind.
    pub fn capability_count(&self, kind: CapabilityKind) -> usize {
        self.capabilities.iter().filter(|c| c.kind == kind).count()
    }
}

/// A tool, resource or prompt declared by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub kind: CapabilityKind,
    pub name: String,
    pub description: Option<String>,

    /// JSON schema of the tool input, kept as raw JSON text
    pub input_schema: Option<String>,
}

impl Capability {
    pub fn new(kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        }
    }
}

impl FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(CapabilityKind::Tool),
            "resource" => Ok(CapabilityKind::Resource),
            "prompt" => Ok(CapabilityKind::Prompt),
            other => Err(format!("unknown capability kind '{}'", other)),
        }
    }
}

/// Package dependency descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Dependency name as declared
    pub library_name: String,

    /// Optional version constraint
    ///
    /// Examples: `"^2.31"`, `">=3.24"`, `"~1.0.0"`
    pub version_constraint: Option<String>,

    /// Ecosystem the name belongs to (`"npm"`, `"pypi"`)
    pub ecosystem: String,

    pub kind: DependencyKind,
}

/// Classification of dependency types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Required for package execution
    Runtime,

    /// Required only for development or testing
    Dev,

    /// Expected to be provided by the host project
    Peer,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Runtime => "runtime",
            DependencyKind::Dev => "dev",
            DependencyKind::Peer => "peer",
        }
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runtime" => Ok(DependencyKind::Runtime),
            "dev" => Ok(DependencyKind::Dev),
            "peer" => Ok(DependencyKind::Peer),
            other => Err(format!("unknown dependency kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    pub name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub prerelease: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub login: String,
    pub contributions: i64,
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Processing state of one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl HarvestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestStatus::Pending => "pending",
            HarvestStatus::Processing => "processing",
            HarvestStatus::Completed => "completed",
            HarvestStatus::Failed => "failed",
            HarvestStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for HarvestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HarvestStatus::Pending),
            "processing" => Ok(HarvestStatus::Processing),
            "completed" => Ok(HarvestStatus::Completed),
            "failed" => Ok(HarvestStatus::Failed),
            "skipped" => Ok(HarvestStatus::Skipped),
            other => Err(format!("unknown harvest status '{}'", other)),
        }
    }
}

/// Durable per-identifier processing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub source_type: SourceType,
    pub identifier: String,
    pub status: HarvestStatus,
    pub attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Last failure, truncated to [`MAX_ERROR_LEN`] characters
    pub error_message: Option<String>,

    /// Canonical locator of the stored entry, set on completion
    pub locator: Option<String>,

    pub updated_at: DateTime<Utc>,
}

/// Upper bound on stored checkpoint error text, in characters.
pub const MAX_ERROR_LEN: usize = 1000;

/// Truncates `message` to [`MAX_ERROR_LEN`] characters on a char boundary.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}
