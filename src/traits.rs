use crate::model::Dependency;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to parse content: {0}")]
    InvalidContent(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Content is not valid UTF-8")]
    NotUtf8,
}

/// What an ecosystem descriptor (package.json, pyproject.toml) says about a package.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSummary {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub author: Option<String>,
    pub homepage: Option<String>,

    /// Repository link normalized to an `https://` URL when recognizable
    pub repository: Option<String>,

    pub dependencies: Vec<Dependency>,

    /// Whether the descriptor wires up a test runner
    pub has_tests: bool,

    /// Inline capability declaration (the `mcp` key of package.json)
    pub capability_section: Option<serde_json::Value>,
}

pub trait EcosystemParser: Send + Sync {
    /// Returns the ecosystem ID this parser handles (e.g., "npm", "pypi").
    fn ecosystem_id(&self) -> &str;

    /// File name of the descriptor this parser reads (e.g., "package.json").
    fn descriptor_name(&self) -> &str;

    /// Parses raw descriptor content into a [`ManifestSummary`].
    fn parse(&self, content: &[u8]) -> Result<ManifestSummary, ParseError>;
}
