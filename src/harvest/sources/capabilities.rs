//! Capability declarations.
//!
//! Two ways a server tells us what it offers:
//! - a declarative manifest (`mcp.json`, `server.json`, the `mcp` key of
//!   `package.json`, or a `tools/list`-style response) with `tools`,
//!   `resources` and `prompts` arrays
//! - registration calls in its source (`server.tool("x", ...)`,
//!   `registerTool("x", ...)`, `@mcp.tool` above `def x`)

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::model::{Capability, CapabilityKind};
use crate::traits::ParseError;

/// Reads the `tools`, `resources` and `prompts` arrays of a manifest.
///
/// Items may be bare strings or objects with `name`, `description` and
/// `inputSchema`; resources without a name fall back to their `uri`. Items
/// that have neither are dropped.
pub fn from_manifest(manifest: &Value) -> Vec<Capability> {
    let mut capabilities = Vec::new();
    for (key, kind) in [
        ("tools", CapabilityKind::Tool),
        ("resources", CapabilityKind::Resource),
        ("prompts", CapabilityKind::Prompt),
    ] {
        if let Some(items) = manifest.get(key).and_then(Value::as_array) {
            capabilities.extend(from_items(kind, items));
        }
    }
    capabilities
}

/// Parses manifest bytes.
///
/// # Errors
///
/// Returns [`ParseError::Json`] if the bytes are not JSON and
/// [`ParseError::InvalidContent`] if the document is not an object.
pub fn from_manifest_bytes(bytes: &[u8]) -> Result<Vec<Capability>, ParseError> {
    let manifest: Value = serde_json::from_slice(bytes)?;
    if !manifest.is_object() {
        return Err(ParseError::InvalidContent(
            "capability manifest is not an object".to_string(),
        ));
    }
    Ok(from_manifest(&manifest))
}

/// Capabilities of one kind from a JSON array.
pub fn from_items(kind: CapabilityKind, items: &[Value]) -> Vec<Capability> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) if !name.trim().is_empty() => {
                Some(Capability::new(kind, name.trim()))
            }
            Value::Object(obj) => {
                let name = obj
                    .get("name")
                    .or_else(|| obj.get("uri"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|n| !n.is_empty())?;
                let schema = obj.get("inputSchema").or_else(|| obj.get("input_schema"));
                Some(Capability {
                    kind,
                    name: name.to_string(),
                    description: obj
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    input_schema: schema.map(Value::to_string),
                })
            }
            _ => None,
        })
        .collect()
}

static CALL_REGISTRATIONS: Lazy<Vec<(Regex, CapabilityKind)>> = Lazy::new(|| {
    let call = |pattern: &str| Regex::new(pattern).ok();
    [
        (
            r#"\b(?:server|mcp|app)\.(?:tool|addTool)\(\s*["'`]([\w.\-]+)["'`]"#,
            CapabilityKind::Tool,
        ),
        (r#"\bregisterTool\(\s*["'`]([\w.\-]+)["'`]"#, CapabilityKind::Tool),
        (
            r#"\b(?:server|mcp|app)\.resource\(\s*["'`]([\w.\-:/]+)["'`]"#,
            CapabilityKind::Resource,
        ),
        (
            r#"\bregisterResource\(\s*["'`]([\w.\-:/]+)["'`]"#,
            CapabilityKind::Resource,
        ),
        (
            r#"\b(?:server|mcp|app)\.prompt\(\s*["'`]([\w.\-]+)["'`]"#,
            CapabilityKind::Prompt,
        ),
        (r#"\bregisterPrompt\(\s*["'`]([\w.\-]+)["'`]"#, CapabilityKind::Prompt),
    ]
    .into_iter()
    .filter_map(|(pattern, kind)| call(pattern).map(|re| (re, kind)))
    .collect()
});

static DECORATOR_REGISTRATION: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*@(?:mcp|server|app)\.(tool|resource|prompt)\b[^\n]*\n(?:\s*@[^\n]*\n)*\s*(?:async\s+)?def\s+([A-Za-z_]\w*)",
    )
    .ok()
});

/// Finds tool/resource/prompt registrations in source text, in order of
/// appearance, without duplicates.
pub fn scan_registrations(source: &str) -> Vec<Capability> {
    let mut found: Vec<(usize, Capability)> = Vec::new();

    for (re, kind) in CALL_REGISTRATIONS.iter() {
        for caps in re.captures_iter(source) {
            let (Some(call), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            // decorators are handled below
            if source[..call.start()].ends_with('@') {
                continue;
            }
            found.push((name.start(), Capability::new(*kind, name.as_str())));
        }
    }

    if let Some(re) = DECORATOR_REGISTRATION.as_ref() {
        for caps in re.captures_iter(source) {
            let (Some(kind), Some(name)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let kind = match kind.as_str() {
                "resource" => CapabilityKind::Resource,
                "prompt" => CapabilityKind::Prompt,
                _ => CapabilityKind::Tool,
            };
            found.push((name.start(), Capability::new(kind, name.as_str())));
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    let mut capabilities: Vec<Capability> = Vec::new();
    for (_, capability) in found {
        let duplicate = capabilities
            .iter()
            .any(|c| c.kind == capability.kind && c.name == capability.name);
        if !duplicate {
            capabilities.push(capability);
        }
    }
    capabilities
}

/// Appends `more` to `into`, skipping `(kind, name)` pairs already present.
pub fn merge(into: &mut Vec<Capability>, more: Vec<Capability>) {
    for capability in more {
        if !into
            .iter()
            .any(|c| c.kind == capability.kind && c.name == capability.name)
        {
            into.push(capability);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_with_mixed_items() {
        let manifest = json!({
            "tools": [
                {"name": "search", "description": "Search docs", "inputSchema": {"type": "object"}},
                "fetch_page",
                {"description": "nameless"}
            ],
            "resources": [{"uri": "docs://index"}],
            "prompts": ["summarize"]
        });
        let caps = from_manifest(&manifest);
        assert_eq!(caps.len(), 4);
        assert_eq!(caps[0].name, "search");
        assert_eq!(caps[0].input_schema.as_deref(), Some(r#"{"type":"object"}"#));
        assert_eq!(caps[1].kind, CapabilityKind::Tool);
        assert_eq!(caps[2].name, "docs://index");
        assert_eq!(caps[3].kind, CapabilityKind::Prompt);
    }

    #[test]
    fn test_manifest_bytes_rejects_non_objects() {
        assert!(from_manifest_bytes(b"[1,2]").is_err());
        assert!(from_manifest_bytes(b"{not json").is_err());
        assert!(from_manifest_bytes(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_scan_javascript_registrations() {
        let source = r#"
            server.tool("create_issue", schema, handler);
            server.registerTool('list_issues', {});
            server.tool("create_issue", schema, handler);
            server.prompt(`triage`, async () => {});
        "#;
        let caps = scan_registrations(source);
        let names: Vec<&str> = caps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["create_issue", "list_issues", "triage"]);
        assert_eq!(caps[2].kind, CapabilityKind::Prompt);
    }

    #[test]
    fn test_scan_python_decorators() {
        let source = "\
from mcp.server.fastmcp import FastMCP
mcp = FastMCP('weather')

@mcp.tool()
async def get_forecast(city: str) -> str:
    ...

@mcp.resource(\"weather://alerts\")
@cache
def alerts():
    ...
";
        let caps = scan_registrations(source);
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0], Capability::new(CapabilityKind::Tool, "get_forecast"));
        assert_eq!(caps[1].kind, CapabilityKind::Resource);
        assert_eq!(caps[1].name, "alerts");
    }
}
