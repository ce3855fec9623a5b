//! Language-aware risk scanner.
//!
//! Python and JavaScript are parsed with tree-sitter and walked in document
//! order ("structured mode"). Every other language goes through the regex
//! rules in [`lexical`](super::lexical). Both modes emit the same pattern
//! names, and the output of [`RiskScanner::scan`] is deterministic: the same
//! text always yields the same, identically ordered list.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;
use tree_sitter::{Node, Parser, Tree};

use super::findings::{normalize, patterns, Finding};
use super::lexical;

// ============================================================================
// Denylists
// ============================================================================

pub const PYTHON_NETWORK_MODULES: &[&str] = &[
    "socket",
    "requests",
    "urllib",
    "urllib3",
    "http",
    "httpx",
    "aiohttp",
    "ftplib",
    "smtplib",
    "telnetlib",
    "paramiko",
    "websocket",
    "websockets",
];

pub const PYTHON_FILESYSTEM_MODULES: &[&str] = &["shutil", "tempfile", "glob", "pathlib"];

const PYTHON_EVAL_BUILTINS: &[&str] = &["eval", "exec", "compile"];

const PYTHON_SUBPROCESS_FUNCS: &[&str] = &[
    "run",
    "call",
    "Popen",
    "check_call",
    "check_output",
    "getoutput",
    "getstatusoutput",
];

const PYTHON_OS_FS_MUTATORS: &[&str] = &[
    "remove", "unlink", "rmdir", "removedirs", "makedirs", "mkdir", "rename", "replace", "chmod",
];

pub const JS_NETWORK_MODULES: &[&str] = &[
    "http",
    "https",
    "http2",
    "net",
    "dgram",
    "tls",
    "axios",
    "node-fetch",
    "undici",
    "ws",
    "got",
];

pub const JS_FILESYSTEM_MODULES: &[&str] = &["fs", "fs/promises", "fs-extra"];

const JS_CHILD_PROCESS_FUNCS: &[&str] = &[
    "exec",
    "execSync",
    "spawn",
    "spawnSync",
    "execFile",
    "execFileSync",
    "fork",
];

const JS_FS_WRITE_FUNCS: &[&str] = &[
    "writeFile",
    "writeFileSync",
    "appendFile",
    "appendFileSync",
    "createWriteStream",
    "unlink",
    "unlinkSync",
    "rm",
    "rmSync",
    "rmdir",
    "rmdirSync",
];

// ============================================================================
// Language
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Go,
    Rust,
    Shell,
    Other,
}

impl Language {
    /// Guesses the language from a file extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "py" | "pyw" => Language::Python,
            "js" | "mjs" | "cjs" | "jsx" => Language::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "go" => Language::Go,
            "rs" => Language::Rust,
            "sh" | "bash" | "zsh" => Language::Shell,
            _ => Language::Other,
        }
    }

    /// Whether a syntax-tree parser is available for this language.
    pub fn has_structured_parser(&self) -> bool {
        matches!(self, Language::Python | Language::JavaScript)
    }

    fn grammar(&self) -> Option<tree_sitter::Language> {
        match self {
            Language::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Language::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            _ => None,
        }
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// Stateless static analyzer.
///
/// A fresh tree-sitter parser is built per call, so one scanner can be shared
/// freely between threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RiskScanner;

impl RiskScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scans source text and returns findings in canonical order.
    pub fn scan(&self, source: &str, language: Language) -> Vec<Finding> {
        let mut findings = match self.parse(source, language) {
            Some(tree) => match language {
                Language::Python => PythonVisitor::default().run(&tree, source),
                _ => JsVisitor::default().run(&tree, source),
            },
            None => lexical::scan(source, language),
        };
        normalize(&mut findings);
        findings
    }

    /// Scans raw bytes. Invalid UTF-8 is decoded lossily and reported as a
    /// `syntax-error`; NUL bytes mark the input as binary and unsupported.
    pub fn scan_bytes(&self, bytes: &[u8], language: Language) -> Vec<Finding> {
        if bytes.contains(&0) {
            return vec![Finding::named(patterns::UNSUPPORTED_LANGUAGE)];
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => self.scan(text, language),
            Err(_) => {
                let text = String::from_utf8_lossy(bytes);
                let mut findings = self.scan(&text, language);
                findings.push(Finding::named(patterns::SYNTAX_ERROR));
                normalize(&mut findings);
                findings
            }
        }
    }

    /// Scans a file's contents, picking the language from its path.
    pub fn scan_file(&self, path: &Path, bytes: &[u8]) -> Vec<Finding> {
        self.scan_bytes(bytes, Language::from_path(path))
    }

    fn parse(&self, source: &str, language: Language) -> Option<Tree> {
        let grammar = language.grammar()?;
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&grammar) {
            debug!(error = %e, ?language, "grammar rejected, using lexical scan");
            return None;
        }
        parser.parse(source, None)
    }
}

/// Visits every node of `tree` in pre-order.
fn preorder<'t>(tree: &'t Tree, mut visit: impl FnMut(Node<'t>)) {
    let mut cursor = tree.walk();
    loop {
        visit(cursor.node());
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn finding_at(pattern: &str, node: Node<'_>, detail: &str) -> Finding {
    let point = node.start_position();
    Finding::at(pattern, point.row, point.column, Some(detail))
}

/// Strips string prefixes (`b`, `r`, `f`) and quotes from a literal.
fn unquote(literal: &str) -> &str {
    literal
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
}

fn first_syntax_error(tree: &Tree) -> Option<Finding> {
    if !tree.root_node().has_error() {
        return None;
    }
    let mut first = None;
    preorder(tree, |node| {
        if first.is_none() && (node.is_error() || node.is_missing()) {
            let point = node.start_position();
            first = Some(Finding::at(patterns::SYNTAX_ERROR, point.row, point.column, None));
        }
    });
    first.or_else(|| Some(Finding::named(patterns::SYNTAX_ERROR)))
}

fn top_level_module(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

// ============================================================================
// Python
// ============================================================================

#[derive(Default)]
struct PythonVisitor {
    /// Local name → fully qualified name (`sp` → `subprocess`, `run` → `subprocess.run`)
    aliases: HashMap<String, String>,
    findings: Vec<Finding>,
}

impl PythonVisitor {
    fn run(mut self, tree: &Tree, source: &str) -> Vec<Finding> {
        preorder(tree, |node| self.visit(node, source));
        self.findings.extend(first_syntax_error(tree));
        self.findings
    }

    fn visit(&mut self, node: Node<'_>, source: &str) {
        match node.kind() {
            "import_statement" => self.visit_import(node, source),
            "import_from_statement" => self.visit_import_from(node, source),
            "call" => self.visit_call(node, source),
            _ => {}
        }
    }

    fn check_module(&mut self, module: &str, node: Node<'_>) {
        let top = top_level_module(module);
        if PYTHON_NETWORK_MODULES.contains(&top) {
            self.findings
                .push(finding_at(patterns::NETWORK_IMPORT, node, module));
        } else if PYTHON_FILESYSTEM_MODULES.contains(&top) {
            self.findings
                .push(finding_at(patterns::FILESYSTEM_IMPORT, node, module));
        }
    }

    fn visit_import(&mut self, node: Node<'_>, source: &str) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            let (module, alias) = match child.kind() {
                "dotted_name" => (text(child, source), None),
                "aliased_import" => (
                    child
                        .child_by_field_name("name")
                        .map(|n| text(n, source))
                        .unwrap_or(""),
                    child.child_by_field_name("alias").map(|n| text(n, source)),
                ),
                _ => continue,
            };
            if module.is_empty() {
                continue;
            }
            if let Some(alias) = alias {
                self.aliases.insert(alias.to_string(), module.to_string());
            }
            self.check_module(module, child);
        }
    }

    fn visit_import_from(&mut self, node: Node<'_>, source: &str) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let module = text(module_node, source);
        if module.starts_with('.') {
            return;
        }
        self.check_module(module, module_node);

        let mut cursor = node.walk();
        for child in node.children_by_field_name("name", &mut cursor) {
            let (name, local) = match child.kind() {
                "dotted_name" => (text(child, source), text(child, source)),
                "aliased_import" => {
                    let name = child
                        .child_by_field_name("name")
                        .map(|n| text(n, source))
                        .unwrap_or("");
                    let local = child
                        .child_by_field_name("alias")
                        .map(|n| text(n, source))
                        .unwrap_or(name);
                    (name, local)
                }
                _ => continue,
            };
            if !name.is_empty() {
                self.aliases
                    .insert(local.to_string(), format!("{}.{}", module, name));
            }
        }
    }

    fn resolve(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn visit_call(&mut self, node: Node<'_>, source: &str) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let qualified = match function.kind() {
            "identifier" => self.resolve(text(function, source)),
            "attribute" => {
                let object = function
                    .child_by_field_name("object")
                    .map(|n| text(n, source))
                    .unwrap_or("");
                let attribute = function
                    .child_by_field_name("attribute")
                    .map(|n| text(n, source))
                    .unwrap_or("");
                format!("{}.{}", self.resolve(object), attribute)
            }
            _ => return,
        };

        let (object, callee) = match qualified.rsplit_once('.') {
            Some((object, callee)) => (object, callee),
            None => ("", qualified.as_str()),
        };

        let pattern = match (object, callee) {
            ("" | "builtins", name) if PYTHON_EVAL_BUILTINS.contains(&name) => {
                Some(patterns::EVAL_CALL)
            }
            ("" | "builtins", "__import__") | ("importlib", "import_module") => {
                Some(patterns::DYNAMIC_IMPORT)
            }
            ("" | "builtins", "open") if opens_for_write(node, source) => {
                Some(patterns::FILESYSTEM_WRITE)
            }
            ("subprocess", name) if PYTHON_SUBPROCESS_FUNCS.contains(&name) => {
                Some(patterns::SUBPROCESS_CALL)
            }
            ("asyncio", "create_subprocess_exec" | "create_subprocess_shell") => {
                Some(patterns::SUBPROCESS_CALL)
            }
            ("os", "system" | "popen") => Some(patterns::OS_COMMAND),
            ("os", name) if name.starts_with("spawn") || name.starts_with("exec") => {
                Some(patterns::OS_COMMAND)
            }
            ("os", name) if PYTHON_OS_FS_MUTATORS.contains(&name) => {
                Some(patterns::FILESYSTEM_WRITE)
            }
            (_, "write_text" | "write_bytes") => Some(patterns::FILESYSTEM_WRITE),
            _ => None,
        };

        if let Some(pattern) = pattern {
            self.findings.push(finding_at(pattern, node, &qualified));
        }
    }
}

/// Whether an `open(...)` call passes a mode that writes.
fn opens_for_write(call: Node<'_>, source: &str) -> bool {
    let Some(arguments) = call.child_by_field_name("arguments") else {
        return false;
    };
    let mut cursor = arguments.walk();
    let mut positional = 0;
    let mut mode = None;
    for argument in arguments.named_children(&mut cursor) {
        match argument.kind() {
            "keyword_argument" => {
                let is_mode = argument
                    .child_by_field_name("name")
                    .map(|n| text(n, source) == "mode")
                    .unwrap_or(false);
                if is_mode {
                    mode = argument
                        .child_by_field_name("value")
                        .filter(|v| v.kind() == "string")
                        .map(|v| unquote(text(v, source)));
                }
            }
            "comment" => {}
            kind => {
                if positional == 1 && kind == "string" {
                    mode = Some(unquote(text(argument, source)));
                }
                positional += 1;
            }
        }
    }
    mode.map(|m| m.contains(['w', 'a', 'x', '+']))
        .unwrap_or(false)
}

// ============================================================================
// JavaScript
// ============================================================================

#[derive(Default)]
struct JsVisitor {
    imports_child_process: bool,
    imports_fs: bool,
    findings: Vec<Finding>,
}

fn js_module_name(raw: &str) -> &str {
    raw.strip_prefix("node:").unwrap_or(raw)
}

impl JsVisitor {
    fn run(mut self, tree: &Tree, source: &str) -> Vec<Finding> {
        preorder(tree, |node| self.visit(node, source));
        self.findings.extend(first_syntax_error(tree));
        self.findings
    }

    fn visit(&mut self, node: Node<'_>, source: &str) {
        match node.kind() {
            "import_statement" => {
                if let Some(src) = node.child_by_field_name("source") {
                    let module = unquote(text(src, source)).to_string();
                    self.check_module(&module, node);
                }
            }
            "call_expression" => self.visit_call(node, source),
            "new_expression" => {
                let is_function_ctor = node
                    .child_by_field_name("constructor")
                    .map(|c| text(c, source) == "Function")
                    .unwrap_or(false);
                if is_function_ctor {
                    self.findings
                        .push(finding_at(patterns::EVAL_CALL, node, "Function"));
                }
            }
            _ => {}
        }
    }

    fn check_module(&mut self, raw: &str, node: Node<'_>) {
        let module = js_module_name(raw);
        let root = module.split('/').next().unwrap_or(module);
        if module == "child_process" {
            self.imports_child_process = true;
        } else if JS_NETWORK_MODULES.contains(&module) || JS_NETWORK_MODULES.contains(&root) {
            self.findings
                .push(finding_at(patterns::NETWORK_IMPORT, node, module));
        } else if JS_FILESYSTEM_MODULES.contains(&module) || JS_FILESYSTEM_MODULES.contains(&root) {
            self.imports_fs = true;
            self.findings
                .push(finding_at(patterns::FILESYSTEM_IMPORT, node, module));
        }
    }

    /// First argument of a call when it is a plain string literal.
    fn literal_argument<'s>(node: Node<'_>, source: &'s str) -> Option<Result<&'s str, ()>> {
        let arguments = node.child_by_field_name("arguments")?;
        let mut cursor = arguments.walk();
        let first = arguments.named_children(&mut cursor).next()?;
        Some(if first.kind() == "string" {
            Ok(unquote(text(first, source)))
        } else {
            Err(())
        })
    }

    fn visit_call(&mut self, node: Node<'_>, source: &str) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        match function.kind() {
            "identifier" => {
                let name = text(function, source);
                match name {
                    "eval" => self
                        .findings
                        .push(finding_at(patterns::EVAL_CALL, node, name)),
                    "require" => match Self::literal_argument(node, source) {
                        Some(Ok(module)) => self.check_module(module, node),
                        Some(Err(())) => self
                            .findings
                            .push(finding_at(patterns::DYNAMIC_IMPORT, node, name)),
                        None => {}
                    },
                    _ if self.imports_child_process && JS_CHILD_PROCESS_FUNCS.contains(&name) => {
                        self.findings
                            .push(finding_at(patterns::SUBPROCESS_CALL, node, name))
                    }
                    _ if self.imports_fs && JS_FS_WRITE_FUNCS.contains(&name) => self
                        .findings
                        .push(finding_at(patterns::FILESYSTEM_WRITE, node, name)),
                    _ => {}
                }
            }
            "import" => match Self::literal_argument(node, source) {
                Some(Ok(module)) => self.check_module(module, node),
                Some(Err(())) => self
                    .findings
                    .push(finding_at(patterns::DYNAMIC_IMPORT, node, "import")),
                None => {}
            },
            "member_expression" => {
                let object = function
                    .child_by_field_name("object")
                    .map(|n| text(n, source))
                    .unwrap_or("");
                let property = function
                    .child_by_field_name("property")
                    .map(|n| text(n, source))
                    .unwrap_or("");
                let via_child_process =
                    self.imports_child_process || object.contains("child_process");
                if via_child_process && JS_CHILD_PROCESS_FUNCS.contains(&property) {
                    self.findings.push(finding_at(
                        patterns::SUBPROCESS_CALL,
                        node,
                        text(function, source),
                    ));
                } else if self.imports_fs && JS_FS_WRITE_FUNCS.contains(&property) {
                    self.findings.push(finding_at(
                        patterns::FILESYSTEM_WRITE,
                        node,
                        text(function, source),
                    ));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::findings::patterns::*;

    fn names(findings: &[Finding]) -> Vec<&str> {
        findings.iter().map(|f| f.pattern.as_str()).collect()
    }

    #[test]
    fn test_python_eval_and_network_import() {
        let source = "import requests\n\nresult = eval(user_input)\n";
        let findings = RiskScanner::new().scan(source, Language::Python);
        assert_eq!(names(&findings), vec![NETWORK_IMPORT, EVAL_CALL]);
        assert_eq!(findings[1].location.unwrap().line, 2);
    }

    #[test]
    fn test_python_subprocess_through_aliases() {
        let source = "\
import subprocess as sp
from subprocess import check_output
import os

sp.run(['ls'])
check_output('whoami', shell=True)
os.system('rm -rf /tmp/x')
";
        let findings = RiskScanner::new().scan(source, Language::Python);
        assert_eq!(
            names(&findings),
            vec![SUBPROCESS_CALL, SUBPROCESS_CALL, OS_COMMAND]
        );
        assert_eq!(findings[0].detail.as_deref(), Some("subprocess.run"));
    }

    #[test]
    fn test_python_open_modes() {
        let source = "\
open('notes.txt')
open('out.txt', 'w')
open('log.txt', mode='a')
";
        let findings = RiskScanner::new().scan(source, Language::Python);
        assert_eq!(names(&findings), vec![FILESYSTEM_WRITE, FILESYSTEM_WRITE]);
        assert_eq!(findings[0].location.unwrap().line, 1);
    }

    #[test]
    fn test_python_clean_module_has_no_findings() {
        let source = "def add(a, b):\n    return a + b\n";
        assert!(RiskScanner::new().scan(source, Language::Python).is_empty());
    }

    #[test]
    fn test_python_syntax_error_does_not_abort() {
        let source = "import socket\ndef broken(:\n    pass\n";
        let findings = RiskScanner::new().scan(source, Language::Python);
        assert!(findings.iter().any(|f| f.pattern == SYNTAX_ERROR));
        assert!(findings.iter().any(|f| f.pattern == NETWORK_IMPORT));
    }

    #[test]
    fn test_javascript_child_process_and_fs() {
        let source = "\
const { execSync } = require('child_process');
import fs from 'node:fs';
import axios from 'axios';

execSync('ls');
fs.writeFileSync('/tmp/x', 'data');
";
        let findings = RiskScanner::new().scan(source, Language::JavaScript);
        assert_eq!(
            names(&findings),
            vec![FILESYSTEM_IMPORT, NETWORK_IMPORT, SUBPROCESS_CALL, FILESYSTEM_WRITE]
        );
    }

    #[test]
    fn test_javascript_dynamic_code() {
        let source = "const f = new Function('a', 'return a');\neval(code);\nrequire(name);\n";
        let findings = RiskScanner::new().scan(source, Language::JavaScript);
        assert_eq!(names(&findings), vec![EVAL_CALL, EVAL_CALL, DYNAMIC_IMPORT]);
    }

    #[test]
    fn test_inline_child_process_require() {
        let source = "require('child_process').exec('id');\n";
        let findings = RiskScanner::new().scan(source, Language::JavaScript);
        assert_eq!(names(&findings), vec![SUBPROCESS_CALL]);
    }

    #[test]
    fn test_scan_is_deterministic() {
        let source = "import os, socket\nos.system('x')\neval('1')\nimport shutil\n";
        let scanner = RiskScanner::new();
        let first = scanner.scan(source, Language::Python);
        for _ in 0..5 {
            assert_eq!(scanner.scan(source, Language::Python), first);
        }
    }

    #[test]
    fn test_binary_input_is_unsupported() {
        let findings = RiskScanner::new().scan_bytes(b"\x7fELF\0\0\0", Language::Other);
        assert_eq!(names(&findings), vec![UNSUPPORTED_LANGUAGE]);
    }

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path(Path::new("a/b.py")), Language::Python);
        assert_eq!(Language::from_path(Path::new("x.mjs")), Language::JavaScript);
        assert_eq!(Language::from_path(Path::new("x.tsx")), Language::TypeScript);
        assert_eq!(Language::from_path(Path::new("README")), Language::Other);
        assert!(!Language::TypeScript.has_structured_parser());
    }
}
