//! Regex fallback for languages without a structured parser.
//!
//! Rules are matched per line; comment-only lines are skipped. For brace
//! languages (TypeScript, Go, Rust) an unbalanced bracket count is reported
//! as a `syntax-error` so callers can tell a partial scan apart.

use once_cell::sync::Lazy;
use regex::Regex;

use super::findings::{patterns, Finding};
use super::scanner::Language;

struct Rule {
    pattern: &'static str,
    regex: Regex,
}

fn rule(pattern: &'static str, expr: &str) -> Option<Rule> {
    // Rule expressions are fixed at compile time and covered by tests.
    Regex::new(expr).ok().map(|regex| Rule { pattern, regex })
}

fn rules(table: &[(&'static str, &str)]) -> Vec<Rule> {
    table.iter().filter_map(|(p, e)| rule(p, e)).collect()
}

static SCRIPT_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (patterns::EVAL_CALL, r"\beval\s*\(|\bnew\s+Function\s*\("),
        (
            patterns::DYNAMIC_IMPORT,
            r#"\brequire\s*\(\s*[^'"`\s)]|\bimport\s*\(\s*[^'"`\s)]"#,
        ),
        (
            patterns::SUBPROCESS_CALL,
            r#"child_process|\b(?:execSync|spawnSync|execFileSync)\s*\(|\bDeno\.(?:run|Command)\b|\bBun\.spawn"#,
        ),
        (
            patterns::NETWORK_IMPORT,
            r#"from\s+['"](?:node:)?(?:https?|http2|net|dgram|tls|axios|node-fetch|undici|ws|got)['"]|require\s*\(\s*['"](?:node:)?(?:https?|net|dgram|tls|axios|node-fetch|undici|ws|got)['"]"#,
        ),
        (
            patterns::FILESYSTEM_IMPORT,
            r#"from\s+['"](?:node:)?(?:fs|fs/promises|fs-extra)['"]|require\s*\(\s*['"](?:node:)?(?:fs|fs/promises|fs-extra)['"]"#,
        ),
        (
            patterns::FILESYSTEM_WRITE,
            r"\b(?:writeFileSync|writeFile|appendFileSync|createWriteStream|unlinkSync|rmSync)\s*\(",
        ),
    ])
});

static GO_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (patterns::SUBPROCESS_CALL, r"\bexec\.Command(?:Context)?\s*\("),
        (patterns::OS_COMMAND, r"\bsyscall\.(?:Exec|ForkExec)\s*\("),
        (patterns::NETWORK_IMPORT, r#""net(?:/http)?""#),
        (
            patterns::FILESYSTEM_WRITE,
            r"\bos\.(?:WriteFile|Create|Remove|RemoveAll|OpenFile|Mkdir|MkdirAll)\s*\(|\bioutil\.WriteFile\s*\(",
        ),
        (patterns::DYNAMIC_IMPORT, r"\bplugin\.Open\s*\("),
    ])
});

static RUST_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (patterns::SUBPROCESS_CALL, r"\bCommand::new\s*\("),
        (
            patterns::NETWORK_IMPORT,
            r"\b(?:std::net|TcpStream|TcpListener|UdpSocket|reqwest|hyper)\b",
        ),
        (
            patterns::FILESYSTEM_WRITE,
            r"\bfs::(?:write|remove_file|remove_dir_all|create_dir_all|File::create)\b|\bFile::create\s*\(",
        ),
        (patterns::DYNAMIC_IMPORT, r"\bLibrary::new\s*\(|\bdlopen\b"),
    ])
});

static SHELL_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    rules(&[
        (patterns::EVAL_CALL, r"(?:^|[;&|]\s*)eval\s"),
        (patterns::NETWORK_IMPORT, r"\b(?:curl|wget|nc|ncat|ssh|scp)\s"),
        (patterns::OS_COMMAND, r"\b(?:sudo|chmod\s+\+?[0-7]*s|bash\s+-c|sh\s+-c)\b"),
        (patterns::FILESYSTEM_WRITE, r"\brm\s+-[a-zA-Z]*r|\bdd\s+if=|>\s*/"),
    ])
});

fn rules_for(language: Language) -> Option<&'static [Rule]> {
    match language {
        Language::JavaScript | Language::TypeScript => Some(&SCRIPT_RULES),
        Language::Go => Some(&GO_RULES),
        Language::Rust => Some(&RUST_RULES),
        Language::Shell => Some(&SHELL_RULES),
        Language::Python | Language::Other => None,
    }
}

fn comment_prefixes(language: Language) -> &'static [&'static str] {
    match language {
        Language::Shell | Language::Python => &["#"],
        _ => &["//", "/*", "*"],
    }
}

/// Scans `source` line by line. Findings are not normalized.
pub fn scan(source: &str, language: Language) -> Vec<Finding> {
    let Some(rules) = rules_for(language) else {
        return vec![Finding::named(patterns::UNSUPPORTED_LANGUAGE)];
    };
    let prefixes = comment_prefixes(language);

    let mut findings = Vec::new();
    for (line_no, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if prefixes.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }
        for rule in rules {
            if let Some(m) = rule.regex.find(line) {
                findings.push(Finding::at(
                    rule.pattern,
                    line_no,
                    m.start(),
                    Some(m.as_str().trim()),
                ));
            }
        }
    }

    if matches!(
        language,
        Language::TypeScript | Language::Go | Language::Rust
    ) && !brackets_balanced(source, language)
    {
        findings.push(Finding::named(patterns::SYNTAX_ERROR));
    }
    findings
}

/// Checks `()[]{}` nesting outside literals and comments.
///
/// `'` opens a literal in TypeScript and Go. In Rust it is a char literal
/// only when it closes within the next escape or character, so lifetimes
/// and labels (`'a`, `'static`) are left alone.
fn brackets_balanced(source: &str, language: Language) -> bool {
    let chars: Vec<char> = source.chars().collect();
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            match c {
                '\\' => i += 1,
                _ if c == q => quote = None,
                _ => {}
            }
            i += 1;
            continue;
        }
        match c {
            '"' | '`' => quote = Some(c),
            '\'' if language == Language::Rust => {
                if let Some(len) = rust_char_literal_len(&chars[i..]) {
                    i += len;
                    continue;
                }
            }
            '\'' => quote = Some(c),
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                continue;
            }
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return false;
                }
            }
            _ => {}
        }
        i += 1;
    }
    stack.is_empty() && quote.is_none()
}

/// Length of the Rust char literal starting at `chars[0] == '\''`, if any.
fn rust_char_literal_len(chars: &[char]) -> Option<usize> {
    match chars.get(1)? {
        '\\' => chars
            .iter()
            .skip(3)
            .take(10)
            .position(|&c| c == '\'')
            .map(|end| end + 4),
        '\'' => None,
        _ if chars.get(2) == Some(&'\'') => Some(3),
        _ => None,
    }
}
