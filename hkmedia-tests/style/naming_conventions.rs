//! Naming conventions
//!
//! Flags the names that say nothing about what a thing is: accessor
//! prefixes, role suffixes, catch-all module names. Also checks that
//! `# Errors` sections list each error as `` - `Type` - condition ``.

use std::fs;
use std::path::Path;

use super::source_tree::{Finding, report, workspace_sources};

const BANNED_FN_PREFIXES: &[(&str, &str)] = &[
    ("get_", "Use the noun: segment.size() not segment.get_size()"),
    ("set_", "Name the change: mark_ended() not set_ended()"),
    ("handle_", "Name the work: forward_datagram() not handle_datagram()"),
];

const BANNED_TYPE_SUFFIXES: &[(&str, &str)] = &[
    ("Factory", "Use a builder or a plain new()"),
    ("Service", "Name the thing, not its deployment"),
];

// Traits may keep these; structs and enums name what they are
const ROLE_SUFFIXES: &[(&str, &str)] = &[
    ("Manager", "Name what it is, not its role"),
    ("Handler", "Say what is being handled"),
    ("Processor", "Say what is being processed"),
    ("Controller", "Say what is being controlled"),
];

const BANNED_MODULES: &[&str] = &["utils", "common", "helpers", "misc", "stuff"];

fn is_fn_definition(line: &str) -> bool {
    ["pub fn ", "pub async fn ", "fn ", "async fn "]
        .iter()
        .any(|start| line.starts_with(start))
}

/// Type declared on this line, with its keyword.
fn declared_type(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_prefix("pub ").unwrap_or(line);
    let (keyword, rest) = line.split_once(' ')?;
    if !matches!(keyword, "struct" | "enum" | "trait") {
        return None;
    }
    let name = rest
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()?;
    Some((keyword, name))
}

fn check_fn_prefixes(path: &Path, content: &str, findings: &mut Vec<Finding>) {
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if !is_fn_definition(line) {
            continue;
        }
        for (prefix, advice) in BANNED_FN_PREFIXES {
            if line.contains(&format!("fn {prefix}")) {
                findings.push(Finding::new(
                    path,
                    index + 1,
                    "BANNED_FUNCTION_PREFIX",
                    format!("Function uses banned prefix '{prefix}'. {advice}"),
                ));
            }
        }
    }
}

fn check_type_names(path: &Path, content: &str, findings: &mut Vec<Finding>) {
    for (index, line) in content.lines().enumerate() {
        let Some((keyword, name)) = declared_type(line.trim()) else {
            continue;
        };

        for (suffix, advice) in BANNED_TYPE_SUFFIXES {
            if name.ends_with(suffix) {
                findings.push(Finding::new(
                    path,
                    index + 1,
                    "BANNED_TYPE_SUFFIX",
                    format!("Type '{name}' uses banned '{suffix}' suffix. {advice}"),
                ));
            }
        }

        if keyword == "trait" {
            continue;
        }
        for (suffix, advice) in ROLE_SUFFIXES {
            if name.ends_with(suffix) {
                findings.push(Finding::new(
                    path,
                    index + 1,
                    "VERBOSE_TYPE_SUFFIX",
                    format!("Type '{name}' uses verbose '{suffix}' suffix. {advice}"),
                ));
            }
        }
    }
}

fn check_module_name(path: &Path, findings: &mut Vec<Finding>) {
    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy()) else {
        return;
    };
    if BANNED_MODULES.contains(&stem.as_ref()) {
        findings.push(Finding::new(
            path,
            1,
            "BANNED_MODULE_NAME",
            format!("Module name '{stem}' is too generic. Name what the module does"),
        ));
    }
}

/// Checks every `# Errors` section in doc blocks attached to functions.
fn check_errors_sections(path: &Path, content: &str, findings: &mut Vec<Finding>) {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let mut index = 0;

    while index < lines.len() {
        if !lines[index].starts_with("///") {
            index += 1;
            continue;
        }

        let start = index;
        while index < lines.len() && lines[index].starts_with("///") {
            index += 1;
        }
        let documents_fn = lines[index..]
            .iter()
            .find(|line| !line.is_empty() && !line.starts_with("#["))
            .is_some_and(|line| is_fn_definition(line));

        if documents_fn {
            check_doc_block(path, &lines[start..index], start, findings);
        }
    }
}

fn check_doc_block(path: &Path, block: &[&str], offset: usize, findings: &mut Vec<Finding>) {
    let Some(header) = block.iter().position(|line| *line == "/// # Errors") else {
        return;
    };
    let line_of = |i: usize| offset + i + 1;

    if block.get(header + 1) != Some(&"///") {
        findings.push(Finding::new(
            path,
            line_of(header),
            "INVALID_DOC_FORMAT",
            "# Errors must be followed by a blank `///` line",
        ));
        return;
    }

    let mut bullets = 0;
    for (i, line) in block.iter().enumerate().skip(header + 2) {
        let text = line.trim_start_matches('/').trim();
        if text.starts_with("# ") {
            break;
        }
        if text.is_empty() {
            continue;
        }

        // Continuation lines of a bullet are indented under it
        if line.starts_with("///   ") && bullets > 0 {
            continue;
        }

        bullets += 1;
        let well_formed = text
            .strip_prefix("- `")
            .and_then(|rest| rest.split_once('`'))
            .is_some_and(|(_, condition)| condition.starts_with(" - "));
        if !well_formed {
            findings.push(Finding::new(
                path,
                line_of(i),
                "INVALID_DOC_FORMAT",
                "Use `- `ErrorType` - condition` for each error",
            ));
        }
    }

    if bullets == 0 {
        findings.push(Finding::new(
            path,
            line_of(header),
            "INVALID_DOC_FORMAT",
            "# Errors section cannot be empty",
        ));
    }
}

fn check_source(path: &Path, content: &str, findings: &mut Vec<Finding>) {
    check_fn_prefixes(path, content, findings);
    check_type_names(path, content, findings);
    check_module_name(path, findings);
    check_errors_sections(path, content, findings);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings_for(content: &str) -> Vec<Finding> {
        let mut findings = Vec::new();
        check_source(Path::new("sample.rs"), content, &mut findings);
        findings
    }

    #[test]
    fn test_banned_function_prefixes() {
        let findings = findings_for(
            r#"
impl Demuxer {
    pub fn get_port(&self) -> u16 { 0 }
    pub async fn set_heartbeat(&mut self) { }
    fn handle_datagram(&self) { }
    pub fn forward_datagram(&self) { }
    pub fn getaddr(&self) { }
    fn reset_heartbeat(&self) { }
}
"#,
        );

        let rules: Vec<_> = findings.iter().map(|f| f.rule).collect();
        assert_eq!(rules, vec!["BANNED_FUNCTION_PREFIX"; 3]);
        assert_eq!(findings[0].line, 3);
    }

    #[test]
    fn test_role_suffixes_allowed_on_traits_only() {
        let findings = findings_for(
            r#"
pub struct SegmentManager;
enum PacketHandler { A }
pub trait OutputHandler {}
struct TranscoderFactory<T>(T);
pub trait ClockService {}
pub struct SegmentGenerator;
"#,
        );

        let names: Vec<_> = findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(findings.len(), 4, "{names:?}");
        assert!(!names.iter().any(|m| m.contains("OutputHandler")));
        assert!(names.iter().any(|m| m.contains("TranscoderFactory")));
        assert!(names.iter().any(|m| m.contains("ClockService")));
    }

    #[test]
    fn test_generic_module_names() {
        let mut findings = Vec::new();
        for name in ["utils.rs", "src/common.rs", "helpers.rs", "segments.rs", "mod.rs"] {
            check_module_name(Path::new(name), &mut findings);
        }

        assert_eq!(findings.len(), 3);
    }

    #[test]
    fn test_errors_section_format() {
        let findings = findings_for(
            r#"
/// Binds the input port.
///
/// # Errors
///
/// - `RtpError::Bind` - The port is taken
///   or not permitted
pub async fn bind() {}

/// # Errors
/// - `RtpError::Bind` - missing blank line
fn no_blank() {}

/// # Errors
///
/// Returns RtpError if the port is taken
#[must_use]
fn prose() {}

/// # Errors
///
fn empty() {}
"#,
        );

        let lines: Vec<_> = findings.iter().map(|f| f.line).collect();
        assert_eq!(lines, vec![10, 16, 20]);
    }

    #[test]
    fn naming_convention_enforcement() {
        let mut findings = Vec::new();
        let mut checked = 0;

        for path in workspace_sources().expect("workspace is readable") {
            // This file carries violations as test input
            if path.ends_with("naming_conventions.rs") {
                continue;
            }
            let content = fs::read_to_string(&path).expect("source is readable");
            check_source(&path, &content, &mut findings);
            checked += 1;
        }

        assert!(
            report("Naming conventions", checked, &findings),
            "naming convention violations found, see output above"
        );
    }
}
