//! Dead code enforcement
//!
//! Library and binary code may not silence `dead_code`. Unused code is
//! deleted or put to use. Test code is exempt.

use std::fs;
use std::path::Path;

use super::source_tree::{Finding, report, workspace_sources};

/// Test-only locations, matched against the normalized path.
fn is_test_code(path: &Path) -> bool {
    let path = path.to_string_lossy().replace('\\', "/").to_lowercase();

    path.contains("/tests/")
        || path.contains("-tests/")
        || path.contains("/benches/")
        || path.ends_with("_tests.rs")
        || path.ends_with("/tests.rs")
}

fn allows_dead_code(line: &str) -> bool {
    let line = line.trim();
    (line.starts_with("#[allow(") || line.starts_with("#![allow(")) && line.contains("dead_code")
}

fn check_source(path: &Path, content: &str, findings: &mut Vec<Finding>) {
    for (index, line) in content.lines().enumerate() {
        if allows_dead_code(line) {
            findings.push(Finding::new(
                path,
                index + 1,
                "DEAD_CODE_ALLOWED",
                format!("`{}` in production code; remove the code or use it", line.trim()),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_code_paths() {
        assert!(is_test_code(Path::new("../hkmedia-tests/integration.rs")));
        assert!(is_test_code(Path::new("../hkmedia-core/tests/config.rs")));
        assert!(is_test_code(Path::new("../hkmedia-core/benches/box_parser.rs")));
        assert!(is_test_code(Path::new("src\\fmp4\\segment_tests.rs")));

        assert!(!is_test_code(Path::new("../hkmedia-core/src/lib.rs")));
        assert!(!is_test_code(Path::new("../hkmedia-core/src/rtp/demuxer.rs")));
        assert!(!is_test_code(Path::new("../hkmedia-cli/src/commands.rs")));
    }

    #[test]
    fn test_dead_code_attributes_detected() {
        let content = r#"
use std::net::UdpSocket;

#[allow(dead_code)]
struct UnusedProbe;

#[allow(clippy::too_many_arguments, dead_code)]
fn unused_forward() {}

// #[allow(dead_code)] in a comment is fine
#[allow(unused_variables)]
fn forward(datagram: &[u8]) {}
"#;
        let mut findings = Vec::new();
        check_source(Path::new("demuxer.rs"), content, &mut findings);

        let lines: Vec<_> = findings.iter().map(|f| f.line).collect();
        assert_eq!(lines, vec![4, 7]);
    }

    #[test]
    fn dead_code_enforcement() {
        let mut findings = Vec::new();
        let mut checked = 0;

        for path in workspace_sources().expect("workspace is readable") {
            if is_test_code(&path) {
                continue;
            }
            let content = fs::read_to_string(&path).expect("source is readable");
            check_source(&path, &content, &mut findings);
            checked += 1;
        }

        assert!(
            report("Dead code enforcement", checked, &findings),
            "dead code allowances found in production code, see output above"
        );
    }
}
