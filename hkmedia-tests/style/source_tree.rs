//! Workspace source discovery shared by the style checks.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directories that never hold workspace sources.
const SKIPPED_DIRS: &[&str] = &["target", "examples"];
const MAX_DEPTH: usize = 8;

/// A single rule violation.
#[derive(Debug)]
pub struct Finding {
    pub path: String,
    pub line: usize,
    pub rule: &'static str,
    pub message: String,
}

impl Finding {
    pub fn new(path: &Path, line: usize, rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            path: path.display().to_string(),
            line,
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{} - {}", self.path, self.line, self.rule, self.message)
    }
}

/// Every `.rs` file under the workspace root.
///
/// Tests run from the `hkmedia-tests` directory, so the root is its parent.
pub fn workspace_sources() -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect(Path::new(".."), 0, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect(dir: &Path, depth: usize, files: &mut Vec<PathBuf>) -> io::Result<()> {
    if depth > MAX_DEPTH {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if path.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect(&path, depth + 1, files)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }

    Ok(())
}

/// Prints findings and returns whether there were none.
pub fn report(check: &str, files_checked: usize, findings: &[Finding]) -> bool {
    if findings.is_empty() {
        println!("{check}: {files_checked} files checked, no violations");
        return true;
    }

    println!("{check}: {} violation(s)", findings.len());
    for finding in findings {
        println!("  {finding}");
    }
    false
}
