//! Style enforcement
//!
//! Scans every Rust source in the workspace for patterns clippy does not
//! catch:
//!
//! - `naming_conventions` - banned prefixes, suffixes, module names and
//!   malformed `# Errors` sections
//! - `dead_code_enforcement` - `#[allow(dead_code)]` outside test code
//!
//! Both checks walk the tree through `source_tree`.

#[path = "style/source_tree.rs"]
mod source_tree;

#[path = "style/naming_conventions.rs"]
mod naming_conventions;

#[path = "style/dead_code_enforcement.rs"]
mod dead_code_enforcement;
