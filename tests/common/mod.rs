//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::Path;

use tempfile::TempDir;

/// A scratch project directory containing `build.kiln`
pub fn project(script: &str) -> TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::fs::write(dir.path().join("build.kiln"), script).expect("write build.kiln");
    dir
}

pub fn write(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("write file");
}

/// Lines of a file, empty if it does not exist
pub fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}
