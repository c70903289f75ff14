//! Deterministic classification of changed paths for the draft guard.

use std::path::{Component, Path};

/// Default extensions treated as executable code while a plan is being drafted.
pub const DEFAULT_CODE_EXTENSIONS: &[&str] = &[
    "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "rs", "go", "java", "kt", "kts", "scala",
    "c", "h", "cc", "cpp", "hpp", "cs", "rb", "php", "swift", "m", "mm", "lua", "pl", "r", "dart",
    "ex", "exs", "erl", "hs", "clj", "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd", "css",
    "scss", "sass", "less", "vue", "svelte", "html", "sql",
];

/// Extension-less file names that are executable build or shell scripts.
const CODE_FILE_NAMES: &[&str] = &["Makefile", "Dockerfile", "justfile", "Justfile", "Rakefile"];

/// How the draft guard treats a changed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Executable code: reverted while drafting.
    Code,
    /// Documentation, specs, data: kept.
    Document,
}

/// Classify a repository-relative path by extension (case-insensitive).
pub fn classify_path<S: AsRef<str>>(path: &Path, code_extensions: &[S]) -> PathClass {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return PathClass::Document;
    };
    if CODE_FILE_NAMES.contains(&file_name) {
        return PathClass::Code;
    }
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return PathClass::Document;
    };
    if code_extensions
        .iter()
        .any(|code| code.as_ref().trim_start_matches('.').eq_ignore_ascii_case(ext))
    {
        PathClass::Code
    } else {
        PathClass::Document
    }
}

/// True if `path` lies under the top-level directory `prefix` (component-wise).
pub fn is_under(path: &Path, prefix: &Path) -> bool {
    let normalize = |p: &Path| -> Vec<String> {
        p.components()
            .filter(|component| !matches!(component, Component::CurDir | Component::RootDir))
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect()
    };
    let prefix = normalize(prefix);
    if prefix.is_empty() {
        return false;
    }
    let path = normalize(path);
    path.len() >= prefix.len() && path[..prefix.len()] == prefix[..]
}
