//! L3 domain handlers (specification §4.6-§4.10): the repository crawler,
//! document indexer orchestrator, idempotent context-item writer,
//! embedding batch producer, and tree visualisation service.

pub mod context_writer;
pub mod crawler;
pub mod embedding_producer;
pub mod indexer;
pub mod tree_viz;

/// Classify a file's language from its extension. Shared between the
/// crawler (§4.6 "classify language by extension") and the indexer, which
/// stamps `FILE.file_type` with the same classification (§3.4).
#[must_use]
pub fn classify_language(relative_path: &str) -> String {
    let extension = relative_path.rsplit('.').next().unwrap_or("");
    let language = match extension.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "md" | "markdown" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "sql" => "sql",
        "sh" | "bash" => "shell",
        _ => "unknown",
    };
    language.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_extensions() {
        assert_eq!(classify_language("src/main.rs"), "rust");
        assert_eq!(classify_language("a/b/c.py"), "python");
        assert_eq!(classify_language("README.md"), "markdown");
    }

    #[test]
    fn unknown_extension_is_unknown() {
        assert_eq!(classify_language("data.bin"), "unknown");
        assert_eq!(classify_language("no_extension"), "unknown");
    }
}
