//! File utility functions

use std::path::PathBuf;

/// Expand a path string to an absolute path.
///
/// Handles `~` and `~/path` (home directory) and resolves relative paths
/// against the current working directory. Absolute paths pass through.
pub fn expand_path(path: &str) -> PathBuf {
    let path = path.trim();

    if path.is_empty() {
        return std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    let expanded = if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(path))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    };

    if expanded.is_relative() {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    } else {
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_absolute_unix() {
        assert_eq!(
            expand_path("/etc/pgcatalog/source.json"),
            PathBuf::from("/etc/pgcatalog/source.json")
        );
    }

    #[test]
    fn test_expand_path_relative() {
        let result = expand_path("configs/source.json");
        assert!(result.is_absolute());
        assert!(result.ends_with("configs/source.json"));
    }

    #[test]
    fn test_expand_path_tilde() {
        let result = expand_path("~/.pgcatalog/dest.json");
        assert!(result.is_absolute());
        assert!(!result.to_string_lossy().contains('~'));
        assert!(result.ends_with("dest.json"));
    }

    #[test]
    fn test_expand_path_tilde_only() {
        let result = expand_path("~");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home);
        }
    }

    #[test]
    fn test_expand_path_trims_whitespace() {
        assert_eq!(expand_path("  /plans/out  "), PathBuf::from("/plans/out"));
    }

    #[test]
    fn test_expand_path_empty_is_cwd() {
        let result = expand_path("");
        assert!(result.is_absolute());
    }
}
