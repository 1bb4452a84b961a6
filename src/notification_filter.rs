use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::gitignore::Pattern;

/// Exclusion patterns bound to a watch root.
///
/// Candidates are stripped of the root prefix before matching, so patterns
/// are written relative to the watched directory.
pub struct NotificationFilter {
    root: PathBuf,
    ignores: Vec<Pattern>,
}

impl NotificationFilter {
    /// Compiles every pattern up front; a malformed glob is a configuration
    /// error here rather than a silent non-match later.
    pub fn new(root: &Path, ignores: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(ignores.len());
        for line in ignores {
            if let Some(pattern) = Pattern::compile(line)? {
                debug!("Adding ignore: {}", pattern.as_str());
                compiled.push(pattern);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            ignores: compiled,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-anchors the patterns at a new root.
    pub fn rebase(&mut self, root: &Path) {
        self.root = root.to_path_buf();
    }

    /// Path of `path` relative to the root, or `path` itself when it lies
    /// outside of it.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let relative = self.relative(path);
        if relative.as_os_str().is_empty() {
            // the root itself is always watched
            return false;
        }

        for pattern in &self.ignores {
            if pattern.matches(relative) {
                debug!("Ignoring {:?}: matched {:?}", path, pattern.as_str());
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::NotificationFilter;
    use std::path::{Path, PathBuf};

    fn root() -> PathBuf {
        PathBuf::from("/home/user/project")
    }

    fn filter(ignores: &[&str]) -> NotificationFilter {
        let ignores: Vec<String> = ignores.iter().map(|s| (*s).to_string()).collect();
        NotificationFilter::new(&root(), &ignores).unwrap()
    }

    #[test]
    fn test_allows_everything_by_default() {
        let filter = filter(&[]);

        assert!(!filter.is_excluded(&root().join("foo")));
        assert!(!filter.is_excluded(&root().join("src").join("main.rs")));
    }

    #[test]
    fn test_multiple_ignores() {
        let filter = filter(&["*.rs", "*.toml"]);

        assert!(filter.is_excluded(&root().join("hello.rs")));
        assert!(filter.is_excluded(&root().join("Cargo.toml")));
        assert!(!filter.is_excluded(&root().join("README.md")));
    }

    #[test]
    fn test_patterns_are_relative_to_root() {
        let filter = filter(&["src/*.rs", "/target"]);

        assert!(filter.is_excluded(&root().join("src").join("lib.rs")));
        assert!(!filter.is_excluded(&root().join("other").join("src").join("lib.rs")));
        assert!(filter.is_excluded(&root().join("target")));
    }

    #[test]
    fn test_root_is_never_excluded() {
        let filter = filter(&["project", "*"]);

        assert!(!filter.is_excluded(&root()));
        assert!(filter.is_excluded(&root().join("anything")));
    }

    #[test]
    fn test_comments_and_blanks_are_skipped() {
        let filter = filter(&["", "# target", "   "]);

        assert!(!filter.is_excluded(&root().join("target")));
        assert!(!filter.is_excluded(&root().join("# target")));
    }

    #[test]
    fn test_malformed_pattern_is_an_error() {
        let ignores = vec!["src/[".to_string()];
        assert!(NotificationFilter::new(&root(), &ignores).is_err());
    }

    #[test]
    fn test_rebase() {
        let mut filter = filter(&["/build"]);
        filter.rebase(Path::new("/elsewhere"));

        assert_eq!(filter.root(), Path::new("/elsewhere"));
        assert!(filter.is_excluded(Path::new("/elsewhere/build")));
        assert!(!filter.is_excluded(&root().join("src")));
    }

    #[test]
    fn test_relative() {
        let filter = filter(&[]);

        assert_eq!(filter.relative(&root().join("a/b")), Path::new("a/b"));
        assert_eq!(filter.relative(Path::new("/elsewhere")), Path::new("/elsewhere"));
    }
}
