//! URL blacklist
//!
//! Plain-text file, one URL per line; blank lines and `#` comments are
//! ignored. Loaded once per snapshot build and applied twice: in the catalog
//! SQL and as a recheck during feed assembly.

use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Set of blocked video URLs
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    urls: HashSet<String>,
}

impl Blacklist {
    /// Load the blacklist from a text file.
    ///
    /// A missing file is not an error: the service runs with an empty
    /// blacklist and logs a warning, matching the behavior of a fresh deploy
    /// without a curated blocklist.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Blacklist file {} not readable ({}), using empty blacklist", path.display(), e);
                return Self::default();
            }
        };

        let blacklist = Self::parse(&contents);
        info!("Blacklist loaded: {} blocked URLs", blacklist.len());
        blacklist
    }

    /// Parse blacklist contents: one URL per line, `#` comments ignored.
    pub fn parse(contents: &str) -> Self {
        let urls = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { urls }
    }

    /// Build a blacklist from explicit URLs (test fixtures, mostly).
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// URLs as a slice-friendly vec for SQL `<> ALL($1)` binds.
    pub fn as_vec(&self) -> Vec<String> {
        self.urls.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let contents = "\
# curated blocklist
https://cdn.example.com/bad-1.mp4

https://cdn.example.com/bad-2.mp4
  # indented comment
";
        let bl = Blacklist::parse(contents);
        assert_eq!(bl.len(), 2);
        assert!(bl.contains("https://cdn.example.com/bad-1.mp4"));
        assert!(bl.contains("https://cdn.example.com/bad-2.mp4"));
        assert!(!bl.contains("# curated blocklist"));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(file, "https://cdn.example.com/blocked.mp4").unwrap();

        let bl = Blacklist::from_file(file.path());
        assert_eq!(bl.len(), 1);
        assert!(bl.contains("https://cdn.example.com/blocked.mp4"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let bl = Blacklist::from_file("/nonexistent/blacklist.csv");
        assert!(bl.is_empty());
    }
}
