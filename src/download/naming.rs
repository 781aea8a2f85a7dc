//! Destination file names
//!
//! Names announced by remote peers are untrusted: they are reduced to a
//! single clean path component before touching the documents directory.

use std::path::{Path, PathBuf};

/// Reduce an announced file name to a safe single component
///
/// Returns `None` when nothing usable is left.
pub fn clean_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == ' ' || c == '.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Split `archive.tar.gz` into `("archive", "tar.gz")`
fn split_complete_suffix(name: &str) -> (&str, &str) {
    match name.find('.') {
        Some(0) | None => (name, ""),
        Some(dot) => (&name[..dot], &name[dot + 1..]),
    }
}

/// Name for the `index`-th collision of `name`: `archive-2.tar.gz`
pub fn indexed_name(name: &str, index: u32) -> String {
    match split_complete_suffix(name) {
        (base, "") => format!("{}-{}", base, index),
        (base, suffix) => format!("{}-{}.{}", base, index, suffix),
    }
}

/// First free path for `name` inside `dir`
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..=u32::MAX)
        .map(|index| dir.join(indexed_name(name, index)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_clean_file_name() {
        assert_eq!(clean_file_name("photo.jpg").as_deref(), Some("photo.jpg"));
        assert_eq!(clean_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(clean_file_name("C:\\Users\\me\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(clean_file_name("what?.txt").as_deref(), Some("what_.txt"));
        assert_eq!(clean_file_name(" .hidden. ").as_deref(), Some("hidden"));
        assert_eq!(clean_file_name(".."), None);
        assert_eq!(clean_file_name("dir/"), None);
        assert_eq!(clean_file_name(""), None);
    }

    #[test]
    fn test_indexed_name() {
        assert_eq!(indexed_name("archive.tar.gz", 2), "archive-2.tar.gz");
        assert_eq!(indexed_name("README", 1), "README-1");
        assert_eq!(indexed_name(".profile", 3), ".profile-3");
    }

    #[test]
    fn test_unique_destination() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_destination(dir.path(), "a.txt"), dir.path().join("a.txt"));

        std::fs::write(dir.path().join("a.txt"), b"1").unwrap();
        assert_eq!(unique_destination(dir.path(), "a.txt"), dir.path().join("a-1.txt"));

        std::fs::write(dir.path().join("a-1.txt"), b"2").unwrap();
        assert_eq!(unique_destination(dir.path(), "a.txt"), dir.path().join("a-2.txt"));
    }
}
