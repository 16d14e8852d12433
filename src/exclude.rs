//! Directory-entry exclusion filter (spec §4.B). Host-OS metadata files are
//! hidden from listings across both tiers so the union view doesn't leak
//! Finder/Spotlight debris.

use std::ffi::OsStr;

const EXACT_NAMES: &[&str] = &[
    ".DS_Store",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".TemporaryItems",
    ".FUSE",
];

/// True if `name` should never appear in a directory listing.
pub fn is_excluded(name: &OsStr) -> bool {
    match name.to_str() {
        Some(s) => EXACT_NAMES.contains(&s) || s.starts_with("._"),
        // Non-UTF8 names can't match any of our patterns.
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn hides_known_exact_names() {
        assert!(is_excluded(OsStr::new(".DS_Store")));
        assert!(is_excluded(OsStr::new(".Trashes")));
        assert!(is_excluded(OsStr::new(".fseventsd")));
    }

    #[test]
    fn hides_apple_double_prefix() {
        assert!(is_excluded(OsStr::new("._resourcefork")));
        assert!(is_excluded(OsStr::new("._")));
    }

    #[test]
    fn keeps_ordinary_names() {
        assert!(!is_excluded(OsStr::new("document.txt")));
        assert!(!is_excluded(OsStr::new(".hidden_but_not_apple")));
    }
}
