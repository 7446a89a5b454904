//! Canonical keys.
//!
//! A key is a relative, `/`-separated path. Keys identify handlers in the
//! cache and on disk, and (prefixed by a slash) resources in the catalog.

use crate::error::{FolioError, Result};

/// Collapses `.` and `..` segments, strips leading and duplicate slashes and
/// refuses any key that would reach into the `.git` folder.
///
/// `..` at the root is clamped, the same way `/..` resolves to `/`.
pub fn normalize(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.first() == Some(&".git") {
        return Err(FolioError::InvalidKey(format!(
            "bad '{path}' path, access to the '.git' folder is denied"
        )));
    }
    Ok(segments.join("/"))
}

/// The folder holding the given key, `""` for the root.
pub fn parent(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    }
}

/// The last segment of a key.
pub fn name(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

pub fn resolve2(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// Whether `key` is `base` itself or lies below it.
pub fn is_within(key: &str, base: &str) -> bool {
    if base.is_empty() {
        return true;
    }
    key == base || (key.starts_with(base) && key.as_bytes().get(base.len()) == Some(&b'/'))
}

/// Rebases `key` from `source` onto `target`; `key` must lie within `source`.
pub fn rebase(key: &str, source: &str, target: &str) -> String {
    format!("{target}{}", &key[source.len()..])
}

/// `/a/b` -> `a/b.metadata`
pub fn metadata_key(abspath: &str) -> Result<String> {
    let key = normalize(abspath)?;
    Ok(format!("{key}.metadata"))
}

/// `a/b.metadata` -> `/a/b`
pub fn abspath_of(metadata_key: &str) -> Option<String> {
    metadata_key.strip_suffix(".metadata").map(|stem| format!("/{stem}"))
}

/// The key of the metadata file sitting next to a content file, `a/b.txt` -> `a/b.metadata`.
pub fn sibling_metadata(key: &str) -> Option<String> {
    if key.ends_with(".metadata") {
        return None;
    }
    let name = name(key);
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &key[..key.len() - (name.len() - idx)],
        _ => key,
    };
    Some(format!("{stem}.metadata"))
}

/// The extension of the last segment, if any.
pub fn extension(key: &str) -> Option<&str> {
    let name = name(key);
    match name.rfind('.') {
        Some(idx) if idx > 0 => Some(&name[idx + 1..]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_dots() {
        assert_eq!(normalize("/a/./b/../c").unwrap(), "a/c");
        assert_eq!(normalize("../../x").unwrap(), "x");
        assert_eq!(normalize("a//b/").unwrap(), "a/b");
        assert_eq!(normalize("").unwrap(), "");
    }

    #[test]
    fn refuses_git() {
        assert!(matches!(normalize(".git"), Err(FolioError::InvalidKey(_))));
        assert!(matches!(normalize("/.git/config"), Err(FolioError::InvalidKey(_))));
        assert!(matches!(normalize("a/../.git"), Err(FolioError::InvalidKey(_))));
        assert_eq!(normalize("a/.git").unwrap(), "a/.git");
        assert_eq!(normalize(".gitignore").unwrap(), ".gitignore");
    }

    #[test]
    fn metadata_siblings() {
        assert_eq!(sibling_metadata("a/b.txt").as_deref(), Some("a/b.metadata"));
        assert_eq!(sibling_metadata("a/b").as_deref(), Some("a/b.metadata"));
        assert_eq!(sibling_metadata("a/b.metadata"), None);
        assert_eq!(abspath_of("a/b.metadata").as_deref(), Some("/a/b"));
        assert_eq!(metadata_key("/a/b").unwrap(), "a/b.metadata");
    }

    #[test]
    fn within() {
        assert!(is_within("a/b", "a"));
        assert!(!is_within("ab", "a"));
        assert!(is_within("a", "a"));
        assert_eq!(rebase("a/b/c", "a/b", "x"), "x/c");
    }
}
