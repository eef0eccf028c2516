//! Virtual path validation and normalization.
//!
//! Virtual paths are Unix-style strings rooted at `/`. Traversal is
//! rejected rather than resolved: a path containing a `.` or `..` segment
//! or an empty segment (`//`) never reaches a mount.

use crate::error::{FsError, FsResult};

/// Normalize a client-supplied path.
///
/// Backslashes are folded to `/`, the empty string becomes `/`, trailing
/// slashes are trimmed and relative spellings are rooted at `/`. The
/// result is then validated: any `.` or `..` segment and any empty
/// segment is rejected. Names that merely contain dots (`.hidden`,
/// `..sa`, `...`) pass.
pub fn normalize(input: &str) -> FsResult<String> {
    let mut path = input.replace('\\', "/");
    if path.is_empty() {
        return Ok("/".to_string());
    }
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if !is_valid(&path) {
        return Err(FsError::invalid(format!("bad path: {input}")));
    }
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    Ok(path)
}

/// Whether a normalized path is acceptable: no empty, `.` or `..` segment.
/// Both absolute and relative spellings validate.
pub fn is_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed
        .split('/')
        .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Join a directory path and an entry name into a virtual path.
pub fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Base name of a virtual path (`/` for the root itself).
pub fn base_name(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    path.rsplit('/').next().unwrap_or(path)
}

/// Lexically resolve a possibly-relative client path against the virtual
/// root. Used for SFTP `realpath`, where clients legitimately send `.`
/// and `..`; resolution never escapes above `/`.
pub fn resolve_dots(input: &str) -> String {
    let cleaned = input.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in cleaned.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_paths() {
        assert_eq!(normalize("/a/b/c").unwrap(), "/a/b/c");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/a/.hidden/b").unwrap(), "/a/.hidden/b");
        assert_eq!(normalize("/..sa").unwrap(), "/..sa");
        assert_eq!(normalize("/...").unwrap(), "/...");
    }

    #[test]
    fn rejects_traversal_and_degenerate_segments() {
        assert!(normalize("/a/b/../c").is_err());
        assert!(normalize("/a//b").is_err());
        assert!(normalize("/a/./b").is_err());
        assert!(normalize("/..").is_err());
        assert!(normalize("/a/b/..").is_err());
        assert!(normalize("/a/b/.").is_err());
        assert!(normalize("..").is_err());
    }

    #[test]
    fn folds_backslashes_and_trailing_slashes() {
        assert_eq!(normalize("\\a\\b").unwrap(), "/a/b");
        assert_eq!(normalize("/a/b/").unwrap(), "/a/b");
        assert!(normalize("\\a\\..\\b").is_err());
    }

    #[test]
    fn relative_paths_are_rooted() {
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert!(normalize("a/../b").is_err());
    }

    #[test]
    fn normalized_output_is_canonical() {
        for input in ["/a/b", "/x", "a/b/c", "/deep/.dot/tail"] {
            let out = normalize(input).unwrap();
            assert!(out.starts_with('/'), "{out}");
            assert!(!out.contains("//"), "{out}");
            assert!(is_valid(&out), "{out}");
        }
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "docs"), "/docs");
        assert_eq!(join("/docs", "x.txt"), "/docs/x.txt");
    }

    #[test]
    fn base_name_variants() {
        assert_eq!(base_name("/"), "/");
        assert_eq!(base_name("/docs"), "docs");
        assert_eq!(base_name("/a/b/c.txt"), "c.txt");
    }

    #[test]
    fn resolve_dots_for_realpath() {
        assert_eq!(resolve_dots("."), "/");
        assert_eq!(resolve_dots("./x"), "/x");
        assert_eq!(resolve_dots("/a/b/../c"), "/a/c");
        assert_eq!(resolve_dots("/../.."), "/");
        assert_eq!(resolve_dots("a/b/./c"), "/a/b/c");
    }
}
