//! Path parsing utilities for the VFS layer.
//!
//! Paths are POSIX-style: absolute, '/'-separated, components of at most
//! 255 bytes, total length of at most 4096 bytes.

use crate::FsError;

/// Maximum length of a single path component in bytes.
pub const MAX_COMPONENT_LEN: usize = 255;

/// Maximum total path length in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Split a path into its components, filtering empty segments.
///
/// Leading and trailing slashes are ignored; consecutive slashes collapse.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Validates a path against the VFS syntax rules.
///
/// # Errors
///
/// [`FsError::InvalidArgument`] for relative paths, empty paths, oversized
/// paths, or oversized components.
pub fn validate(path: &str) -> Result<(), FsError> {
    if path.is_empty() || !is_absolute(path) || path.len() > MAX_PATH_LEN {
        return Err(FsError::InvalidArgument);
    }
    for component in components(path) {
        if component.len() > MAX_COMPONENT_LEN {
            return Err(FsError::InvalidArgument);
        }
    }
    Ok(())
}

/// Splits a path into `(parent, final_component)`.
///
/// `"/a/b/c"` becomes `("/a/b", "c")`; `"/file"` becomes `("/", "file")`.
/// Trailing slashes are stripped first.
///
/// # Errors
///
/// [`FsError::InvalidArgument`] if the path has no final component (`"/"`).
pub fn split_parent(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    let split_at = trimmed.rfind('/').ok_or(FsError::InvalidArgument)?;
    let name = &trimmed[split_at + 1..];
    if name.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    let parent = if split_at == 0 { "/" } else { &trimmed[..split_at] };
    Ok((parent, name))
}

/// Find the longest mount point that is a prefix of `path`.
///
/// Mount points are compared as path prefixes (i.e. `/dev` matches
/// `/dev/null` but not `/device`). The root mount `/` always matches if
/// present.
pub fn longest_prefix_match<'a>(
    path: &str,
    mount_points: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;

    for mp in mount_points {
        let matches = if mp == "/" {
            // Root mount matches everything.
            true
        } else {
            path == mp || path.starts_with(mp) && path.as_bytes().get(mp.len()) == Some(&b'/')
        };

        if matches && best.is_none_or(|b| mp.len() > b.len()) {
            best = Some(mp);
        }
    }

    best
}

/// Strip the mount prefix from a path, returning the remainder.
///
/// If the mount is `/`, the entire path is returned (without the leading
/// `/`). Otherwise, the mount prefix and its trailing slash are removed.
#[must_use]
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        path.strip_prefix('/').unwrap_or(path)
    } else if path.len() == mount.len() {
        ""
    } else {
        // Strip mount prefix + the '/' separator.
        &path[mount.len() + 1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::vec::Vec;

    #[test]
    fn components_basic() {
        let parts: Vec<_> = components("/usr/bin/ls").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
    }

    #[test]
    fn components_collapse_separators() {
        let parts: Vec<_> = components("//usr///bin/").collect();
        assert_eq!(parts, ["usr", "bin"]);
    }

    #[test]
    fn components_root_is_empty() {
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn validate_rejects_relative() {
        assert_eq!(validate("usr/bin"), Err(FsError::InvalidArgument));
        assert_eq!(validate(""), Err(FsError::InvalidArgument));
    }

    #[test]
    fn validate_rejects_long_component() {
        let long = String::from("/") + &"x".repeat(256);
        assert_eq!(validate(&long), Err(FsError::InvalidArgument));
        let ok = String::from("/") + &"x".repeat(255);
        assert_eq!(validate(&ok), Ok(()));
    }

    #[test]
    fn validate_rejects_long_path() {
        let long = String::from("/") + &"a/".repeat(2100);
        assert!(long.len() > MAX_PATH_LEN);
        assert_eq!(validate(&long), Err(FsError::InvalidArgument));
    }

    #[test]
    fn split_parent_nested() {
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b", "c"));
    }

    #[test]
    fn split_parent_in_root() {
        assert_eq!(split_parent("/file").unwrap(), ("/", "file"));
    }

    #[test]
    fn split_parent_trailing_slash() {
        assert_eq!(split_parent("/a/dir/").unwrap(), ("/a", "dir"));
    }

    #[test]
    fn split_parent_root_fails() {
        assert_eq!(split_parent("/"), Err(FsError::InvalidArgument));
    }

    #[test]
    fn longest_prefix_prefers_specific() {
        let mounts = ["/", "/dev"];
        assert_eq!(
            longest_prefix_match("/dev/null", mounts.iter().copied()),
            Some("/dev")
        );
        assert_eq!(
            longest_prefix_match("/device", mounts.iter().copied()),
            Some("/")
        );
    }

    #[test]
    fn strip_prefix_root() {
        assert_eq!(strip_mount_prefix("/usr/bin", "/"), "usr/bin");
    }

    #[test]
    fn strip_prefix_nested() {
        assert_eq!(strip_mount_prefix("/dev/null", "/dev"), "null");
        assert_eq!(strip_mount_prefix("/dev", "/dev"), "");
    }
}
