//! Slash-separated path helpers for device-side paths.
//!
//! Device paths travel through FTP, SFTP and adb as plain strings with `/`
//! separators regardless of the host platform, so they are handled here as
//! `&str` rather than `std::path::Path`.

/// Separator placed between directory components when flattening.
pub const FLATTEN_SEPARATOR: &str = " - ";

/// Join `relative` onto `base`. An absolute `relative` replaces `base`.
pub fn join(base: &str, relative: &str) -> String {
    if base.is_empty() || relative.starts_with('/') {
        return relative.to_string();
    }
    if relative.is_empty() {
        return base.to_string();
    }
    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}/{relative}")
}

/// Directory part of `path`, or `""` when it has none.
pub fn parent(path: &str) -> &str {
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Final component of `path`.
pub fn file_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

/// Lexically normalize `path`, collapsing `.` and `..` components.
///
/// Leading `..` components of a relative path are kept, as there is nothing
/// to collapse them into.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Whether `path` lies strictly below `root`.
///
/// Paths with `.` or `..` components are never considered within.
pub fn is_strictly_within(path: &str, root: &str) -> bool {
    let path = path.trim_end_matches('/');
    if path.split('/').any(|part| part == "." || part == "..") {
        return false;
    }
    if root.is_empty() {
        return !path.is_empty() && !path.starts_with('/');
    }
    let root = root.trim_end_matches('/');
    path.len() > root.len() && path.starts_with(root) && path[root.len()..].starts_with('/')
}

/// Squash every directory component of `path` into a single file name,
/// outermost directory first: `a/b/c.mp3` becomes `a - b - c.mp3`.
pub fn flattened(path: &str) -> String {
    path.split('/')
        .filter(|component| !component.is_empty())
        .collect::<Vec<_>>()
        .join(FLATTEN_SEPARATOR)
}
