//! Node path validation, run before any request reaches a session handle.

use crate::errors::OpError;

/// Validate a node path.
///
/// `sequential` relaxes the trailing-slash rule: a sequential create appends
/// a counter, so `/queue/` is a legal prefix.
pub fn validate_path(path: &str, sequential: bool) -> Result<(), OpError> {
    let bad = |reason: &str| Err(OpError::BadArguments(format!("invalid path {path:?}: {reason}")));

    if path.is_empty() {
        return bad("path must not be empty");
    }
    if !path.starts_with('/') {
        return bad("path must start with '/'");
    }
    if path.len() == 1 {
        return Ok(());
    }
    if path.ends_with('/') && !sequential {
        return bad("path must not end with '/'");
    }

    let body = if sequential {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    };
    for segment in body[1..].split('/') {
        match segment {
            "" => return bad("empty segment"),
            "." | ".." => return bad("relative segment"),
            _ => {}
        }
    }

    if let Some(c) = path.chars().find(|c| is_forbidden(*c)) {
        return bad(&format!("forbidden character {:?}", c));
    }
    Ok(())
}

fn is_forbidden(c: char) -> bool {
    matches!(c,
        '\u{0000}'..='\u{001f}'
        | '\u{007f}'..='\u{009f}'
        | '\u{e000}'..='\u{f8ff}'
        | '\u{fff0}'..='\u{ffff}')
}

/// Parent of a validated path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a validated path; empty for the root.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}
