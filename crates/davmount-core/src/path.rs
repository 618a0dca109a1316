//! Path handling for cache keys and request targets.
//!
//! Internally every path is absolute, forward-slash separated, trailing
//! slash stripped (except the root) and percent-escaped. The escaped form
//! doubles as the cache key and the request target; names are unescaped
//! again just before they are handed back to the kernel.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Everything curl would escape in a path segment, slash excluded so the
/// path structure survives.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Convert a kernel-visible path into the internal form: prefix the base
/// directory (skipped when the base is the root), strip a trailing slash,
/// escape. Returns an owned value; the caller's stack frame bounds its life.
pub fn convert(base_dir: &str, path: &str) -> String {
    let mut joined = if base_dir.ends_with('/') {
        path.to_string()
    } else {
        format!("{base_dir}{path}")
    };
    if joined.len() > 1 && joined.ends_with('/') {
        joined.pop();
    }
    escape(&joined)
}

pub fn escape(path: &str) -> String {
    utf8_percent_encode(path, PATH_ESCAPE).to_string()
}

pub fn unescape(name: &str) -> String {
    percent_decode_str(name).decode_utf8_lossy().into_owned()
}

/// Parent of an absolute path; the parent of the root is the root.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of an absolute path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
