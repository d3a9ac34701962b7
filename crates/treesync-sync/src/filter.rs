//! Paths that are never synchronized

use treesync_core::domain::newtypes::RelPath;

/// Prefix shared by the index file and its temporary sibling
pub const INDEX_FILE_PREFIX: &str = ".treesync-index";

/// Suffix of the temporary files written before an atomic rename
pub const TMP_SUFFIX: &str = ".treesync-tmp";

const RESERVED_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];

/// Whether `path` may be synchronized at all
///
/// Rejects the index file, in-progress atomic writes, key files and
/// names reserved on Windows (`CON`, `COM1`, `LPT9.txt`...), which could
/// not be materialized on every replica.
pub fn is_path_allowed(path: &RelPath) -> bool {
    let Some(name) = path.file_name() else {
        return true;
    };
    if name.starts_with(INDEX_FILE_PREFIX) || name.ends_with(TMP_SUFFIX) || name == ".key" {
        return false;
    }
    !is_reserved_name(name)
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return true;
    }
    match stem.strip_prefix("COM").or_else(|| stem.strip_prefix("LPT")) {
        Some(digit) => matches!(digit.as_bytes(), [b'1'..=b'9']),
        None => false,
    }
}

/// Whether any segment of `path` is a dotfile
pub fn is_hidden(path: &RelPath) -> bool {
    path.parts().any(|part| part.starts_with('.'))
}
