// File path canonicalization for document keys: NFC, `/` separators,
// traversal rejection, 1024 char max.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed file path length in characters.
const MAX_FILE_PATH_CHARS: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("file path is empty")]
    Empty,

    #[error("file path exceeds maximum length of {MAX_FILE_PATH_CHARS} characters")]
    TooLong,

    #[error("file path escapes the workspace root via `{0}`")]
    Traversal(String),

    #[error("file path contains a null byte")]
    NullByte,

    #[error("file path contains a control character")]
    ControlCharacter,
}

/// Canonicalize a workspace-relative file path so that every spelling of
/// the same file maps onto one document key.
///
/// - Unicode NFC (canonical composition only, so distinct file names such
///   as ligatures are never folded together)
/// - `\` becomes `/`, repeated separators collapse, leading and trailing
///   separators are stripped
/// - `.` segments are dropped, `..` segments are rejected
/// - null bytes and other control characters are rejected
pub fn normalize_file_path(input: &str) -> Result<String, PathError> {
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }
    if input.chars().any(char::is_control) {
        return Err(PathError::ControlCharacter);
    }

    let composed: String = input.nfc().collect();
    let unified = composed.replace('\\', "/");

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal("..".to_string())),
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }

    let joined = segments.join("/");
    if joined.chars().count() > MAX_FILE_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(joined)
}
