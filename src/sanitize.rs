//! Name normalisation for remote folder identifiers and relative paths.

use crate::error::{Result, TransferError};

/// Characters no common filesystem accepts in a path segment.
pub const RESERVED_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Replaces every reserved character with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if RESERVED_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Builds the `{code}_{name}` folder identifier used as upload destination.
///
/// Falls back to whichever part is non-empty; two empty inputs give an
/// empty string.
pub fn build_folder_name(code: &str, name: &str) -> String {
    let name = sanitize(name);
    match (code.is_empty(), name.is_empty()) {
        (false, false) => format!("{code}_{name}"),
        (false, true) => code.to_string(),
        (true, false) => name,
        (true, true) => String::new(),
    }
}

/// Checks a `/`-separated relative path before it is sent to the remote.
///
/// Rejects empty paths, absolute paths, empty segments and `..` traversal.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {path}"
        )));
    }
    for segment in path.split(['/', '\\']) {
        match segment {
            "" => {
                return Err(TransferError::InvalidPath(format!(
                    "empty segment in path: {path}"
                )))
            }
            ".." => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {path}"
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("a/b\\c"), "a_b_c");
    }

    #[test]
    fn sanitize_replaces_every_reserved_char() {
        assert_eq!(sanitize(r#"x:*?"<>|y"#), "x_______y");
        assert_eq!(sanitize("plain name"), "plain name");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize("Q3: report <final>?");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn folder_name_joins_code_and_name() {
        assert_eq!(build_folder_name("G1", "a/b"), "G1_a_b");
    }

    #[test]
    fn folder_name_falls_back_to_single_part() {
        assert_eq!(build_folder_name("G1", ""), "G1");
        assert_eq!(build_folder_name("", "x"), "x");
        assert_eq!(build_folder_name("", ""), "");
    }

    #[test]
    fn folder_name_is_idempotent_on_name() {
        let name = sanitize("Acme/Build:2");
        assert_eq!(build_folder_name("P7", &name), build_folder_name("P7", "Acme/Build:2"));
    }

    #[test]
    fn relative_paths_accepted() {
        assert!(validate_relative_path("a.txt").is_ok());
        assert!(validate_relative_path("top/sub/b.txt").is_ok());
        assert!(validate_relative_path(".hidden/x").is_ok());
    }

    #[test]
    fn relative_paths_rejected() {
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("top/../../escape").is_err());
        assert!(validate_relative_path("top//b.txt").is_err());
        assert!(validate_relative_path("..\\evil").is_err());
    }
}
