// ---------------------------------------------------------------------------
// Input validation limits
// ---------------------------------------------------------------------------

/// Maximum length of a stream or rendition name in bytes.
pub const MAX_STREAM_NAME_LENGTH: usize = 128;

/// Maximum length of an object name in bytes.
pub const MAX_OBJECT_NAME_LENGTH: usize = 1024;

/// Upper bound on any time-limited access URL (7 days).
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Default expiry for presigned URLs when the caller does not ask for one.
pub const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;

/// Maximum `limit` query parameter value for list endpoints.
pub const MAX_LIST_LIMIT: usize = 100;

/// Default `limit` query parameter value for list endpoints.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// File extension every served HLS segment must carry.
pub const SEGMENT_EXTENSION: &str = ".ts";

/// Validate a `/`-separated object name relative to a backend root.
///
/// Rejects empty names, absolute paths, `.`/`..` components, empty components,
/// hidden (dot-prefixed) components, backslashes and NUL bytes.
pub fn validate_object_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > MAX_OBJECT_NAME_LENGTH {
        return Err(format!(
            "name exceeds max length {} bytes",
            MAX_OBJECT_NAME_LENGTH
        ));
    }
    if name.starts_with('/') {
        return Err("absolute paths are not allowed".to_string());
    }
    if name.contains('\\') {
        return Err("backslashes are not allowed".to_string());
    }
    if name.contains('\0') {
        return Err("NUL bytes are not allowed".to_string());
    }
    for component in name.split('/') {
        match component {
            "" => return Err("empty path component".to_string()),
            "." | ".." => return Err("relative path components are not allowed".to_string()),
            c if c.starts_with('.') => {
                return Err("hidden path components are not allowed".to_string())
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate a listing prefix: empty is allowed (everything), otherwise the same
/// rules as object names apply, with a trailing `/` permitted.
pub fn validate_prefix(prefix: &str) -> Result<(), String> {
    if prefix.is_empty() {
        return Ok(());
    }
    validate_object_name(prefix.strip_suffix('/').unwrap_or(prefix))
}

/// Validate a stream or rendition name: a single path component made of
/// ASCII alphanumerics, `-`, `_` and `.`, not starting with `.`.
pub fn validate_stream_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > MAX_STREAM_NAME_LENGTH {
        return Err(format!(
            "name exceeds max length {} bytes",
            MAX_STREAM_NAME_LENGTH
        ));
    }
    if name.starts_with('.') {
        return Err("name must not start with '.'".to_string());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("character {bad:?} is not allowed"));
    }
    Ok(())
}

/// Check an uploaded file name against the configured extension allow-list
/// (case-insensitive, extensions given without the dot).
pub fn is_allowed_upload(name: &str, allowed_extensions: &[String]) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(ext))
}

/// Validate a requested presign expiry against the configured cap.
pub fn validate_presign_expiry(expires_secs: u64, max_secs: u64) -> Result<(), String> {
    if expires_secs == 0 {
        return Err("expiry must be at least 1 second".to_string());
    }
    if expires_secs > max_secs {
        return Err(format!(
            "expiry {}s exceeds maximum {}s",
            expires_secs, max_secs
        ));
    }
    Ok(())
}

/// Derive a timestamped stream name from a source object name:
/// `<sanitized stem>_<unix millis>`.
pub fn derive_stream_name(source: &str, unix_millis: i64) -> String {
    let file = source.rsplit('/').next().unwrap_or(source);
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_start_matches('.');
    let mut stem: String = trimmed.chars().take(MAX_STREAM_NAME_LENGTH - 20).collect();
    if stem.is_empty() {
        stem.push_str("stream");
    }
    format!("{stem}_{unix_millis}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_object_names() {
        assert!(validate_object_name("movie.mp4").is_ok());
        assert!(validate_object_name("a/b/segment_000.ts").is_ok());
        assert!(validate_object_name("with space.mp4").is_ok());
    }

    #[test]
    fn test_object_names_escaping_root_rejected() {
        for name in [
            "",
            "/etc/passwd",
            "../secret",
            "a/../../b",
            "a/./b",
            "a//b",
            "a\\b",
            "a\0b",
            ".staging/x",
            "a/.hidden",
        ] {
            assert!(validate_object_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_prefix_rules() {
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("movies/").is_ok());
        assert!(validate_prefix("../").is_err());
    }

    #[test]
    fn test_stream_names() {
        assert!(validate_stream_name("intro_1700000000000").is_ok());
        assert!(validate_stream_name("720p").is_ok());
        assert!(validate_stream_name("").is_err());
        assert!(validate_stream_name(".hidden").is_err());
        assert!(validate_stream_name("a/b").is_err());
        assert!(validate_stream_name("..").is_err());
        assert!(validate_stream_name(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_upload_extension_allow_list() {
        let allowed = vec!["mp4".to_string(), "mov".to_string()];
        assert!(is_allowed_upload("clip.mp4", &allowed));
        assert!(is_allowed_upload("dir/Clip.MOV", &allowed));
        assert!(!is_allowed_upload("clip.exe", &allowed));
        assert!(!is_allowed_upload("mp4", &allowed));
    }

    #[test]
    fn test_presign_expiry_cap() {
        assert!(validate_presign_expiry(3600, MAX_PRESIGN_EXPIRY_SECS).is_ok());
        assert!(validate_presign_expiry(MAX_PRESIGN_EXPIRY_SECS, MAX_PRESIGN_EXPIRY_SECS).is_ok());
        assert!(validate_presign_expiry(MAX_PRESIGN_EXPIRY_SECS + 1, MAX_PRESIGN_EXPIRY_SECS).is_err());
        assert!(validate_presign_expiry(0, MAX_PRESIGN_EXPIRY_SECS).is_err());
    }

    #[test]
    fn test_derive_stream_name() {
        assert_eq!(
            derive_stream_name("uploads/My Clip.mp4", 1_700_000_000_000),
            "My_Clip_1700000000000"
        );
        assert_eq!(derive_stream_name(".mp4", 5), "mp4_5");
        assert_eq!(derive_stream_name("...", 5), "stream_5");
        let derived = derive_stream_name(&"z".repeat(300), 1);
        assert!(validate_stream_name(&derived).is_ok());
    }
}
