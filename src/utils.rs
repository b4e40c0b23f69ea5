//! Small helpers shared across the crate
//!
//! - UTF-8 aware truncation, used to keep server-provided error bodies
//!   readable inside error messages
//! - all-or-nothing replacement of private files (refresh-token record,
//!   keystore)
//! - the default `User-Agent` value

use std::io::Write;
use std::path::Path;

/// Cut `s` to at most `max_bytes` bytes without splitting a character.
///
/// # Example
/// ```
/// use bearer_session::utils::safe_truncate;
///
/// // 'é' is 2 bytes; cutting at 4 would split it
/// assert_eq!(safe_truncate("Café", 4), "Caf");
/// assert_eq!(safe_truncate("Café", 5), "Café");
/// ```
#[inline]
#[must_use]
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let end = s
        .char_indices()
        .map(|(idx, ch)| idx + ch.len_utf8())
        .take_while(|&end| end <= max_bytes)
        .last()
        .unwrap_or(0);
    &s[..end]
}

/// Truncate for display, appending "..." when anything was cut.
///
/// # Example
/// ```
/// use bearer_session::utils::truncate_for_display;
///
/// assert_eq!(truncate_for_display("Service unavailable", 7), "Service...");
/// assert_eq!(truncate_for_display("ok", 7), "ok");
/// ```
#[must_use]
pub fn truncate_for_display(s: &str, max_bytes: usize) -> String {
    let truncated = safe_truncate(s, max_bytes);
    if truncated.len() < s.len() {
        format!("{truncated}...")
    } else {
        truncated.to_string()
    }
}

/// Replace `path` with `contents` so that readers see either the old file
/// or the complete new one, never a partial write.
///
/// The data goes to a temporary file in the same directory, is flushed to
/// disk, restricted to the owner on Unix (0600) and then renamed over the
/// destination.
///
/// # Errors
///
/// Returns any I/O error from creating the directory, writing, or renaming.
pub fn write_private_file_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// `User-Agent` string encoding crate version and host platform, e.g.
/// `bearer-session/0.1.0 (linux; x86_64)`
#[must_use]
pub fn default_user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
