//! Shared utility functions for the launchpad crate.

/// Quote a string for safe interpolation into a POSIX `sh` command line.
///
/// Plain words made of `[A-Za-z0-9_./:@%+=,-]` are returned as-is; anything
/// else is wrapped in single quotes with embedded quotes escaped as `'\''`.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:@%+=,-".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Timestamp suffix used for backups and scratch directories (`20250102150405`).
pub fn timestamp_suffix() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Check that a string is a plausible DNS name.
///
/// Labels are 1-63 characters of ASCII alphanumerics and hyphens, not starting
/// or ending with a hyphen. Names are also used as file names, so this doubles
/// as a guard against path traversal.
pub fn is_valid_domain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Check that an app/site name is safe to use as a single path component.
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Return the last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}
