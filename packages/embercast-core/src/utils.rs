//! General utilities shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in whole seconds.
#[must_use]
pub fn now_secs() -> u64 {
    now_millis() / 1000
}

// ─────────────────────────────────────────────────────────────────────────────
// Filename Expansion
// ─────────────────────────────────────────────────────────────────────────────

/// Expands strftime-style `%` specifiers in a dump filename against local
/// time. Supports `%Y %m %d %H %M %S`; anything else passes through
/// unchanged so a stray `%` in a path does not break dumping.
#[must_use]
pub fn expand_time_pattern(pattern: &str) -> String {
    if !pattern.contains('%') {
        return pattern.to_string();
    }
    let now = chrono::Local::now();
    let mut out = pattern.to_string();
    for spec in ["%Y", "%m", "%d", "%H", "%M", "%S"] {
        if out.contains(spec) {
            out = out.replace(spec, &now.format(spec).to_string());
        }
    }
    out
}

/// Extracts a trailing `[N]` bitrate hint from a mount name.
///
/// Fallback chains may end in a mount like `/low.mp3[32]`, where the suffix
/// names the kbps rate a static file should be served at. Returns the bare
/// mount and the rate in bits per second.
#[must_use]
pub fn rate_hint_from_mount(mount: &str) -> Option<(&str, u64)> {
    let open = mount.rfind('[')?;
    let rest = &mount[open + 1..];
    let close = rest.find(']')?;
    if open + 1 + close + 1 != mount.len() {
        return None;
    }
    let kbps: u64 = rest[..close].parse().ok()?;
    Some((&mount[..open], kbps * 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_hint_parses_trailing_suffix() {
        assert_eq!(
            rate_hint_from_mount("/low.mp3[32]"),
            Some(("/low.mp3", 32_000))
        );
    }

    #[test]
    fn rate_hint_rejects_plain_mounts() {
        assert_eq!(rate_hint_from_mount("/live"), None);
        assert_eq!(rate_hint_from_mount("/odd[x]"), None);
        assert_eq!(rate_hint_from_mount("/mid[32]tail"), None);
    }

    #[test]
    fn expand_passes_plain_names_through() {
        assert_eq!(expand_time_pattern("/tmp/dump.mp3"), "/tmp/dump.mp3");
    }

    #[test]
    fn expand_substitutes_year() {
        let out = expand_time_pattern("dump-%Y.mp3");
        assert!(!out.contains("%Y"));
        assert!(out.starts_with("dump-2"));
    }
}
