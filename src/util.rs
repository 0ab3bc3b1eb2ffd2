use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds.
pub fn now_ts_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix time in nanoseconds. Used for record ordering, where
/// consecutive writes within the same millisecond must still sort.
pub fn now_ts_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Truncate a string for log/title previews, appending an ellipsis.
pub fn preview(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        let prefix: String = text.chars().take(max_chars).collect();
        format!("{prefix}...")
    }
}

/// Sanitize a display name into a filesystem-safe folder name.
pub fn sanitize_folder_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview() {
        assert_eq!(preview("hello", 50), "hello");
        assert_eq!(preview("abcdef", 3), "abc...");
    }

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("My Skill!"), "my-skill-");
        assert_eq!(sanitize_folder_name("pdf_tools-v2"), "pdf_tools-v2");
    }

    #[test]
    fn test_now_monotone_enough() {
        let a = now_ts_nanos();
        let b = now_ts_nanos();
        assert!(b >= a);
    }
}
