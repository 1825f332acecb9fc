//! Small clock and text helpers shared across the crate

use chrono::{DateTime, Utc};

/// Current wall-clock time in Unix milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as an ISO-8601 string
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Current wall-clock time as a typed timestamp
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Truncate a string to at most `max_chars`, appending a marker when cut
///
/// Subprocess output embedded into state is capped at 2000 chars; prompt
/// context sections use smaller budgets.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}...\n[truncated]", cut)
}
