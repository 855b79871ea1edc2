//! Message-based classification for errors coming from foreign clients that
//! do not expose a structured category.

const TRANSIENT_PATTERNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "connection closed",
    "broken pipe",
    "socket hang up",
    "unavailable",
    "etimedout",
    "timed out",
    "timeout",
    "deadline exceeded",
    "too many requests",
    "resource exhausted",
    "temporarily",
];

/// Whether an error message looks like a transient network or service failure.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}
