//! Shared utility functions for the presence sync

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length Discord accepts for activity text fields.
pub const PRESENCE_TEXT_MAX_CHARS: usize = 128;

// ---------------------------------------------------------------------------
// Unicode-safe string truncation
// ---------------------------------------------------------------------------

/// Truncate a string to at most `max_chars` Unicode characters.
///
/// If truncated, appends "..." so the total character count is ≤ `max_chars`.
/// Never panics on multi-byte characters (unlike byte-index slicing).
pub fn truncate(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Round half up (towards positive infinity), e.g. `2.5 -> 3`, `-2.5 -> -2`.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Current wall clock time as fractional Unix seconds.
///
/// A clock set before 1970 reads as 0 rather than failing.
pub fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_truncate_never_panics(s in ".*", max in 0usize..200) {
            let _ = truncate(&s, max);
        }

        #[test]
        fn prop_truncate_respects_max_chars(s in ".{0,200}", max in 3usize..150) {
            let result = truncate(&s, max);
            prop_assert!(result.chars().count() <= max);
        }

        #[test]
        fn prop_truncate_short_identity(s in ".{0,10}") {
            let result = truncate(&s, PRESENCE_TEXT_MAX_CHARS);
            prop_assert_eq!(result, s);
        }

        #[test]
        fn prop_round_half_up_is_integral(x in -1.0e9f64..1.0e9) {
            let r = round_half_up(x);
            prop_assert_eq!(r.fract(), 0.0);
            prop_assert!((r - x).abs() <= 0.5 + 1e-6);
        }
    }
}
