//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Signed lateness of `actual` relative to `expected`, in milliseconds.
pub fn lateness_ms(expected: Instant, actual: Instant) -> i64 {
    match actual.checked_duration_since(expected) {
        Some(late) => i64::try_from(late.as_millis()).unwrap_or(i64::MAX),
        None => {
            let early = expected.duration_since(actual);
            -i64::try_from(early.as_millis()).unwrap_or(i64::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lateness_is_signed() {
        let base = Instant::now();
        assert_eq!(lateness_ms(base, base + Duration::from_millis(15)), 15);
        assert_eq!(lateness_ms(base + Duration::from_millis(15), base), -15);
    }

    #[test]
    fn millis_conversion() {
        assert_eq!(duration_to_millis(Duration::from_secs(2)), 2000);
    }
}
