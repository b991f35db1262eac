//! Time-limit string parsing.
//!
//! Accepts `"1h30m15s"`-style strings (any non-empty combination of `h`,
//! `m`, `s` components) plus bare integer seconds, and converts them to a
//! second count. Every `<digits><unit>` pair contributes to the sum, so
//! `"90m"` and `"1h30m"` parse to the same value.

use super::definition::WorkflowError;

/// Parse a duration string into whole seconds.
///
/// `"0s"` and `"0"` are valid and mean "no wait". Anything that is not a
/// bare integer or a sequence of `<digits>{h|m|s}` components is rejected.
pub fn parse_duration(input: &str) -> Result<u64, WorkflowError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(WorkflowError::InvalidDuration(input.to_string()));
    }

    // Bare integer seconds.
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map_err(|_| WorkflowError::InvalidDuration(input.to_string()));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut saw_component = false;

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            // Unit without a preceding number.
            return Err(WorkflowError::InvalidDuration(input.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| WorkflowError::InvalidDuration(input.to_string()))?;
        digits.clear();

        let multiplier = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(WorkflowError::InvalidDuration(input.to_string())),
        };
        total += value * multiplier;
        saw_component = true;
    }

    // Trailing digits with no unit.
    if !digits.is_empty() || !saw_component {
        return Err(WorkflowError::InvalidDuration(input.to_string()));
    }

    Ok(total)
}

/// Render seconds in the canonical `XhYmZs` form, omitting zero components.
///
/// Zero renders as `"0s"`. `parse_duration(&format_duration(n)) == n` for
/// every `n`.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;

    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_components() {
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("45s").unwrap(), 45);
    }

    #[test]
    fn test_parse_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), 5400);
        assert_eq!(parse_duration("1h30m15s").unwrap(), 5415);
        assert_eq!(parse_duration("2h5s").unwrap(), 7205);
    }

    #[test]
    fn test_parse_bare_seconds() {
        assert_eq!(parse_duration("90").unwrap(), 90);
        assert_eq!(parse_duration("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_zero_is_valid() {
        assert_eq!(parse_duration("0s").unwrap(), 0);
    }

    #[test]
    fn test_parse_equivalent_spellings() {
        assert_eq!(parse_duration("90m").unwrap(), parse_duration("1h30m").unwrap());
        assert_eq!(parse_duration("3600").unwrap(), parse_duration("1h").unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "  ", "h", "1x", "1h30", "-5s", "1.5h", "s1", "1hh", "one hour"] {
            assert!(
                parse_duration(bad).is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_trailing_digits() {
        assert!(parse_duration("1h30").is_err());
    }

    #[test]
    fn test_format_canonical() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(1800), "30m");
        assert_eq!(format_duration(5415), "1h30m15s");
        assert_eq!(format_duration(3600), "1h");
        assert_eq!(format_duration(3605), "1h5s");
    }

    #[test]
    fn test_roundtrip_through_canonical_form() {
        for input in ["1h30m15s", "90m", "7200", "59s", "0s", "2h"] {
            let parsed = parse_duration(input).unwrap();
            let canonical = format_duration(parsed);
            assert_eq!(
                parse_duration(&canonical).unwrap(),
                parsed,
                "canonical form of '{input}' should re-parse to the same value"
            );
        }
    }
}
