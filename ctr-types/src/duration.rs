//! Grace-period duration parsing: `Nd`/`Nh`/`Nm`/`Ns`, combinable as in
//! `1d12h`, per the external interfaces section.

use std::time::Duration;

use crate::error::CtrError;

/// Default grace period: 8 hours.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(8 * 60 * 60);

pub fn parse_duration(s: &str) -> Result<Duration, CtrError> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut saw_any = false;

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit_secs: u64 = match c {
            'd' => 24 * 60 * 60,
            'h' => 60 * 60,
            'm' => 60,
            's' => 1,
            _ => return Err(CtrError::validation("duration", s)),
        };
        if digits.is_empty() {
            return Err(CtrError::validation("duration", s));
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| CtrError::validation("duration", s))?;
        total += Duration::from_secs(n * unit_secs);
        digits.clear();
        saw_any = true;
    }

    if !digits.is_empty() || !saw_any {
        return Err(CtrError::validation("duration", s));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_unit() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
    }

    #[test]
    fn parses_combined_units() {
        assert_eq!(
            parse_duration("1d12h").unwrap(),
            Duration::from_secs(86400 + 12 * 3600)
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
