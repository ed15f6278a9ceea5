// src/config/duration.rs

//! Duration strings: one or more `<integer><unit>` terms, e.g. `"200ms"`,
//! `"10m"` or `"1h30m"`. Units are `ms`, `s`, `m` and `h`.

use std::time::Duration;

pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number at '{rest}' in duration '{input}'"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("duration '{input}': {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = rest[..unit_len].trim();
        rest = rest[unit_len..].trim_start();

        let term = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "" => return Err(format!("duration '{input}' is missing a unit (ms, s, m, h)")),
            other => return Err(format!("unknown unit '{other}' in duration '{input}'")),
        };
        total = total.saturating_add(term);
    }
    Ok(total)
}

/// `HH:MM:SS`, the wall-time syntax Slurm and PBS take. Never below one
/// second; a zero limit would mean "unlimited" to some schedulers.
pub fn format_walltime(d: Duration) -> String {
    let secs = d.as_secs().max(1);
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_compound_terms() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 5m "), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1m 5s 20ms"), Ok(Duration::from_millis(65_020)));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "10", "m", "3d", "1h x", "5m10"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn walltime_rounds_up_to_one_second() {
        assert_eq!(format_walltime(Duration::from_millis(10)), "00:00:01");
        assert_eq!(format_walltime(Duration::from_secs(3725)), "01:02:05");
    }
}
