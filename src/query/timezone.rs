use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use log::debug;

/// Resolves an IANA zone name, falling back to UTC for anything unrecognised.
pub fn resolve(name: Option<&str>) -> Tz {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Tz::UTC;
    };

    name.parse::<Tz>().unwrap_or_else(|_| {
        debug!("Unknown timezone '{name}', falling back to UTC");
        Tz::UTC
    })
}

/// Renders `value` in `tz` as RFC 3339 with the zone's offset.
pub fn localize(value: DateTime<Utc>, tz: Tz) -> String {
    value
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_resolve_known_zone() {
        assert_eq!(resolve(Some("America/Los_Angeles")), Tz::America__Los_Angeles);
        assert_eq!(resolve(Some(" Europe/Berlin ")), Tz::Europe__Berlin);
    }

    #[test]
    fn test_resolve_falls_back_to_utc() {
        assert_eq!(resolve(Some("Mars/Phobos")), Tz::UTC);
        assert_eq!(resolve(Some("")), Tz::UTC);
        assert_eq!(resolve(None), Tz::UTC);
    }

    #[test]
    fn test_localize_applies_offset() {
        let value = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(localize(value, Tz::UTC), "2024-01-01T00:00:00+00:00");
        assert_eq!(
            localize(value, Tz::America__Los_Angeles),
            "2023-12-31T16:00:00-08:00"
        );
    }
}
