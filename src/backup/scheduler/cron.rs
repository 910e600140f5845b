use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};

/// The first firing of `expression` strictly after `after`
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron_parser::parse(expression, &after)
        .map_err(|e| Error::InvalidConfig(format!("invalid cron expression {expression:?}: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_daily_at_two() {
        let after = Utc.with_ymd_and_hms(2026, 10, 18, 1, 30, 0).unwrap();
        assert_eq!(
            next_fire_time("0 2 * * *", after).unwrap(),
            Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap()
        );

        let after = Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap();
        assert_eq!(
            next_fire_time("0 2 * * *", after).unwrap(),
            Utc.with_ymd_and_hms(2026, 10, 19, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_every_five_minutes() {
        let after = Utc.with_ymd_and_hms(2026, 10, 18, 1, 31, 10).unwrap();
        assert_eq!(
            next_fire_time("*/5 * * * *", after).unwrap(),
            Utc.with_ymd_and_hms(2026, 10, 18, 1, 35, 0).unwrap()
        );
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            next_fire_time("every day", Utc::now()),
            Err(Error::InvalidConfig(_))
        ));
        assert!(next_fire_time("", Utc::now()).is_err());
    }
}
