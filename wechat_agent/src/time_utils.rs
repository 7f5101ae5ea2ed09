use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};

/// UTC bounds of a calendar date in the operator's local time zone.
pub fn local_day_bounds_utc(target_date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_naive = target_date.and_time(NaiveTime::MIN);
    let start_local = match Local.from_local_datetime(&start_naive) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        // DST gap: fall back to interpreting the naive midnight as UTC.
        chrono::LocalResult::None => {
            return (
                DateTime::<Utc>::from_naive_utc_and_offset(start_naive, Utc),
                DateTime::<Utc>::from_naive_utc_and_offset(start_naive, Utc) + Duration::days(1),
            );
        }
    };
    let start = start_local.with_timezone(&Utc);
    (start, start + Duration::days(1))
}

/// Some mirrors fabricate 00:00 when the true publish time is unknown.
/// Advancing those instants keeps them from starving the "today" view.
pub fn shift_midnight_publish_time(
    published_at: DateTime<Utc>,
    is_midnight_publish: bool,
    shift_days: i64,
) -> DateTime<Utc> {
    if !is_midnight_publish || shift_days <= 0 {
        return published_at;
    }
    published_at + Duration::days(shift_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_bounds_span_24_hours() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let (start, end) = local_day_bounds_utc(date);
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn test_midnight_shift_applies_only_to_marked_articles() {
        let published = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let shifted = shift_midnight_publish_time(published, true, 2);
        assert_eq!(shifted, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());

        let untouched = shift_midnight_publish_time(published, false, 2);
        assert_eq!(untouched, published);

        let zero_shift = shift_midnight_publish_time(published, true, 0);
        assert_eq!(zero_shift, published);
    }
}
