use chrono::{DateTime, Duration, TimeZone, Utc};
use notedeck_core::{
    days_until_review, schedule, CoreError, Quality, ReviewState, INTERVAL_MAX_DAYS,
    INTERVAL_MIN_DAYS,
};

fn q(v: i64) -> Quality {
    Quality::new(v).unwrap()
}

fn jan1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[test]
fn interval_table() {
    let days: Vec<u32> = Quality::all().map(days_until_review).collect();
    assert_eq!(days, vec![14, 14, 11, 8, 5, 2]);
}

#[test]
fn failed_recall_waits_longest() {
    assert_eq!(days_until_review(q(0)), 14);
    assert_eq!(days_until_review(q(1)), 14);
    assert_eq!(days_until_review(q(3)), 8);
    assert_eq!(days_until_review(q(5)), 2);
}

#[test]
fn interval_is_non_increasing_in_quality() {
    let days: Vec<u32> = Quality::all().map(days_until_review).collect();
    assert!(days.windows(2).all(|w| w[0] >= w[1]));
    assert!(days
        .iter()
        .all(|d| (INTERVAL_MIN_DAYS..=INTERVAL_MAX_DAYS).contains(d)));
}

#[test]
fn worked_example() {
    let out = schedule(q(4), jan1(), 2);
    assert_eq!(out.review_count, 3);
    assert_eq!(out.last_reviewed.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    assert_eq!(
        out.next_review_date,
        Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap()
    );
}

#[test]
fn next_date_follows_last_reviewed() {
    let now = Utc::now();
    for quality in Quality::all() {
        let out = schedule(quality, now, 7);
        assert_eq!(out.review_count, 8);
        assert_eq!(out.last_reviewed, now);
        assert_eq!(
            out.next_review_date,
            out.last_reviewed + Duration::days(days_until_review(quality) as i64)
        );
        assert!(out.next_review_date - out.last_reviewed >= Duration::days(1));
    }
}

#[test]
fn repeated_calls_always_advance() {
    let mut state = ReviewState::default();
    let mut now = jan1();
    for i in 1..=4 {
        let out = state.schedule(q(2), now);
        assert_eq!(out.review_count, i);
        state = out.into();
        now += Duration::hours(1);
    }
    assert_eq!(state.review_count, 4);
}

#[test]
fn out_of_range_quality_is_rejected() {
    assert!(matches!(Quality::new(6), Err(CoreError::InvalidQuality(_))));
    assert!(matches!(Quality::new(-1), Err(CoreError::InvalidQuality(_))));
    assert!(matches!(
        Quality::from_f64(4.2),
        Err(CoreError::InvalidQuality(_))
    ));
}
