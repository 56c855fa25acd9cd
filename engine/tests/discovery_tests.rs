use chrono::{Local, NaiveDate, TimeZone, Timelike};
use partmig_engine::discovery::{day_range_millis, discover_partitions, DiscoveryRequest};
use partmig_engine::error::MigrationError;
use partmig_engine::table_types::TableTypeCode;
use sqlx::PgPool;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

// never connects; discovery validation runs before any query
fn lazy_pool() -> PgPool {
    PgPool::connect_lazy("postgres://migrator@localhost/legacy").unwrap()
}

#[test]
fn test_day_range_starts_at_local_midnight() {
    let (start_ms, end_ms) = day_range_millis(date(2024, 9, 21), date(2024, 9, 23)).unwrap();
    let start = Local.timestamp_millis_opt(start_ms).single().unwrap();
    assert_eq!(start.hour(), 0);
    assert_eq!(start.minute(), 0);
    assert_eq!(start.second(), 0);
    let end = Local.timestamp_millis_opt(end_ms).single().unwrap();
    assert_eq!(end.hour(), 23);
    assert_eq!(end.minute(), 59);
    assert_eq!(end.second(), 59);
    assert!(start_ms < end_ms);
}

#[test]
fn test_day_range_single_day_spans_one_day() {
    let (start_ms, end_ms) = day_range_millis(date(2024, 9, 21), date(2024, 9, 21)).unwrap();
    // one day minus the final millisecond; exact on non-DST days
    assert_eq!(end_ms - start_ms, 86_400_000 - 1);
}

#[tokio::test]
async fn test_empty_type_set_rejected_before_query() {
    let request = DiscoveryRequest {
        start: date(2024, 9, 21),
        end: date(2024, 9, 23),
        types: vec![],
    };
    let err = discover_partitions(&lazy_pool(), &request).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::Validation(_))
    ));
}

#[tokio::test]
async fn test_inverted_range_rejected_before_query() {
    let request = DiscoveryRequest {
        start: date(2024, 9, 23),
        end: date(2024, 9, 21),
        types: vec![TableTypeCode::Ph],
    };
    let err = discover_partitions(&lazy_pool(), &request).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::Validation(_))
    ));
}
