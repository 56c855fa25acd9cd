use partmig_engine::progress::{ProgressTracker, RateEma};
use tokio::sync::watch;

#[test]
fn test_ema_first_sample_passes_through() {
    let mut ema = RateEma::default();
    assert_eq!(ema.value(), 0.0);
    assert!((ema.update(120.0) - 120.0).abs() < f64::EPSILON);
}

#[test]
fn test_ema_smooths_with_one_third_weight() {
    let mut ema = RateEma::default();
    ema.update(10.0);
    let next = ema.update(20.0);
    // 10 + (2/6) * (20 - 10)
    assert!((next - 13.333_333).abs() < 1e-3, "got {next}");
    assert!((ema.value() - next).abs() < f64::EPSILON);
}

#[test]
fn test_ema_converges_on_constant_input() {
    let mut ema = RateEma::default();
    for _ in 0..50 {
        ema.update(500.0);
    }
    assert!((ema.value() - 500.0).abs() < 1e-6);
}

#[test]
fn test_tracker_emits_boundary_snapshots() {
    let (tx, rx) = watch::channel(None);
    let mut tracker = ProgressTracker::new(tx, 3, 300);

    tracker.begin_partition(0, "point_history_240921");
    let snapshot = rx.borrow().clone().expect("boundary snapshot");
    assert_eq!(snapshot.partition_index, 0);
    assert_eq!(snapshot.partition_count, 3);
    assert_eq!(snapshot.partition_name, "point_history_240921");
    assert_eq!(snapshot.total_rows, 0);
}

#[test]
fn test_tracker_totals_are_monotone() {
    let (tx, rx) = watch::channel(None);
    let mut tracker = ProgressTracker::new(tx, 2, 200);

    let mut last_total = -1i64;
    let mut last_ts = None;
    let mut check = |rx: &watch::Receiver<Option<partmig_engine::bus::Progress>>| {
        let snapshot = rx.borrow().clone().expect("snapshot");
        assert!(snapshot.total_rows >= last_total);
        if let Some(ts) = last_ts {
            assert!(snapshot.timestamp >= ts);
        }
        last_total = snapshot.total_rows;
        last_ts = Some(snapshot.timestamp);
    };

    tracker.begin_partition(0, "a");
    check(&rx);
    tracker.record(100, 1_000);
    tracker.finish_partition();
    check(&rx);
    tracker.begin_partition(1, "b");
    check(&rx);
    tracker.record(100, 1_000);
    tracker.finish_partition();
    check(&rx);
    assert_eq!(tracker.total_rows(), 200);
}

#[test]
fn test_rows_accumulate_across_partitions() {
    let (tx, _rx) = watch::channel(None);
    let mut tracker = ProgressTracker::new(tx, 2, 0);
    tracker.begin_partition(0, "a");
    tracker.record(86_400, 0);
    assert_eq!(tracker.total_rows(), 86_400);
    tracker.begin_partition(1, "b");
    tracker.record(86_400, 0);
    assert_eq!(tracker.total_rows(), 172_800);
}

#[test]
fn test_eta_guard_divides_by_at_least_one() {
    let (tx, rx) = watch::channel(None);
    let mut tracker = ProgressTracker::new(tx, 1, 1_000);
    // no rate samples yet; the guard keeps the division finite
    tracker.begin_partition(0, "a");
    let snapshot = rx.borrow().clone().unwrap();
    assert_eq!(snapshot.eta_seconds, 1_000);
}

#[test]
fn test_eta_never_negative() {
    let (tx, rx) = watch::channel(None);
    let mut tracker = ProgressTracker::new(tx, 1, 100);
    tracker.begin_partition(0, "a");
    // more rows arrived than the estimate promised
    tracker.record(250, 0);
    tracker.finish_partition();
    let snapshot = rx.borrow().clone().unwrap();
    assert!(snapshot.eta_seconds >= 0);
    assert_eq!(snapshot.total_rows, 250);
}
