use partmig_engine::row_batch::{
    BatchSizer, INITIAL_BATCH_SIZE, MAX_BATCH_SIZE, MIN_BATCH_SIZE,
};
use std::time::Duration;

#[test]
fn test_initial_batch_size() {
    assert_eq!(BatchSizer::new().current(), INITIAL_BATCH_SIZE);
    assert_eq!(INITIAL_BATCH_SIZE, 100_000);
}

#[test]
fn test_fast_batches_grow_up_to_cap() {
    let mut sizer = BatchSizer::new();
    sizer.observe(Duration::from_millis(300));
    assert_eq!(sizer.current(), 150_000);
    sizer.observe(Duration::from_millis(300));
    assert_eq!(sizer.current(), 225_000);
    for _ in 0..10 {
        sizer.observe(Duration::from_millis(300));
    }
    assert_eq!(sizer.current(), MAX_BATCH_SIZE);
}

#[test]
fn test_slow_batches_halve_down_to_floor() {
    let mut sizer = BatchSizer::new();
    sizer.observe(Duration::from_secs(11));
    assert_eq!(sizer.current(), 50_000);
    for _ in 0..10 {
        sizer.observe(Duration::from_secs(11));
    }
    assert_eq!(sizer.current(), MIN_BATCH_SIZE);
}

#[test]
fn test_moderate_batches_hold_steady() {
    let mut sizer = BatchSizer::new();
    sizer.observe(Duration::from_secs(5));
    assert_eq!(sizer.current(), INITIAL_BATCH_SIZE);
}

#[test]
fn test_memory_pressure_halves() {
    let mut sizer = BatchSizer::new();
    sizer.halve();
    assert_eq!(sizer.current(), 50_000);
    for _ in 0..10 {
        sizer.halve();
    }
    assert_eq!(sizer.current(), MIN_BATCH_SIZE);
}
