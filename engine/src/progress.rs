use crate::bus::Progress;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const EMIT_INTERVAL: Duration = Duration::from_secs(1);
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// 5-sample exponential moving average used for rate smoothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateEma {
    value: Option<f64>,
}

impl RateEma {
    // alpha = 2 / (window + 1) with a 5-sample window
    const ALPHA: f64 = 2.0 / 6.0;

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => prev + Self::ALPHA * (sample - prev),
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Accumulates per-partition and per-run counters and publishes rate-limited
/// snapshots on the progress watch channel.
///
/// Rates are sampled at 1 Hz; snapshots go out at most once per second plus
/// one forced emission at every partition boundary, so consecutive events
/// always carry non-decreasing totals.
pub struct ProgressTracker {
    sender: watch::Sender<Option<Progress>>,
    partition_count: usize,
    expected_total_rows: i64,
    partition_index: usize,
    partition_name: String,
    partition_rows: i64,
    rows_before_partition: i64,
    total_bytes: i64,
    rows_ema: RateEma,
    bytes_ema: RateEma,
    last_sample: Instant,
    rows_at_sample: i64,
    bytes_at_sample: i64,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(
        sender: watch::Sender<Option<Progress>>,
        partition_count: usize,
        expected_total_rows: i64,
    ) -> Self {
        let now = Instant::now();
        Self {
            sender,
            partition_count,
            expected_total_rows,
            partition_index: 0,
            partition_name: String::new(),
            partition_rows: 0,
            rows_before_partition: 0,
            total_bytes: 0,
            rows_ema: RateEma::default(),
            bytes_ema: RateEma::default(),
            last_sample: now,
            rows_at_sample: 0,
            bytes_at_sample: 0,
            last_emit: None,
        }
    }

    pub fn total_rows(&self) -> i64 {
        self.rows_before_partition + self.partition_rows
    }

    /// Rolls the counters over to a new partition and emits a boundary
    /// snapshot.
    pub fn begin_partition(&mut self, index: usize, name: &str) {
        self.rows_before_partition += self.partition_rows;
        self.partition_rows = 0;
        self.partition_index = index;
        self.partition_name = name.to_string();
        self.emit();
    }

    /// Accounts copied rows and bytes; samples rates and emits when the
    /// 1 s intervals have elapsed.
    pub fn record(&mut self, rows_delta: i64, bytes_delta: i64) {
        self.partition_rows += rows_delta;
        self.total_bytes += bytes_delta;
        let elapsed = self.last_sample.elapsed();
        if elapsed >= SAMPLE_INTERVAL {
            let seconds = elapsed.as_secs_f64();
            let rows_rate = (self.total_rows() - self.rows_at_sample) as f64 / seconds;
            let bytes_rate = (self.total_bytes - self.bytes_at_sample) as f64 / seconds;
            self.rows_ema.update(rows_rate);
            self.bytes_ema.update(bytes_rate);
            self.last_sample = Instant::now();
            self.rows_at_sample = self.total_rows();
            self.bytes_at_sample = self.total_bytes;
        }
        let due = match self.last_emit {
            None => true,
            Some(at) => at.elapsed() >= EMIT_INTERVAL,
        };
        if due {
            self.emit();
        }
    }

    /// Forces a snapshot at a partition boundary.
    pub fn finish_partition(&mut self) {
        self.emit();
    }

    fn emit(&mut self) {
        let total_rows = self.total_rows();
        let remaining = (self.expected_total_rows - total_rows).max(0);
        let eta_seconds = (remaining as f64 / self.rows_ema.value().max(1.0)).round() as i64;
        let snapshot = Progress {
            partition_index: self.partition_index,
            partition_count: self.partition_count,
            partition_name: self.partition_name.clone(),
            partition_rows: self.partition_rows,
            total_rows,
            rows_per_sec: self.rows_ema.value(),
            mb_per_sec: self.bytes_ema.value() / BYTES_PER_MB,
            eta_seconds,
            timestamp: Utc::now(),
        };
        self.last_emit = Some(Instant::now());
        let _ = self.sender.send(Some(snapshot));
    }
}
