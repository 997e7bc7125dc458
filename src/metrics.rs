//! Per-filter monitoring metrics.
//!
//! Buffer health, byte-rate, status parsing, and bounded metric
//! history for filters under active monitoring. Everything in this
//! module is synchronous and clock-free: callers pass timestamps in
//! (a monotonic [`Instant`] for throttling, wall-clock milliseconds
//! for history), so the session task owns the clock and tests can
//! drive time explicitly.
//!
//! Real-time emissions are throttled per filter to one per window
//! with leading and trailing edges: the first sample in a quiet
//! period emits immediately, samples arriving inside the window are
//! coalesced into one trailing emission at the window boundary. A
//! sample with `bytes_done == 0` still consumes the window but emits
//! nothing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

use crate::protocol::{FilterId, FilterSnapshot};

/// Default bound on per-filter metric history.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Default real-time emission window per filter.
pub const DEFAULT_METRICS_WINDOW: Duration = Duration::from_secs(1);

/// Occupancy below this percentage reads as underrun risk.
const LOW_WATERMARK: f64 = 20.0;

/// Occupancy above this percentage reads as backpressure.
const HIGH_WATERMARK: f64 = 80.0;

/// FPS readings closer than this are considered unchanged.
const FPS_TREND_EPSILON: f64 = 0.1;

static FPS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)\s*FPS").expect("fps pattern"));
static RESOLUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)x(\d+)").expect("resolution pattern"));
static LATENCY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)\s*ms").expect("latency pattern"));

/// Qualitative read of a pin buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    /// Capacity ≤ 0: dynamically sized, occupancy is informational only.
    Dynamic,
    /// Below the low watermark; the consumer may starve.
    Low,
    /// Between the watermarks.
    Normal,
    /// Above the high watermark; upstream is outpacing downstream.
    High,
}

/// Occupancy snapshot of one pin buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferGauge {
    /// Raw occupancy as reported.
    pub occupancy: i64,
    /// Raw capacity as reported; ≤ 0 means dynamically sized.
    pub capacity: i64,
    /// Fill percentage clamped to `[0, 100]`. `None` for dynamic buffers.
    pub percent: Option<f64>,
    /// Health band derived from `percent`.
    pub health: BufferHealth,
}

impl BufferGauge {
    pub fn new(occupancy: i64, capacity: i64) -> Self {
        if capacity <= 0 {
            return Self {
                occupancy,
                capacity,
                percent: None,
                health: BufferHealth::Dynamic,
            };
        }
        let percent = (occupancy as f64 / capacity as f64 * 100.0).clamp(0.0, 100.0);
        let health = if percent < LOW_WATERMARK {
            BufferHealth::Low
        } else if percent > HIGH_WATERMARK {
            BufferHealth::High
        } else {
            BufferHealth::Normal
        };
        Self {
            occupancy,
            capacity,
            percent: Some(percent),
            health,
        }
    }
}

/// Direction of change between consecutive FPS readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl Trend {
    fn classify(current: Option<f64>, previous: Option<f64>) -> Self {
        match (current, previous) {
            (Some(current), Some(previous)) if current > previous + FPS_TREND_EPSILON => Trend::Up,
            (Some(current), Some(previous)) if current < previous - FPS_TREND_EPSILON => {
                Trend::Down
            }
            _ => Trend::Flat,
        }
    }
}

/// FPS reading parsed from the filter status line, with its trend
/// relative to the previous reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FpsStats {
    pub current: Option<f64>,
    pub trend: Trend,
}

/// Per-pin buffer analysis for one filter, refreshed on every detail
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinBufferReport {
    /// Input pins by name.
    pub input: BTreeMap<String, BufferGauge>,
    /// Output pins by name.
    pub output: BTreeMap<String, BufferGauge>,
    /// FPS extracted from the status line, if it carried one.
    pub fps: FpsStats,
    /// Latency in milliseconds extracted from the status line.
    pub latency_ms: Option<f64>,
}

/// One point of metric history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterMetric {
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub bytes_done: u64,
    pub packets_sent: u64,
    pub packets_done: u64,
}

/// Rolling two-point byte counter for rate estimation.
///
/// The previous/current pair only advances when the byte count
/// actually changes; repeated identical samples therefore never
/// flatten the rate toward zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeMetrics {
    pub current_bytes: u64,
    pub previous_bytes: u64,
    /// Wall-clock milliseconds of the current reading.
    pub last_update_ms: i64,
    /// Wall-clock milliseconds of the previous reading.
    pub previous_update_ms: i64,
    /// First input pin occupancy at the last emission.
    pub buffer: i64,
    /// First input pin capacity at the last emission.
    pub buffer_total: i64,
}

impl RealtimeMetrics {
    fn first(sample: &MetricsSample, now_ms: i64) -> Self {
        let (buffer, buffer_total) = sample.buffer.unwrap_or((0, 0));
        Self {
            current_bytes: sample.bytes_done,
            previous_bytes: 0,
            last_update_ms: now_ms,
            previous_update_ms: now_ms,
            buffer,
            buffer_total,
        }
    }

    fn update(&mut self, sample: &MetricsSample, now_ms: i64) {
        if sample.bytes_done != self.current_bytes {
            self.previous_bytes = self.current_bytes;
            self.previous_update_ms = self.last_update_ms;
            self.current_bytes = sample.bytes_done;
            self.last_update_ms = now_ms;
        }
        if let Some((buffer, buffer_total)) = sample.buffer {
            self.buffer = buffer;
            self.buffer_total = buffer_total;
        }
    }

    /// Bytes per second over the previous/current pair. Zero when no
    /// time has elapsed or the counter went backwards.
    pub fn byte_rate(&self) -> f64 {
        let elapsed_ms = self.last_update_ms - self.previous_update_ms;
        if elapsed_ms <= 0 {
            return 0.0;
        }
        let delta = self.current_bytes as f64 - self.previous_bytes as f64;
        (delta / (elapsed_ms as f64 / 1000.0)).max(0.0)
    }
}

/// Numeric readings extracted from a filter status line.
#[derive(Debug, Clone, PartialEq, Default)]
struct StatusReadings {
    fps: Option<f64>,
    resolution: Option<(u64, u64)>,
    latency_ms: Option<f64>,
}

fn parse_status(status: &str) -> StatusReadings {
    StatusReadings {
        fps: capture_number(&FPS_PATTERN, status),
        resolution: RESOLUTION_PATTERN.captures(status).and_then(|captures| {
            let width = captures.get(1)?.as_str().parse().ok()?;
            let height = captures.get(2)?.as_str().parse().ok()?;
            Some((width, height))
        }),
        latency_ms: capture_number(&LATENCY_PATTERN, status),
    }
}

fn capture_number(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Sample fed to the real-time throttle: cumulative bytes plus the
/// first input pin's buffer state, when the filter has input pins.
#[derive(Debug, Clone, PartialEq)]
struct MetricsSample {
    bytes_done: u64,
    buffer: Option<(i64, i64)>,
}

impl MetricsSample {
    fn from_snapshot(filter: &FilterSnapshot) -> Self {
        Self {
            bytes_done: filter.bytes_done,
            buffer: filter
                .first_input_pin()
                .map(|(_, pin)| (pin.buffer, pin.buffer_total)),
        }
    }
}

/// Per-filter throttle state: when the window last opened, and the
/// sample waiting for the trailing edge.
#[derive(Debug)]
struct ThrottleState {
    last_emit: Instant,
    pending: Option<MetricsSample>,
}

/// All monitoring state for subscribed filters.
///
/// Owned by the session task; queries reach it through the shared
/// view state.
#[derive(Debug)]
pub struct MetricsEngine {
    max_history: usize,
    window: Duration,
    history: HashMap<FilterId, VecDeque<FilterMetric>>,
    buffer_stats: HashMap<FilterId, PinBufferReport>,
    realtime: HashMap<FilterId, RealtimeMetrics>,
    throttle: HashMap<FilterId, ThrottleState>,
}

impl MetricsEngine {
    pub fn new(max_history: usize, window: Duration) -> Self {
        Self {
            max_history,
            window,
            history: HashMap::new(),
            buffer_stats: HashMap::new(),
            realtime: HashMap::new(),
            throttle: HashMap::new(),
        }
    }

    /// Ingest a detail payload for a monitored filter.
    ///
    /// Refreshes buffer stats, appends to history, and offers a sample
    /// to the real-time throttle. Returns the updated real-time
    /// metrics when this sample passes the leading edge and carries a
    /// non-zero byte count; deferred samples surface later through
    /// [`MetricsEngine::flush_due`].
    pub fn record_detail(
        &mut self,
        filter: &FilterSnapshot,
        now: Instant,
        now_ms: i64,
    ) -> Option<RealtimeMetrics> {
        self.update_buffer_stats(filter);
        self.append_history(filter, now_ms);

        let sample = MetricsSample::from_snapshot(filter);
        match self.throttle.get_mut(&filter.idx) {
            None => {
                self.throttle.insert(
                    filter.idx,
                    ThrottleState {
                        last_emit: now,
                        pending: None,
                    },
                );
                self.apply_sample(filter.idx, &sample, now_ms)
            }
            Some(state) if now >= state.last_emit + self.window => {
                state.last_emit = now;
                state.pending = None;
                self.apply_sample(filter.idx, &sample, now_ms)
            }
            Some(state) => {
                state.pending = Some(sample);
                None
            }
        }
    }

    /// Earliest instant at which a deferred sample becomes due.
    pub fn pending_deadline(&self) -> Option<Instant> {
        self.throttle
            .values()
            .filter(|state| state.pending.is_some())
            .map(|state| state.last_emit + self.window)
            .min()
    }

    /// Emit every deferred sample whose window has elapsed.
    pub fn flush_due(&mut self, now: Instant, now_ms: i64) -> Vec<(FilterId, RealtimeMetrics)> {
        let window = self.window;
        let due: Vec<(FilterId, MetricsSample)> = self
            .throttle
            .iter_mut()
            .filter(|(_, state)| state.pending.is_some() && now >= state.last_emit + window)
            .filter_map(|(id, state)| {
                state.last_emit = now;
                state.pending.take().map(|sample| (*id, sample))
            })
            .collect();

        due.into_iter()
            .filter_map(|(id, sample)| {
                self.apply_sample(id, &sample, now_ms)
                    .map(|metrics| (id, metrics))
            })
            .collect()
    }

    /// Metric history for one filter, oldest first.
    pub fn history(&self, id: FilterId) -> Vec<FilterMetric> {
        self.history
            .get(&id)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest per-pin buffer analysis for one filter.
    pub fn buffer_report(&self, id: FilterId) -> Option<&PinBufferReport> {
        self.buffer_stats.get(&id)
    }

    /// Latest real-time byte counters for one filter.
    pub fn realtime(&self, id: FilterId) -> Option<&RealtimeMetrics> {
        self.realtime.get(&id)
    }

    /// Estimated processing rate in bytes per second.
    ///
    /// Prefers the status line when it carries both an FPS figure and
    /// a resolution (uncompressed estimate at 1.5 bytes per pixel),
    /// otherwise falls back to the measured byte-rate.
    pub fn processing_rate(&self, id: FilterId, status: Option<&str>) -> f64 {
        if let Some(status) = status {
            let readings = parse_status(status);
            if let (Some(fps), Some((width, height))) = (readings.fps, readings.resolution) {
                return fps * width as f64 * height as f64 * 1.5;
            }
        }
        self.realtime
            .get(&id)
            .map(RealtimeMetrics::byte_rate)
            .unwrap_or(0.0)
    }

    /// Re-bound history, keeping the most recent points.
    pub fn set_max_history(&mut self, max_history: usize) {
        self.max_history = max_history;
        for points in self.history.values_mut() {
            while points.len() > max_history {
                points.pop_front();
            }
        }
    }

    /// Drop all state held for one filter.
    pub fn remove_filter(&mut self, id: FilterId) {
        self.history.remove(&id);
        self.buffer_stats.remove(&id);
        self.realtime.remove(&id);
        self.throttle.remove(&id);
    }

    fn update_buffer_stats(&mut self, filter: &FilterSnapshot) {
        let input = filter
            .ipid
            .iter()
            .map(|(name, pin)| (name.clone(), BufferGauge::new(pin.buffer, pin.buffer_total)))
            .collect();
        let output = filter
            .opid
            .iter()
            .map(|(name, pin)| (name.clone(), BufferGauge::new(pin.buffer, pin.buffer_total)))
            .collect();

        let readings = parse_status(filter.status.as_deref().unwrap_or(""));
        let previous_fps = self
            .buffer_stats
            .get(&filter.idx)
            .and_then(|report| report.fps.current);

        self.buffer_stats.insert(
            filter.idx,
            PinBufferReport {
                input,
                output,
                fps: FpsStats {
                    current: readings.fps,
                    trend: Trend::classify(readings.fps, previous_fps),
                },
                latency_ms: readings.latency_ms,
            },
        );
    }

    fn append_history(&mut self, filter: &FilterSnapshot, now_ms: i64) {
        let points = self.history.entry(filter.idx).or_default();
        points.push_back(FilterMetric {
            timestamp_ms: now_ms,
            bytes_done: filter.bytes_done,
            packets_sent: filter.packets_sent,
            packets_done: filter.packets_done,
        });
        while points.len() > self.max_history {
            points.pop_front();
        }
    }

    /// The gate lives inside the emission: a zero-byte sample has
    /// already consumed the throttle window by the time it is dropped
    /// here.
    fn apply_sample(
        &mut self,
        id: FilterId,
        sample: &MetricsSample,
        now_ms: i64,
    ) -> Option<RealtimeMetrics> {
        if sample.bytes_done == 0 {
            return None;
        }
        let metrics = self
            .realtime
            .entry(id)
            .and_modify(|metrics| metrics.update(sample, now_ms))
            .or_insert_with(|| RealtimeMetrics::first(sample, now_ms));
        Some(metrics.clone())
    }
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY, DEFAULT_METRICS_WINDOW)
    }
}
