//! Speed-based write throttle.
//!
//! Writers that dirty pages while a checkpoint runs are parked so the dirty
//! set does not outgrow what the checkpoint can write before it ends.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

use super::measurement::IntervalMeasurement;
use crate::primitives::pager::{DirtyThrottle, RegionCounters};

/// Dirty ratio the throttle keeps the region under.
pub const MAX_DIRTY_RATIO: f64 = 0.75;
/// Below this dirty ratio writers are never parked.
pub const MIN_RATIO_NO_THROTTLE: f64 = 0.03;
/// First park of the checkpoint-buffer backoff.
pub const STARTING_PARK_NS: u64 = 4_000;
/// Growth factor of the checkpoint-buffer backoff.
pub const BACKOFF_RATIO: f64 = 1.05;
/// Checkpoint-buffer fill that switches to exponential backoff.
pub const CP_BUFFER_DANGER: f64 = 2.0 / 3.0;
/// Throttle weight above which a warning is logged.
pub const WARN_THRESHOLD: f64 = 0.2;
/// Minimum time between two warnings of one region.
pub const WARN_PERIOD: Duration = Duration::from_secs(10);
const MAX_PARK_NS: u64 = 10_000_000_000;
const MEASURE_INTERVAL: Duration = Duration::from_millis(250);
const MEASURE_INTERVALS: usize = 3;

/// Write progress of the running checkpoint, shared with every throttle.
#[derive(Debug, Default)]
pub struct WriteProgress {
    running: AtomicBool,
    total: AtomicU64,
    written: AtomicU64,
}

impl WriteProgress {
    /// Creates an idle progress tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts tracking a checkpoint of `total` pages.
    pub fn begin(&self, total: u64) {
        self.written.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    /// Counts one written page.
    pub fn page_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Stops tracking.
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether a checkpoint is writing pages.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Pages written so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Pages the checkpoint has to write.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Snapshot of a throttle for stats output.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ThrottleStats {
    pub region: String,
    pub parked_threads: usize,
    pub parks: u64,
    pub parked_ns: u64,
    pub warnings: u64,
    pub throttle_weight: f64,
    pub speed_for_mark_all: u64,
    pub target_dirty_ratio: f64,
    pub backoff_step: u32,
}

#[derive(Default)]
struct ParkState {
    epoch: u64,
    parked: usize,
}

/// Throttle of one region; installed into its [`crate::primitives::pager::PageMemory`].
pub struct SpeedBasedThrottle {
    region: String,
    counters: Arc<RegionCounters>,
    progress: Arc<WriteProgress>,
    mark_speed: IntervalMeasurement,
    cp_speed: IntervalMeasurement,
    marked: AtomicU64,
    backoff: AtomicU32,
    init_ratio_bits: AtomicU64,
    speed_for_mark_all: AtomicU64,
    target_ratio_bits: AtomicU64,
    park: Mutex<ParkState>,
    wakeup: Condvar,
    last_warning: Mutex<Option<Instant>>,
    parks: AtomicU64,
    parked_ns: AtomicU64,
    warnings: AtomicU64,
}

impl SpeedBasedThrottle {
    /// Creates a throttle reading region fill from `counters` and checkpoint
    /// progress from `progress`.
    pub fn new(region: impl Into<String>, counters: Arc<RegionCounters>, progress: Arc<WriteProgress>) -> Arc<Self> {
        Arc::new(Self {
            region: region.into(),
            counters,
            progress,
            mark_speed: IntervalMeasurement::new(MEASURE_INTERVAL, MEASURE_INTERVALS),
            cp_speed: IntervalMeasurement::new(MEASURE_INTERVAL, MEASURE_INTERVALS),
            marked: AtomicU64::new(0),
            backoff: AtomicU32::new(0),
            init_ratio_bits: AtomicU64::new(0f64.to_bits()),
            speed_for_mark_all: AtomicU64::new(0),
            target_ratio_bits: AtomicU64::new(0f64.to_bits()),
            park: Mutex::new(ParkState::default()),
            wakeup: Condvar::new(),
            last_warning: Mutex::new(None),
            parks: AtomicU64::new(0),
            parked_ns: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
        })
    }

    /// Region this throttle guards.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Park duration in nanoseconds for one mark-dirty event.
    ///
    /// `written` and `cp_total` are the running checkpoint's written and total
    /// pages, `threads` the number of writers competing, `mark_speed` and
    /// `cp_speed` pages per second.
    pub fn get_park_time(
        &self,
        dirty_ratio: f64,
        written: u64,
        cp_total: u64,
        threads: usize,
        mark_speed: u64,
        cp_speed: u64,
    ) -> u64 {
        let sfm = self.speed_to_mark_all(dirty_ratio, written, cp_speed, cp_total);
        let target = self.target_dirty_ratio(written, cp_total);
        self.speed_for_mark_all.store(sfm, Ordering::Relaxed);
        self.target_ratio_bits.store(target.to_bits(), Ordering::Relaxed);

        let low_space = dirty_ratio > target && dirty_ratio + 0.05 > MAX_DIRTY_RATIO;
        let slowdown = if low_space { 3 } else { 1 };
        let sfm_multiplier = if low_space { 0.8 } else { 1.0 };

        let marking_too_fast = sfm > 0 && mark_speed as f64 > sfm_multiplier * sfm as f64;
        let by_size = dirty_ratio > target && marking_too_fast;

        let allow_faster = if sfm > 0 && mark_speed > 0 && sfm > mark_speed {
            0.1 * sfm as f64 / mark_speed as f64
        } else if dirty_ratio > target {
            0.0
        } else {
            0.1
        };
        let faster_than_cp = if low_space { 1.0 } else { 1.0 + allow_faster };
        let by_cp_speed = cp_speed > 0 && mark_speed as f64 > faster_than_cp * cp_speed as f64;

        let by_cp = if by_cp_speed { delay_ns(cp_speed, threads, slowdown) } else { 0 };
        let by_mark_all = if by_size { delay_ns(sfm, threads, slowdown) } else { 0 };
        by_cp.max(by_mark_all)
    }

    fn speed_to_mark_all(&self, dirty_ratio: f64, written: u64, cp_speed: u64, cp_total: u64) -> u64 {
        if cp_speed == 0 || cp_total == 0 || dirty_ratio >= MAX_DIRTY_RATIO {
            return 0;
        }
        let remaining_clean = (MAX_DIRTY_RATIO - dirty_ratio) * self.counters.total_pages() as f64;
        let seconds_left = cp_total.saturating_sub(written) as f64 / cp_speed as f64;
        if seconds_left <= 0.0 {
            return 0;
        }
        (remaining_clean / seconds_left) as u64
    }

    fn target_dirty_ratio(&self, written: u64, cp_total: u64) -> f64 {
        let progress = if cp_total == 0 { 0.0 } else { written as f64 / cp_total as f64 };
        let start = f64::from_bits(self.init_ratio_bits.load(Ordering::Relaxed));
        (progress * (1.0 - start) + start) * MAX_DIRTY_RATIO
    }

    fn backoff_park(&self) -> u64 {
        let step = self.backoff.fetch_add(1, Ordering::Relaxed);
        let park = STARTING_PARK_NS as f64 * BACKOFF_RATIO.powi(step.min(i32::MAX as u32) as i32);
        if park.is_finite() {
            (park as u64).min(MAX_PARK_NS)
        } else {
            MAX_PARK_NS
        }
    }

    /// Ratio of average park time to the time one page mark takes at the
    /// current mark speed.
    pub fn throttle_weight(&self) -> f64 {
        let speed = self.mark_speed.speed_ops_per_sec(Instant::now());
        if speed == 0 {
            return 0.0;
        }
        let per_page = delay_ns(speed, self.parked_threads().max(1), 1);
        if per_page == 0 {
            return 0.0;
        }
        self.mark_speed.average() as f64 / per_page as f64
    }

    /// Threads currently parked by this throttle.
    pub fn parked_threads(&self) -> usize {
        self.park.lock().parked
    }

    /// Parks the caller for `duration` or until the running checkpoint finishes.
    pub fn park(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut state = self.park.lock();
        let epoch = state.epoch;
        state.parked += 1;
        while state.epoch == epoch {
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.parked -= 1;
    }

    /// Called under the checkpoint write lock before the dirty set is captured.
    pub fn on_begin_checkpoint(&self) {
        let ratio = self.counters.dirty_ratio().min(MAX_DIRTY_RATIO);
        self.init_ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
        self.marked.store(0, Ordering::Relaxed);
        self.backoff.store(0, Ordering::Relaxed);
        self.mark_speed.reset();
        self.cp_speed.reset();
    }

    /// Ends throttling for the finished checkpoint and wakes every parked thread.
    pub fn on_finish_checkpoint(&self) {
        self.backoff.store(0, Ordering::Relaxed);
        self.mark_speed.reset();
        self.cp_speed.reset();
        let woken = {
            let mut state = self.park.lock();
            state.epoch += 1;
            state.parked
        };
        self.wakeup.notify_all();
        debug!(region = %self.region, woken, "throttle.wakeup");
    }

    fn record_park(&self, park_ns: u64) {
        self.parks.fetch_add(1, Ordering::Relaxed);
        self.parked_ns.fetch_add(park_ns, Ordering::Relaxed);
        self.mark_speed.add_measurement(park_ns);
        let weight = self.throttle_weight();
        if weight <= WARN_THRESHOLD {
            return;
        }
        let mut last = self.last_warning.lock();
        if last.is_some_and(|at| at.elapsed() < WARN_PERIOD) {
            return;
        }
        *last = Some(Instant::now());
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!(
            region = %self.region,
            weight,
            park_ns,
            speed_for_mark_all = self.speed_for_mark_all.load(Ordering::Relaxed),
            "throttle.warning"
        );
    }

    /// Current statistics.
    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            region: self.region.clone(),
            parked_threads: self.parked_threads(),
            parks: self.parks.load(Ordering::Relaxed),
            parked_ns: self.parked_ns.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            throttle_weight: self.throttle_weight(),
            speed_for_mark_all: self.speed_for_mark_all.load(Ordering::Relaxed),
            target_dirty_ratio: f64::from_bits(self.target_ratio_bits.load(Ordering::Relaxed)),
            backoff_step: self.backoff.load(Ordering::Relaxed),
        }
    }
}

impl DirtyThrottle for SpeedBasedThrottle {
    fn on_mark_dirty(&self, page_in_checkpoint: bool) {
        if !self.progress.is_running() {
            return;
        }
        let now = Instant::now();
        let marked = self.marked.fetch_add(1, Ordering::Relaxed) + 1;
        self.mark_speed.set_counter(marked, now);
        let park_ns = if page_in_checkpoint && self.counters.cp_buffer_fill() > CP_BUFFER_DANGER {
            self.backoff_park()
        } else {
            if page_in_checkpoint {
                self.backoff.store(0, Ordering::Relaxed);
            }
            let written = self.progress.written();
            self.cp_speed.set_counter(written, now);
            let ratio = self.counters.dirty_ratio();
            if !(MIN_RATIO_NO_THROTTLE..MAX_DIRTY_RATIO).contains(&ratio) {
                0
            } else {
                self.get_park_time(
                    ratio,
                    written,
                    self.progress.total(),
                    self.parked_threads() + 1,
                    self.mark_speed.speed_ops_per_sec(now),
                    self.cp_speed.speed_ops_per_sec(now),
                )
            }
        };
        if park_ns > 0 {
            self.record_park(park_ns);
            self.park(Duration::from_nanos(park_ns));
        }
    }
}

fn delay_ns(base_speed: u64, threads: usize, coefficient: u64) -> u64 {
    if base_speed == 0 || coefficient == 0 {
        return 0;
    }
    coefficient * (1_000_000_000 * threads.max(1) as u64 / base_speed)
}
