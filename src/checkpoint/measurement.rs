use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug)]
struct Interval {
    start: Instant,
    last_update: Instant,
    counter_start: Option<u64>,
    counter_last: u64,
    sum: u64,
    samples: u64,
}

impl Interval {
    fn new(start: Instant, counter_start: Option<u64>) -> Self {
        Self {
            start,
            last_update: start,
            counter_start,
            counter_last: counter_start.unwrap_or(0),
            sum: 0,
            samples: 0,
        }
    }
}

/// Rolling speed and average over the last few fixed-length intervals.
///
/// A counter set through [`IntervalMeasurement::set_counter`] yields an
/// operations-per-second speed; values added through
/// [`IntervalMeasurement::add_measurement`] yield an average. Both read as zero
/// once nothing was recorded for `interval * max_intervals`.
pub struct IntervalMeasurement {
    interval: Duration,
    max_intervals: usize,
    intervals: Mutex<VecDeque<Interval>>,
}

impl IntervalMeasurement {
    /// Creates a measurement keeping at most `max_intervals` intervals of length `interval`.
    pub fn new(interval: Duration, max_intervals: usize) -> Self {
        Self {
            interval,
            max_intervals: max_intervals.max(1),
            intervals: Mutex::new(VecDeque::new()),
        }
    }

    fn window(&self) -> Duration {
        self.interval * self.max_intervals as u32
    }

    fn current<'a>(&self, intervals: &'a mut VecDeque<Interval>, now: Instant) -> &'a mut Interval {
        let roll = match intervals.back() {
            None => true,
            Some(last) => now.saturating_duration_since(last.start) >= self.interval,
        };
        if roll {
            let carried = intervals
                .back()
                .filter(|last| now.saturating_duration_since(last.last_update) < self.window())
                .and_then(|last| last.counter_start.map(|_| last.counter_last));
            if intervals.back().is_some_and(|last| now.saturating_duration_since(last.last_update) >= self.window()) {
                intervals.clear();
            }
            intervals.push_back(Interval::new(now, carried));
            while intervals.len() > self.max_intervals {
                intervals.pop_front();
            }
        }
        let current = intervals.back_mut().expect("interval pushed above");
        current.last_update = now;
        current
    }

    /// Records the current value of a monotonic counter.
    pub fn set_counter(&self, value: u64, now: Instant) {
        let mut intervals = self.intervals.lock();
        let current = self.current(&mut intervals, now);
        if current.counter_start.is_none() {
            current.counter_start = Some(value);
        }
        current.counter_last = value.max(current.counter_start.unwrap_or(value));
    }

    /// Adds one sample to the average.
    pub fn add_measurement(&self, value: u64) {
        let mut intervals = self.intervals.lock();
        let current = self.current(&mut intervals, Instant::now());
        current.sum = current.sum.saturating_add(value);
        current.samples += 1;
    }

    fn fresh(&self, intervals: &VecDeque<Interval>, now: Instant) -> bool {
        intervals
            .back()
            .is_some_and(|last| now.saturating_duration_since(last.last_update) < self.window())
    }

    /// Counter increments per second over the kept intervals.
    pub fn speed_ops_per_sec(&self, now: Instant) -> u64 {
        let intervals = self.intervals.lock();
        if !self.fresh(&intervals, now) {
            return 0;
        }
        let mut ops = 0u64;
        let mut first: Option<Instant> = None;
        for interval in intervals.iter() {
            if let Some(start) = interval.counter_start {
                ops += interval.counter_last.saturating_sub(start);
                first.get_or_insert(interval.start);
            }
        }
        let Some(first) = first else {
            return 0;
        };
        let nanos = now.saturating_duration_since(first).as_nanos().max(1);
        (u128::from(ops) * 1_000_000_000 / nanos).min(u128::from(u64::MAX)) as u64
    }

    /// Average of the samples in the kept intervals.
    pub fn average(&self) -> u64 {
        let intervals = self.intervals.lock();
        if !self.fresh(&intervals, Instant::now()) {
            return 0;
        }
        let (sum, samples) = intervals
            .iter()
            .fold((0u64, 0u64), |(s, n), i| (s.saturating_add(i.sum), n + i.samples));
        if samples == 0 {
            0
        } else {
            sum / samples
        }
    }

    /// Drops every interval.
    pub fn reset(&self) {
        self.intervals.lock().clear();
    }
}
