//! Throughput sampling and heap-limit growth heuristics.
//!
//! The controller samples mutator allocation throughput between collections
//! and marking throughput inside them, feeds both into a bounded-window
//! growing-factor model when limits are recomputed after full traces, and
//! tracks the young-generation survival rate that decides early full-mark
//! requests. All numeric constants here are tuning parameters, not protocol
//! invariants; the bounds come from [`HeapConfig`](crate::HeapConfig).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Throughput samples kept per series.
const SPEED_SAMPLE_WINDOW: usize = 10;

#[derive(Clone, Copy)]
struct Sample {
    bytes: f64,
    millis: f64,
}

pub struct MemController {
    alloc_samples: VecDeque<Sample>,
    mark_samples: VecDeque<Sample>,
    survival_rates: VecDeque<f64>,
    survival_window: usize,
    mutator_phase_start: Option<Instant>,
    gc_start: Option<Instant>,
}

impl MemController {
    #[must_use]
    pub fn new(survival_window: usize) -> Self {
        Self {
            alloc_samples: VecDeque::new(),
            mark_samples: VecDeque::new(),
            survival_rates: VecDeque::new(),
            survival_window,
            mutator_phase_start: Some(Instant::now()),
            gc_start: None,
        }
    }

    /// Closes the current mutator phase, turning the bytes it allocated into
    /// an allocation-throughput sample, and starts the GC clock.
    pub fn start_calculation_before_gc(&mut self, allocated_bytes: usize) {
        if let Some(start) = self.mutator_phase_start.take() {
            let millis = duration_ms(start.elapsed());
            if millis > 0.0 && allocated_bytes > 0 {
                push_sample(
                    &mut self.alloc_samples,
                    Sample {
                        bytes: allocated_bytes as f64,
                        millis,
                    },
                );
            }
        }
        self.gc_start = Some(Instant::now());
    }

    /// Ends the GC clock and reopens the mutator phase. Returns the pause.
    pub fn stop_calculation_after_gc(&mut self) -> Duration {
        let pause = self
            .gc_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed());
        self.mutator_phase_start = Some(Instant::now());
        pause
    }

    /// Records one marking-throughput sample (bytes traced over wall time).
    pub fn record_mark_sample(&mut self, bytes: usize, duration: Duration) {
        let millis = duration_ms(duration);
        if millis > 0.0 && bytes > 0 {
            push_sample(
                &mut self.mark_samples,
                Sample {
                    bytes: bytes as f64,
                    millis,
                },
            );
        }
    }

    /// Average mutator allocation throughput in bytes per millisecond.
    #[must_use]
    pub fn allocation_speed(&self) -> Option<f64> {
        speed_of(&self.alloc_samples)
    }

    /// Average marking throughput in bytes per millisecond.
    #[must_use]
    pub fn mark_speed(&self) -> Option<f64> {
        speed_of(&self.mark_samples)
    }

    pub fn add_survival_rate(&mut self, rate: f64) {
        if self.survival_rates.len() == self.survival_window {
            self.survival_rates.pop_front();
        }
        self.survival_rates.push_back(rate.clamp(0.0, 1.0));
    }

    /// Running average over the configured window; `None` before the first
    /// young cycle completes.
    #[must_use]
    pub fn average_survival_rate(&self) -> Option<f64> {
        if self.survival_rates.is_empty() {
            return None;
        }
        Some(self.survival_rates.iter().sum::<f64>() / self.survival_rates.len() as f64)
    }

    pub fn reset_recorded_survival_rates(&mut self) {
        self.survival_rates.clear();
    }
}

fn push_sample(series: &mut VecDeque<Sample>, sample: Sample) {
    if series.len() == SPEED_SAMPLE_WINDOW {
        series.pop_front();
    }
    series.push_back(sample);
}

fn speed_of(series: &VecDeque<Sample>) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let bytes: f64 = series.iter().map(|s| s.bytes).sum();
    let millis: f64 = series.iter().map(|s| s.millis).sum();
    (millis > 0.0).then(|| bytes / millis)
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Growing factor from the ratio of collection speed to mutator allocation
/// speed: a collector that keeps up earns aggressive growth (approaching
/// `max_factor`), one that lags is clamped toward `min_factor`.
#[must_use]
pub fn calculate_growing_factor(
    gc_speed: f64,
    mutator_speed: f64,
    min_factor: f64,
    max_factor: f64,
) -> f64 {
    if gc_speed <= 0.0 || mutator_speed <= 0.0 {
        return min_factor;
    }
    let ratio = gc_speed / mutator_speed;
    let factor = (ratio * max_factor + min_factor) / (ratio + 1.0);
    factor.clamp(min_factor, max_factor)
}

/// New allocation limit for a space currently holding `current_size` bytes:
/// grow by `factor` (at least `min_growing_step`), keep headroom for one
/// young generation, clamp to the configured bounds.
#[must_use]
pub fn calculate_alloc_limit(
    current_size: usize,
    min_size: usize,
    max_size: usize,
    new_space_capacity: usize,
    factor: f64,
    min_growing_step: usize,
) -> usize {
    let grown = (current_size as f64 * factor) as usize;
    let stepped = current_size.saturating_add(min_growing_step);
    let limit = grown.max(stepped).saturating_add(new_space_capacity);
    limit.clamp(min_size, max_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speeds_are_none_without_samples() {
        let controller = MemController::new(10);
        assert!(controller.allocation_speed().is_none());
        assert!(controller.mark_speed().is_none());
    }

    #[test]
    fn mark_samples_average_over_a_bounded_window() {
        let mut controller = MemController::new(10);
        for _ in 0..SPEED_SAMPLE_WINDOW + 5 {
            controller.record_mark_sample(1000, Duration::from_millis(1));
        }
        let speed = controller.mark_speed().unwrap();
        assert!((speed - 1000.0).abs() < 1.0, "speed {speed}");
    }

    #[test]
    fn survival_rate_window_evicts_oldest() {
        let mut controller = MemController::new(2);
        controller.add_survival_rate(0.0);
        controller.add_survival_rate(1.0);
        controller.add_survival_rate(1.0);
        assert!((controller.average_survival_rate().unwrap() - 1.0).abs() < f64::EPSILON);
        controller.reset_recorded_survival_rates();
        assert!(controller.average_survival_rate().is_none());
    }

    #[test]
    fn growing_factor_tracks_speed_ratio() {
        let fast_gc = calculate_growing_factor(1000.0, 1.0, 1.1, 4.0);
        let slow_gc = calculate_growing_factor(1.0, 1000.0, 1.1, 4.0);
        assert!(fast_gc > slow_gc);
        assert!(fast_gc <= 4.0);
        assert!(slow_gc >= 1.1);
        // No samples degrade to the most conservative growth.
        assert!((calculate_growing_factor(0.0, 0.0, 1.1, 4.0) - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn alloc_limit_grows_and_clamps() {
        let limit = calculate_alloc_limit(10 << 20, 4 << 20, 256 << 20, 1 << 20, 2.0, 1 << 20);
        assert_eq!(limit, (20 << 20) + (1 << 20));

        // The minimum step dominates tiny factors.
        let stepped = calculate_alloc_limit(10 << 20, 4 << 20, 256 << 20, 0, 1.0, 8 << 20);
        assert_eq!(stepped, 18 << 20);

        // Clamped at the configured maximum.
        let capped = calculate_alloc_limit(200 << 20, 4 << 20, 64 << 20, 0, 4.0, 1 << 20);
        assert_eq!(capped, 64 << 20);
    }
}
