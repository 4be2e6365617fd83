//! Heap configuration.
//!
//! Every knob here changes heuristic thresholds or the degree of parallelism;
//! none of them changes the correctness protocol. Capacity combinations that
//! cannot host a working heap are rejected at [`Heap::new`](crate::Heap::new).

use crate::error::ConfigError;
use crate::region::REGION_SIZE;

const MB: usize = 1024 * 1024;

/// Minimum old-space headroom a configuration must leave room for.
pub(crate) const MIN_OLD_SPACE_SIZE: usize = 4 * MB;

/// Tuning parameters for a [`Heap`](crate::Heap).
///
/// Construct with [`HeapConfig::default`] and override fields with the
/// builder-style setters:
///
/// ```
/// use gengc::HeapConfig;
///
/// let config = HeapConfig::default()
///     .max_heap_size(64 * 1024 * 1024)
///     .gc_thread_num(4)
///     .enable_concurrent_mark(false);
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Hard upper bound on committed heap memory across all spaces.
    pub max_heap_size: usize,
    /// Lower bound for one young semi-space half.
    pub min_semi_space_size: usize,
    /// Upper bound for one young semi-space half.
    pub max_semi_space_size: usize,
    /// Capacity of the non-movable space.
    pub non_movable_space_size: usize,
    /// Capacity of the machine-code space.
    pub machine_code_space_size: usize,
    /// Capacity of the read-only space.
    pub read_only_space_size: usize,
    /// Capacity of the app-spawn space.
    pub app_spawn_space_size: usize,
    /// Run the marking phase of full traces on background workers.
    pub enable_concurrent_mark: bool,
    /// Rebuild free lists on background workers after old/full collections.
    pub enable_concurrent_sweep: bool,
    /// Evacuate with multiple workers during stop-the-world phases.
    pub enable_parallel_gc: bool,
    /// Worker pool size; `0` derives it from available parallelism.
    pub gc_thread_num: usize,
    /// Allow opportunistic collections from `trigger_idle_collection`.
    pub enable_idle_gc: bool,
    /// Young-space usage that eagerly starts concurrent marking while no
    /// throughput samples exist yet (first cycle).
    pub semi_space_trigger_concurrent_mark: usize,
    /// Minimum absolute growth applied when recomputing allocation limits.
    pub min_growing_step: usize,
    /// Temporary old-space allowance granted to finish an allocation that
    /// failed even after a collection.
    pub out_of_memory_overshoot_size: usize,
    /// Lower clamp of the heap growing factor.
    pub min_growing_factor: f64,
    /// Upper clamp of the heap growing factor.
    pub max_growing_factor: f64,
    /// Number of recent cycles averaged for the survival rate.
    pub survival_rate_window: usize,
    /// Walk and check every object before and after each collection.
    pub enable_heap_verify: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            max_heap_size: 256 * MB,
            min_semi_space_size: 2 * MB,
            max_semi_space_size: 16 * MB,
            non_movable_space_size: 8 * MB,
            machine_code_space_size: 2 * MB,
            read_only_space_size: MB,
            app_spawn_space_size: MB,
            enable_concurrent_mark: true,
            enable_concurrent_sweep: true,
            enable_parallel_gc: true,
            gc_thread_num: 0,
            enable_idle_gc: false,
            semi_space_trigger_concurrent_mark: 3 * MB / 2,
            min_growing_step: 2 * MB,
            out_of_memory_overshoot_size: 2 * MB,
            min_growing_factor: 1.1,
            max_growing_factor: 4.0,
            survival_rate_window: 10,
            enable_heap_verify: false,
        }
    }
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident: $ty:ty) => {
        $(#[$doc])*
        #[must_use]
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = value;
            self
        }
    };
}

impl HeapConfig {
    setter!(
        /// Sets the hard upper bound on committed heap memory.
        max_heap_size: usize
    );
    setter!(min_semi_space_size: usize);
    setter!(max_semi_space_size: usize);
    setter!(non_movable_space_size: usize);
    setter!(machine_code_space_size: usize);
    setter!(read_only_space_size: usize);
    setter!(app_spawn_space_size: usize);
    setter!(enable_concurrent_mark: bool);
    setter!(enable_concurrent_sweep: bool);
    setter!(enable_parallel_gc: bool);
    setter!(
        /// Sets the worker pool size; `0` derives it from available parallelism.
        gc_thread_num: usize
    );
    setter!(enable_idle_gc: bool);
    setter!(semi_space_trigger_concurrent_mark: usize);
    setter!(min_growing_step: usize);
    setter!(out_of_memory_overshoot_size: usize);
    setter!(min_growing_factor: f64);
    setter!(max_growing_factor: f64);
    setter!(survival_rate_window: usize);
    setter!(enable_heap_verify: bool);

    /// Total capacity reserved for the fixed (non-generational) spaces.
    pub(crate) fn fixed_spaces_size(&self) -> usize {
        self.non_movable_space_size
            + self.machine_code_space_size
            + self.read_only_space_size
            + self.app_spawn_space_size
    }

    /// Checks capacity and tuning bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_semi_space_size > self.max_semi_space_size {
            return Err(ConfigError::SemiSpaceBounds {
                min: self.min_semi_space_size,
                max: self.max_semi_space_size,
            });
        }
        if self.min_semi_space_size < REGION_SIZE {
            return Err(ConfigError::SemiSpaceTooSmall {
                size: self.min_semi_space_size,
                region: REGION_SIZE,
            });
        }
        let required =
            self.fixed_spaces_size() + 2 * self.max_semi_space_size + MIN_OLD_SPACE_SIZE;
        if self.max_heap_size < required {
            return Err(ConfigError::CapacityTooSmall {
                max_heap: self.max_heap_size,
                required,
            });
        }
        if self.min_growing_factor < 1.0 || self.min_growing_factor > self.max_growing_factor {
            return Err(ConfigError::GrowingFactorBounds {
                min: self.min_growing_factor,
                max: self.max_growing_factor,
            });
        }
        if self.survival_rate_window == 0 {
            return Err(ConfigError::EmptySurvivalWindow);
        }
        Ok(())
    }

    /// Resolves the worker pool size against available parallelism.
    pub(crate) fn resolved_gc_thread_num(&self) -> usize {
        let hw = std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
        let n = if self.gc_thread_num == 0 {
            hw.saturating_sub(1)
        } else {
            self.gc_thread_num
        };
        n.clamp(1, 8)
    }
}
