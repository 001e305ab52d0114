//! Configuration Module - GC Tuning Parameters
//!
//! Two layers of configuration:
//!
//! - [`GcParams`]: sizing and trigger tunables read once at boot
//!   (optionally from `VELD_GC_*` environment variables).
//! - Runtime switches on the object space (stress, dont_gc, auto-compact,
//!   `rgengc_allow_full_mark`) changed through `config_set`.

use crate::error::GcError;

const MB: usize = 1024 * 1024;

/// Default slots per heap at boot.
pub const GC_HEAP_INIT_SLOTS: usize = 10_000;
/// Floor of free slots a sweep must leave behind.
pub const GC_HEAP_FREE_SLOTS: usize = 4096;
pub const GC_HEAP_GROWTH_FACTOR: f64 = 1.8;
/// 0 disables the growth cap.
pub const GC_HEAP_GROWTH_MAX_SLOTS: usize = 0;
pub const GC_HEAP_OLDOBJECT_LIMIT_FACTOR: f64 = 2.0;
pub const GC_HEAP_REMEMBERED_WB_UNPROTECTED_OBJECTS_LIMIT_RATIO: f64 = 0.01;

pub const GC_HEAP_FREE_SLOTS_MIN_RATIO: f64 = 0.20;
pub const GC_HEAP_FREE_SLOTS_GOAL_RATIO: f64 = 0.40;
pub const GC_HEAP_FREE_SLOTS_MAX_RATIO: f64 = 0.65;

pub const GC_MALLOC_LIMIT_MIN: usize = 16 * MB;
pub const GC_MALLOC_LIMIT_MAX: usize = 32 * MB;
pub const GC_MALLOC_LIMIT_GROWTH_FACTOR: f64 = 1.4;

pub const GC_OLDMALLOC_LIMIT_MIN: usize = 16 * MB;
pub const GC_OLDMALLOC_LIMIT_MAX: usize = 128 * MB;
pub const GC_OLDMALLOC_LIMIT_GROWTH_FACTOR: f64 = 1.2;

/// Boot-time sizing and trigger parameters.
///
/// Field defaults reproduce the stock behavior; `from_env` lets a
/// deployment override any of them without a rebuild.
#[derive(Debug, Clone)]
pub struct GcParams {
    /// Initial slot count per heap index.
    pub heap_init_slots: [usize; crate::object::HEAP_COUNT],
    /// Free-slot floor after sweep, per heap.
    pub heap_free_slots: usize,
    pub growth_factor: f64,
    /// Hard cap on slots added per growth step (0 = uncapped).
    pub growth_max_slots: usize,

    pub heap_free_slots_min_ratio: f64,
    pub heap_free_slots_goal_ratio: f64,
    pub heap_free_slots_max_ratio: f64,

    pub oldobject_limit_factor: f64,
    pub uncollectible_wb_unprotected_objects_limit_ratio: f64,

    pub malloc_limit_min: usize,
    pub malloc_limit_max: usize,
    pub malloc_limit_growth_factor: f64,

    pub oldmalloc_limit_min: usize,
    pub oldmalloc_limit_max: usize,
    pub oldmalloc_limit_growth_factor: f64,
}

impl Default for GcParams {
    fn default() -> Self {
        GcParams {
            heap_init_slots: [GC_HEAP_INIT_SLOTS; crate::object::HEAP_COUNT],
            heap_free_slots: GC_HEAP_FREE_SLOTS,
            growth_factor: GC_HEAP_GROWTH_FACTOR,
            growth_max_slots: GC_HEAP_GROWTH_MAX_SLOTS,

            heap_free_slots_min_ratio: GC_HEAP_FREE_SLOTS_MIN_RATIO,
            heap_free_slots_goal_ratio: GC_HEAP_FREE_SLOTS_GOAL_RATIO,
            heap_free_slots_max_ratio: GC_HEAP_FREE_SLOTS_MAX_RATIO,

            oldobject_limit_factor: GC_HEAP_OLDOBJECT_LIMIT_FACTOR,
            uncollectible_wb_unprotected_objects_limit_ratio:
                GC_HEAP_REMEMBERED_WB_UNPROTECTED_OBJECTS_LIMIT_RATIO,

            malloc_limit_min: GC_MALLOC_LIMIT_MIN,
            malloc_limit_max: GC_MALLOC_LIMIT_MAX,
            malloc_limit_growth_factor: GC_MALLOC_LIMIT_GROWTH_FACTOR,

            oldmalloc_limit_min: GC_OLDMALLOC_LIMIT_MIN,
            oldmalloc_limit_max: GC_OLDMALLOC_LIMIT_MAX,
            oldmalloc_limit_growth_factor: GC_OLDMALLOC_LIMIT_GROWTH_FACTOR,
        }
    }
}

impl GcParams {
    /// Build parameters from environment variables.
    ///
    /// Recognized variables (all optional):
    /// - `VELD_GC_HEAP_INIT_SLOTS`, `VELD_GC_HEAP_FREE_SLOTS`
    /// - `VELD_GC_HEAP_GROWTH_FACTOR`, `VELD_GC_HEAP_GROWTH_MAX_SLOTS`
    /// - `VELD_GC_HEAP_FREE_SLOTS_MIN_RATIO` / `_GOAL_RATIO` / `_MAX_RATIO`
    /// - `VELD_GC_HEAP_OLDOBJECT_LIMIT_FACTOR`
    /// - `VELD_GC_MALLOC_LIMIT_MIN` / `_MAX` / `_GROWTH_FACTOR`
    /// - `VELD_GC_OLDMALLOC_LIMIT_MIN` / `_MAX` / `_GROWTH_FACTOR`
    pub fn from_env() -> Self {
        let mut params = Self::default();

        if let Some(v) = env_usize("VELD_GC_HEAP_INIT_SLOTS") {
            params.heap_init_slots = [v; crate::object::HEAP_COUNT];
        }
        if let Some(v) = env_usize("VELD_GC_HEAP_FREE_SLOTS") {
            params.heap_free_slots = v;
        }
        if let Some(v) = env_f64("VELD_GC_HEAP_GROWTH_FACTOR") {
            params.growth_factor = v;
        }
        if let Some(v) = env_usize("VELD_GC_HEAP_GROWTH_MAX_SLOTS") {
            params.growth_max_slots = v;
        }
        if let Some(v) = env_f64("VELD_GC_HEAP_FREE_SLOTS_MIN_RATIO") {
            params.heap_free_slots_min_ratio = v;
        }
        if let Some(v) = env_f64("VELD_GC_HEAP_FREE_SLOTS_GOAL_RATIO") {
            params.heap_free_slots_goal_ratio = v;
        }
        if let Some(v) = env_f64("VELD_GC_HEAP_FREE_SLOTS_MAX_RATIO") {
            params.heap_free_slots_max_ratio = v;
        }
        if let Some(v) = env_f64("VELD_GC_HEAP_OLDOBJECT_LIMIT_FACTOR") {
            params.oldobject_limit_factor = v;
        }
        if let Some(v) = env_usize("VELD_GC_MALLOC_LIMIT_MIN") {
            params.malloc_limit_min = v;
        }
        if let Some(v) = env_usize("VELD_GC_MALLOC_LIMIT_MAX") {
            params.malloc_limit_max = v;
        }
        if let Some(v) = env_f64("VELD_GC_MALLOC_LIMIT_GROWTH_FACTOR") {
            params.malloc_limit_growth_factor = v;
        }
        if let Some(v) = env_usize("VELD_GC_OLDMALLOC_LIMIT_MIN") {
            params.oldmalloc_limit_min = v;
        }
        if let Some(v) = env_usize("VELD_GC_OLDMALLOC_LIMIT_MAX") {
            params.oldmalloc_limit_max = v;
        }
        if let Some(v) = env_f64("VELD_GC_OLDMALLOC_LIMIT_GROWTH_FACTOR") {
            params.oldmalloc_limit_growth_factor = v;
        }

        params
    }

    /// Check all values are in valid ranges.
    pub fn validate(&self) -> Result<(), GcError> {
        if self.growth_factor <= 1.0 {
            return Err(GcError::Configuration(
                "growth_factor must be > 1.0".to_string(),
            ));
        }
        if self.heap_free_slots_min_ratio <= 0.0
            || self.heap_free_slots_min_ratio >= self.heap_free_slots_goal_ratio
            || self.heap_free_slots_goal_ratio >= self.heap_free_slots_max_ratio
            || self.heap_free_slots_max_ratio >= 1.0
        {
            return Err(GcError::Configuration(
                "free-slot ratios must satisfy 0 < min < goal < max < 1".to_string(),
            ));
        }
        if self.malloc_limit_min > self.malloc_limit_max {
            return Err(GcError::Configuration(
                "malloc_limit_min cannot exceed malloc_limit_max".to_string(),
            ));
        }
        if self.oldmalloc_limit_min > self.oldmalloc_limit_max {
            return Err(GcError::Configuration(
                "oldmalloc_limit_min cannot exceed oldmalloc_limit_max".to_string(),
            ));
        }
        if self.oldobject_limit_factor < 1.0 {
            return Err(GcError::Configuration(
                "oldobject_limit_factor must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runtime switches, changed through `config_set` / dedicated setters.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// When false, major GC is suppressed; minor cycles extend the heap
    /// as needed.
    pub rgengc_allow_full_mark: bool,
    /// Compact on every major GC.
    pub auto_compact: bool,
    /// Collect before every allocation (testing aid).
    pub stress: bool,
    /// Measure total GC time.
    pub measure_total_time: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            rgengc_allow_full_mark: true,
            auto_compact: false,
            stress: false,
            measure_total_time: true,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.parse().ok()
}

/// Derive the initial per-heap page count from an init-slot target.
pub fn initial_pages_for_slots(slots: usize, slots_per_page: usize) -> usize {
    slots.div_ceil(slots_per_page.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_valid() {
        let params = GcParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.heap_free_slots, 4096);
        assert_eq!(params.malloc_limit_min, 16 * 1024 * 1024);
    }

    #[test]
    fn test_bad_ratios_rejected() {
        let params = GcParams {
            heap_free_slots_min_ratio: 0.5,
            heap_free_slots_goal_ratio: 0.4,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_initial_pages() {
        assert_eq!(initial_pages_for_slots(10_000, 1634), 7);
        assert_eq!(initial_pages_for_slots(1, 1634), 1);
    }
}
