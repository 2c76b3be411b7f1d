//! Kernel tunables.
//!
//! Defaults match the classic Vali scheduler: 61 queues, a 10 ms base slice
//! that grows by 2 ms per level, and a priority boost every 10 seconds.

use vali_common::{OsError, OsResult};

/// Number of ready queues per CPU.
pub const LEVEL_COUNT: usize = 61;

/// Queue reserved for time-critical objects.
pub const TIME_CRITICAL_LEVEL: usize = LEVEL_COUNT - 1;

/// Lowest feedback level; demotion stops here.
pub const LOWEST_LEVEL: usize = TIME_CRITICAL_LEVEL - 1;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of logical CPUs with a run queue.
    pub cpu_count: u32,
    /// Slice of a level-0 object, in milliseconds.
    pub initial_slice_ms: u64,
    /// Slice growth per level, in milliseconds.
    pub slice_step_ms: u64,
    /// Accounted time between two priority boosts, in milliseconds.
    pub boost_interval_ms: u64,
    /// Lock retries a contended mutex spins before blocking (multi-CPU only).
    pub mutex_spin_budget: u32,
    /// Period of the scheduler timer interrupt, in milliseconds.
    pub tick_ms: u64,
}

impl SchedulerConfig {
    /// Time slice of an object on `level`.
    pub fn slice_for(&self, level: usize) -> u64 {
        self.initial_slice_ms + self.slice_step_ms * level as u64
    }

    /// Rejects configurations the scheduler cannot run with.
    pub fn validate(&self) -> OsResult<()> {
        if self.cpu_count == 0
            || self.initial_slice_ms == 0
            || self.boost_interval_ms == 0
            || self.tick_ms == 0
        {
            return Err(OsError::InvalidParameters);
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            cpu_count: 1,
            initial_slice_ms: 10,
            slice_step_ms: 2,
            boost_interval_ms: 10_000,
            mutex_spin_budget: 100,
            tick_ms: 1,
        }
    }
}

/// Configuration of the whole kernel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Handle slots reserved up front.
    pub handle_capacity: usize,
    /// Capacity used when a pipe is created without an explicit size.
    pub pipe_capacity: usize,
    /// Maximum level the kernel logger emits.
    pub log_level: log::LevelFilter,
}

impl KernelConfig {
    /// Validates every section.
    pub fn validate(&self) -> OsResult<()> {
        self.scheduler.validate()?;
        if self.pipe_capacity < 2 {
            return Err(OsError::InvalidParameters);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            scheduler: SchedulerConfig::default(),
            handle_capacity: 64,
            pipe_capacity: 4096,
            log_level: log::LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_slices() {
        let config = SchedulerConfig::default();
        assert_eq!(config.slice_for(0), 10);
        assert_eq!(config.slice_for(1), 12);
        assert_eq!(config.slice_for(LOWEST_LEVEL), 10 + 2 * 59);
        assert_eq!(TIME_CRITICAL_LEVEL, 60);
    }

    #[test]
    fn test_validate() {
        assert!(KernelConfig::default().validate().is_ok());

        let mut config = KernelConfig::default();
        config.scheduler.cpu_count = 0;
        assert_eq!(config.validate(), Err(OsError::InvalidParameters));

        let mut config = KernelConfig::default();
        config.pipe_capacity = 1;
        assert_eq!(config.validate(), Err(OsError::InvalidParameters));

        let config = SchedulerConfig {
            boost_interval_ms: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.validate(), Err(OsError::InvalidParameters));
    }
}
