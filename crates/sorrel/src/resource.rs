//! Allocation caps, deadlines, and GC scheduling knobs.
//!
//! The heap is generic over a [`ResourceTracker`] so that the common case
//! (no limits) compiles down to no-ops, while sandboxed embedders can enforce
//! strict caps on allocation count, concurrent memory, single-allocation size,
//! and wall-clock time.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::rc::ResultCode;

/// Default cap on script-function stack-trace collection. 0 disables capture.
pub const DEFAULT_STACKTRACE_LIMIT: usize = 64;

/// Default cap on script-function call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Default cap on nested evaluation constructs (keyword bodies, literals).
///
/// Parenthesized sub-expressions do not count against this cap; they are
/// evaluated iteratively and are bounded only by memory.
pub const DEFAULT_MAX_EVAL_DEPTH: usize = 500;

/// Error returned when a resource limit is exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum number of live allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum concurrent memory exceeded.
    Memory { limit: usize, used: usize },
    /// A single allocation exceeded the per-allocation cap.
    SingleAlloc { limit: usize, requested: usize },
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => {
                write!(f, "allocation limit exceeded: {count} > {limit}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
            Self::SingleAlloc { limit, requested } => {
                write!(f, "single allocation too large: {requested} bytes > {limit} bytes")
            }
            Self::Time { limit, elapsed } => {
                write!(f, "time limit exceeded: {elapsed:?} > {limit:?}")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

impl ResourceError {
    /// Maps the limit violation onto the engine's result-code taxonomy.
    ///
    /// Allocation and memory caps surface as `Oom` so that the allocation-free
    /// propagation rule applies to them; deadlines surface as `Interrupted`.
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Allocation { .. } | Self::Memory { .. } | Self::SingleAlloc { .. } => ResultCode::Oom,
            Self::Time { .. } => ResultCode::Interrupted,
        }
    }
}

/// Trait for tracking resource usage during value allocation.
///
/// `on_allocate` is called before each heap allocation with a lazily computed
/// size estimate; `on_free` is called when a value is finalized. `check_deadline`
/// is polled at evaluator safe points.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation. Returning an error aborts the
    /// allocation with no side effects.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called when a value's storage is released.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Polled at evaluator safe points; returning an error unwinds like `exit`.
    fn check_deadline(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Current live-allocation count, when the tracker keeps one.
    fn allocations(&self) -> Option<usize> {
        None
    }

    /// Current tracked memory usage in bytes, when the tracker keeps one.
    fn memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// Tracker that imposes no limits. All checks compile away.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}
}

/// Configurable limits for [`LimitedTracker`].
///
/// A limit of `None` means "unlimited" for that dimension.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Maximum number of concurrently live heap values.
    pub max_allocations: Option<usize>,
    /// Maximum concurrently allocated bytes (estimated).
    pub max_memory_bytes: Option<usize>,
    /// Maximum size of any single allocation (estimated).
    pub max_single_alloc: Option<usize>,
    /// Wall-clock execution deadline, measured from tracker construction.
    pub max_time: Option<Duration>,
}

impl ResourceLimits {
    /// Limits suitable for running untrusted snippets: modest allocation and
    /// memory caps plus a one second deadline.
    #[must_use]
    pub fn untrusted() -> Self {
        Self {
            max_allocations: Some(100_000),
            max_memory_bytes: Some(16 * 1024 * 1024),
            max_single_alloc: Some(1024 * 1024),
            max_time: Some(Duration::from_secs(1)),
        }
    }
}

/// Tracker that enforces [`ResourceLimits`].
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    allocations: usize,
    memory_bytes: usize,
    started: Instant,
}

impl LimitedTracker {
    /// Creates a tracker; the time budget starts counting immediately.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocations: 0,
            memory_bytes: 0,
            started: Instant::now(),
        }
    }

    /// The limits this tracker enforces.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_allocations
            && self.allocations + 1 > limit
        {
            return Err(ResourceError::Allocation {
                limit,
                count: self.allocations + 1,
            });
        }
        let size = get_size();
        if let Some(limit) = self.limits.max_single_alloc
            && size > limit
        {
            return Err(ResourceError::SingleAlloc { limit, requested: size });
        }
        if let Some(limit) = self.limits.max_memory_bytes
            && self.memory_bytes + size > limit
        {
            return Err(ResourceError::Memory {
                limit,
                used: self.memory_bytes + size,
            });
        }
        self.allocations += 1;
        self.memory_bytes += size;
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.allocations = self.allocations.saturating_sub(1);
        self.memory_bytes = self.memory_bytes.saturating_sub(get_size());
    }

    fn check_deadline(&mut self) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_time {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn allocations(&self) -> Option<usize> {
        Some(self.allocations)
    }

    fn memory_bytes(&self) -> Option<usize> {
        Some(self.memory_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_limit_tracker_always_allows() {
        let mut tracker = NoLimitTracker;
        for _ in 0..10_000 {
            tracker.on_allocate(|| usize::MAX).unwrap();
        }
        assert_eq!(tracker.allocations(), None);
    }

    #[test]
    fn allocation_cap_trips() {
        let mut tracker = LimitedTracker::new(ResourceLimits {
            max_allocations: Some(2),
            ..ResourceLimits::default()
        });
        tracker.on_allocate(|| 8).unwrap();
        tracker.on_allocate(|| 8).unwrap();
        let err = tracker.on_allocate(|| 8).unwrap_err();
        assert_eq!(err, ResourceError::Allocation { limit: 2, count: 3 });
        assert_eq!(err.result_code(), ResultCode::Oom);
    }

    #[test]
    fn single_alloc_cap_trips_without_counting() {
        let mut tracker = LimitedTracker::new(ResourceLimits {
            max_single_alloc: Some(100),
            ..ResourceLimits::default()
        });
        let err = tracker.on_allocate(|| 101).unwrap_err();
        assert_eq!(err, ResourceError::SingleAlloc { limit: 100, requested: 101 });
        assert_eq!(tracker.allocations(), Some(0), "failed allocation must not be counted");
    }

    #[test]
    fn free_releases_tracked_memory() {
        let mut tracker = LimitedTracker::new(ResourceLimits {
            max_memory_bytes: Some(100),
            ..ResourceLimits::default()
        });
        tracker.on_allocate(|| 80).unwrap();
        tracker.on_free(|| 80);
        tracker.on_allocate(|| 80).unwrap();
        assert_eq!(tracker.memory_bytes(), Some(80));
    }
}
