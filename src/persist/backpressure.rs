use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Doubling stops at 2^16.
const MAX_EXPONENT: usize = 16;

/// Retry-queue depth shared with the acquisition branches.
#[derive(Debug, Clone)]
pub struct Backpressure {
    depth: Arc<AtomicUsize>,
    high_water_mark: usize,
}

impl Backpressure {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            depth: Arc::new(AtomicUsize::new(0)),
            high_water_mark: high_water_mark.max(1),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub(crate) fn increment(&self) {
        self.depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)));
    }

    /// Factor applied to the acquisition interval for the next tick.
    pub fn multiplier(&self) -> u32 {
        throttle_multiplier(self.depth(), self.high_water_mark)
    }

    pub fn is_throttling(&self) -> bool {
        self.multiplier() > 1
    }
}

/// 1 below the mark, then `2^(1 + (depth - hwm) / hwm)`: one more doubling
/// per high-water mark of extra depth, so production keeps slowing for as
/// long as the queue keeps growing.
pub fn throttle_multiplier(depth: usize, high_water_mark: usize) -> u32 {
    let hwm = high_water_mark.max(1);
    if depth < hwm {
        return 1;
    }
    let exponent = (1 + (depth - hwm) / hwm).min(MAX_EXPONENT);
    1 << exponent
}
