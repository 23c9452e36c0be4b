/// Consecutive-fault counter for one acquisition device.
#[derive(Debug)]
pub struct FaultTracker {
    consecutive: u32,
    threshold: u32,
    unhealthy: bool,
}

/// What a single poll outcome changed about device health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameUnhealthy { consecutive_faults: u32 },
    Recovered,
}

impl FaultTracker {
    pub const DEFAULT_THRESHOLD: u32 = 3;

    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
            unhealthy: false,
        }
    }

    pub fn record_fault(&mut self) -> HealthTransition {
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.unhealthy && self.consecutive >= self.threshold {
            self.unhealthy = true;
            return HealthTransition::BecameUnhealthy {
                consecutive_faults: self.consecutive,
            };
        }
        HealthTransition::Unchanged
    }

    pub fn record_success(&mut self) -> HealthTransition {
        self.consecutive = 0;
        if std::mem::replace(&mut self.unhealthy, false) {
            HealthTransition::Recovered
        } else {
            HealthTransition::Unchanged
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive
    }
}

impl Default for FaultTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}
