use chrono::{DateTime, Duration, Utc};

/// Hands out capture timestamps that never go backwards.
///
/// The wall clock on a Raspberry Pi without an RTC can step back when NTP
/// syncs. Readings from one device must stay ordered and keep distinct
/// timestamps (the idempotency key is derived from them), so a sample at or
/// before the last issued instant is replaced by that instant plus 1 ns.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Fold a raw wall-clock sample into the monotonic sequence.
    pub fn observe(&mut self, sample: DateTime<Utc>) -> DateTime<Utc> {
        let issued = match self.last {
            Some(last) if sample <= last => last + Duration::nanoseconds(1),
            _ => sample,
        };
        self.last = Some(issued);
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stepped_back_clock_keeps_advancing() {
        let mut clock = MonotonicClock::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();

        assert_eq!(clock.observe(t0), t0);
        let first = clock.observe(t0 - Duration::seconds(30));
        assert_eq!(first, t0 + Duration::nanoseconds(1));
        let second = clock.observe(t0 - Duration::seconds(25));
        assert_eq!(second, t0 + Duration::nanoseconds(2));
        assert_eq!(
            clock.observe(t0 + Duration::seconds(5)),
            t0 + Duration::seconds(5)
        );
    }

    #[test]
    fn repeated_sample_is_not_reissued() {
        let mut clock = MonotonicClock::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();

        let a = clock.observe(t0);
        let b = clock.observe(t0);
        assert!(b > a);
    }
}
