//! Retransmission policy.

use std::sync::Arc;
use std::time::Duration;

/// Send cycles after which the default policy always retransmits
pub const DEFAULT_RETRANSMIT_CYCLES: u32 = 3;

/// Decides whether an unacknowledged slot goes back on the wire.
///
/// Called once per send cycle for every slot that is still unacknowledged
/// and was transmitted before, with:
/// - the number of send cycles since the slot was last transmitted
/// - the wall-clock time since it was last transmitted
/// - the connector's current mean latency (zero until measured)
pub type RetransmitPredicate = Arc<dyn Fn(u32, Duration, Duration) -> bool + Send + Sync>;

/// Default policy: resend after three cycles, or once twice the current
/// latency has passed.
#[must_use]
pub fn default_retransmit_predicate(cycles: u32, elapsed: Duration, latency: Duration) -> bool {
    cycles >= DEFAULT_RETRANSMIT_CYCLES || elapsed >= latency * 2
}

/// The default policy as a shareable predicate
#[must_use]
pub fn default_predicate() -> RetransmitPredicate {
    Arc::new(default_retransmit_predicate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_threshold() {
        let long = Duration::from_secs(10);
        assert!(!default_retransmit_predicate(2, Duration::ZERO, long));
        assert!(default_retransmit_predicate(3, Duration::ZERO, long));
    }

    #[test]
    fn test_latency_threshold() {
        let latency = Duration::from_millis(50);
        assert!(!default_retransmit_predicate(1, Duration::from_millis(99), latency));
        assert!(default_retransmit_predicate(1, Duration::from_millis(100), latency));
    }

    #[test]
    fn test_unmeasured_latency_retransmits() {
        assert!(default_retransmit_predicate(1, Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn test_shared_predicate() {
        let predicate = default_predicate();
        assert!(predicate(5, Duration::ZERO, Duration::from_secs(1)));
    }
}
