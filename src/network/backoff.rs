use std::time::Duration;

/// Delay before reconnect attempt `attempt` (zero-based):
/// `min(base * 1.5^attempt, max)`.
pub fn reconnect_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1.5f64.powi(attempt.min(128) as i32);
    let millis = (base.as_secs_f64() * 1000.0 * factor).min(max.as_secs_f64() * 1000.0);
    Duration::from_secs_f64(millis / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX: Duration = Duration::from_millis(30_000);

    #[test]
    fn grows_by_half_and_caps() {
        let base = Duration::from_millis(5_000);
        let delays: Vec<u128> = (0..6)
            .map(|a| reconnect_delay(base, a, MAX).as_millis())
            .collect();
        assert_eq!(delays, vec![5_000, 7_500, 11_250, 16_875, 25_312, 30_000]);
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        assert_eq!(reconnect_delay(Duration::from_millis(5_000), u32::MAX, MAX), MAX);
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(base_ms in 1u64..60_000, attempt in 0u32..200) {
            let delay = reconnect_delay(Duration::from_millis(base_ms), attempt, MAX);
            prop_assert!(delay <= MAX);
        }

        #[test]
        fn delay_is_non_decreasing(base_ms in 1u64..60_000, attempt in 0u32..100) {
            let base = Duration::from_millis(base_ms);
            prop_assert!(reconnect_delay(base, attempt, MAX) <= reconnect_delay(base, attempt + 1, MAX));
        }

        #[test]
        fn first_attempt_waits_base(base_ms in 1u64..30_000) {
            let base = Duration::from_millis(base_ms);
            let delay = reconnect_delay(base, 0, MAX);
            prop_assert!((delay.as_secs_f64() - base.as_secs_f64()).abs() < 1e-6);
        }
    }
}
