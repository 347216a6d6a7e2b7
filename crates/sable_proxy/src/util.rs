//! Small timing helpers shared by both proxy roles.

use std::time::Duration;

use rand::Rng;

/// Jitter a delay by ±10% so periodic work across proxies does not align.
pub fn jittered(duration: Duration) -> Duration {
    let factor = 0.9 + 0.2 * rand::thread_rng().gen::<f64>();
    duration.mul_f64(factor)
}

/// Seconds since the process epoch, for monotonic wall-clock comparisons.
pub fn now_seconds() -> f64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(90) && d <= Duration::from_millis(110));
        }
    }

    #[test]
    fn now_seconds_is_monotonic() {
        let a = now_seconds();
        let b = now_seconds();
        assert!(b >= a);
    }
}
