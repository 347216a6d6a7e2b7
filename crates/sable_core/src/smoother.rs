//! Exponential-moving-average smoother used by the admission controller.

use std::time::Instant;

/// Smooths a running total over a fixed e-folding window.
///
/// `smooth_total` converges toward the true total; `smooth_rate` is the rate
/// implied by the gap still to be absorbed. The four mutators (`set_total`,
/// `add_delta`, `reset`, plus the implicit time update) are the whole API.
#[derive(Debug)]
pub struct Smoother {
    e_folding_seconds: f64,
    total: f64,
    estimate: f64,
    last_update: Instant,
}

impl Smoother {
    pub fn new(e_folding_seconds: f64) -> Self {
        Self {
            e_folding_seconds,
            total: 0.0,
            estimate: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Forget history and pin both total and estimate to `value`.
    pub fn reset(&mut self, value: f64) {
        self.total = value;
        self.estimate = value;
        self.last_update = Instant::now();
    }

    pub fn set_total(&mut self, total: f64) {
        let delta = total - self.total;
        self.add_delta(delta);
    }

    pub fn add_delta(&mut self, delta: f64) {
        self.update();
        self.total += delta;
    }

    pub fn smooth_total(&mut self) -> f64 {
        self.update();
        self.estimate
    }

    /// Rate at which the estimate is still moving toward the total.
    pub fn smooth_rate(&mut self) -> f64 {
        self.update();
        (self.total - self.estimate) / self.e_folding_seconds
    }

    fn update(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            self.last_update = now;
            self.estimate +=
                (self.total - self.estimate) * (1.0 - (-elapsed / self.e_folding_seconds).exp());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_pins_estimate() {
        let mut s = Smoother::new(2.0);
        s.reset(10.0);
        assert!((s.smooth_total() - 10.0).abs() < 1e-6);
        assert!(s.smooth_rate().abs() < 1e-6);
    }

    #[test]
    fn set_total_moves_estimate_gradually() {
        let mut s = Smoother::new(1000.0);
        s.reset(0.0);
        s.set_total(100.0);
        // With a huge window almost nothing is absorbed immediately, so the
        // implied rate is close to total/window.
        let rate = s.smooth_rate();
        assert!(rate > 0.0 && rate <= 0.1 + 1e-6, "rate {rate}");
        assert!(s.smooth_total() < 100.0);
    }

    #[test]
    fn add_delta_accumulates_into_total() {
        let mut s = Smoother::new(1000.0);
        s.reset(0.0);
        s.add_delta(5.0);
        s.add_delta(5.0);
        assert!(s.smooth_rate() > 0.0);
        assert!(s.smooth_total() >= 0.0);
    }
}
