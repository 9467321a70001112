//! Finite-difference estimate of the certificate's time derivative.

/// ḣ_est = (h_t − h_{t−1}) / dt + decay · h_t
#[derive(Clone, Debug)]
pub struct DerivativeEstimator {
    dt: f64,
    decay: f64,
    previous: Option<f64>,
}

impl DerivativeEstimator {
    pub fn new(dt: f64, decay: f64) -> Self {
        Self {
            dt,
            decay,
            previous: None,
        }
    }

    /// Feed the current h. `None` until two consecutive values exist.
    pub fn update(&mut self, h: f64) -> Option<f64> {
        let estimate = self
            .previous
            .map(|prev| (h - prev) / self.dt + self.decay * h);
        self.previous = Some(h);
        estimate
    }

    /// Forget the previous value, e.g. after switching certificates.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_has_no_estimate() {
        let mut est = DerivativeEstimator::new(0.1, 0.0);
        assert!(est.update(1.0).is_none());
        let d = est.update(1.5).expect("estimate");
        assert!((d - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_decay_term() {
        let mut est = DerivativeEstimator::new(0.01, 0.1);
        est.update(2.0);
        let d = est.update(2.0).expect("estimate");
        assert!((d - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_reset_drops_history() {
        let mut est = DerivativeEstimator::new(0.01, 0.1);
        est.update(1.0);
        est.reset();
        assert!(est.update(-3.0).is_none());
    }
}
