//! Barrier oracle: h(x) and ∇h(x) from a pretrained network.
//!
//! Inputs are normalized to the safe envelope, x_n = (x − c) / r, so the
//! Jacobian is seeded with diag(1/r) and ∇h comes out in raw state
//! coordinates.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::dynamics::Limits;
use crate::error::{DimensionError, StartupError};
use crate::network::artifact::CertificateArtifact;
use crate::network::layers::FeedForward;

#[derive(Clone)]
pub struct BarrierOracle {
    name: String,
    network: Arc<FeedForward>,
    center: Array1<f64>,
    half_range: Array1<f64>,
}

impl fmt::Debug for BarrierOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierOracle")
            .field("name", &self.name)
            .field("state_dim", &self.center.len())
            .field("params", &self.network.param_count())
            .finish()
    }
}

impl BarrierOracle {
    /// Bind a certificate artifact to the envelope it was trained on.
    pub fn new(artifact: CertificateArtifact, envelope: &Limits) -> Result<Self, StartupError> {
        let kind = format!("{} certificate", artifact.name);
        artifact.validate().map_err(|reason| StartupError::Incompatible {
            kind: kind.clone(),
            reason,
        })?;
        if artifact.state_dim != envelope.dim() {
            return Err(StartupError::Incompatible {
                kind,
                reason: format!(
                    "trained for {} states, system has {}",
                    artifact.state_dim,
                    envelope.dim()
                ),
            });
        }
        let half_range = envelope.half_range();
        if let Some(i) = half_range.iter().position(|r| !(r.is_finite() && *r > 0.0)) {
            return Err(StartupError::Incompatible {
                kind,
                reason: format!("safe envelope has degenerate width on dimension {i}"),
            });
        }
        Ok(Self {
            name: artifact.name,
            network: Arc::new(artifact.network),
            center: envelope.midpoint(),
            half_range,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_dim(&self) -> usize {
        self.center.len()
    }

    fn normalize(&self, x: ArrayView1<f64>) -> Array1<f64> {
        (&x - &self.center) / &self.half_range
    }

    /// h(x) and ∇h(x).
    pub fn evaluate(&self, x: ArrayView1<f64>) -> Result<(f64, Array1<f64>), DimensionError> {
        DimensionError::check("certificate input", self.state_dim(), x.len())?;
        Ok(self.evaluate_unchecked(x))
    }

    fn evaluate_unchecked(&self, x: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let xn = self.normalize(x);
        let seed = Array2::from_diag(&self.half_range.mapv(f64::recip));
        let (out, jac) = self.network.forward_with_jacobian(xn.view(), seed);
        (out[0], jac.row(0).to_owned())
    }

    /// h(x) without the Jacobian.
    pub fn value(&self, x: ArrayView1<f64>) -> Result<f64, DimensionError> {
        DimensionError::check("certificate input", self.state_dim(), x.len())?;
        Ok(self.network.forward(self.normalize(x).view())[0])
    }

    /// Row-wise h and ∇h for a batch of states, evaluated in parallel.
    pub fn evaluate_batch(
        &self,
        states: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array2<f64>), DimensionError> {
        DimensionError::check("certificate batch width", self.state_dim(), states.ncols())?;
        let rows: Vec<(f64, Array1<f64>)> = (0..states.nrows())
            .into_par_iter()
            .map(|i| self.evaluate_unchecked(states.row(i)))
            .collect();

        let mut values = Array1::zeros(rows.len());
        let mut grads = Array2::zeros((rows.len(), self.state_dim()));
        for (i, (h, grad)) in rows.into_iter().enumerate() {
            values[i] = h;
            grads.row_mut(i).assign(&grad);
        }
        Ok((values, grads))
    }

    /// Row-wise h only.
    pub fn value_batch(&self, states: ArrayView2<f64>) -> Result<Array1<f64>, DimensionError> {
        DimensionError::check("certificate batch width", self.state_dim(), states.ncols())?;
        let values: Vec<f64> = (0..states.nrows())
            .into_par_iter()
            .map(|i| self.network.forward(self.normalize(states.row(i)).view())[0])
            .collect();
        Ok(Array1::from(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::layers::{Activation, Layer};
    use ndarray::array;

    fn envelope() -> Limits {
        Limits::new(array![9.0, 3.0], array![1.0, -1.0]).expect("limits")
    }

    fn artifact() -> CertificateArtifact {
        CertificateArtifact {
            name: "nominal".to_string(),
            state_dim: 2,
            network: FeedForward::new(vec![
                Layer::linear(array![[0.9, -0.4], [0.3, 1.2], [-0.7, 0.5]], array![0.1, 0.0, -0.2]),
                Layer::activation(Activation::Tanh),
                Layer::linear(array![[0.6, -0.8, 0.4]], array![0.25]),
            ]),
        }
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let oracle = BarrierOracle::new(artifact(), &envelope()).expect("oracle");
        let x = array![4.2, 0.7];
        let (h, grad) = oracle.evaluate(x.view()).expect("evaluate");
        assert!((h - oracle.value(x.view()).expect("value")).abs() < 1e-12);

        let eps = 1e-6;
        for i in 0..2 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[i] += eps;
            xm[i] -= eps;
            let fd = (oracle.value(xp.view()).expect("value")
                - oracle.value(xm.view()).expect("value"))
                / (2.0 * eps);
            assert!((fd - grad[i]).abs() < 1e-7, "dh/dx{i}: fd={fd} analytic={}", grad[i]);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let oracle = BarrierOracle::new(artifact(), &envelope()).expect("oracle");
        let err = oracle.evaluate(array![1.0, 2.0, 3.0].view()).unwrap_err();
        assert_eq!(err.expected, 2);
        assert_eq!(err.actual, 3);
    }

    #[test]
    fn test_rejects_incompatible_artifact() {
        let wide = Limits::uniform(3, 0.0, 1.0);
        assert!(matches!(
            BarrierOracle::new(artifact(), &wide),
            Err(StartupError::Incompatible { .. })
        ));
        let flat = Limits::uniform(2, 1.0, 1.0);
        assert!(BarrierOracle::new(artifact(), &flat).is_err());
    }

    #[test]
    fn test_batch_matches_single() {
        let oracle = BarrierOracle::new(artifact(), &envelope()).expect("oracle");
        let states = array![[1.0, 0.0], [5.0, 1.0], [8.5, -0.5], [2.0, 2.9]];
        let (values, grads) = oracle.evaluate_batch(states.view()).expect("batch");
        let plain = oracle.value_batch(states.view()).expect("values");
        for i in 0..states.nrows() {
            let (h, g) = oracle.evaluate(states.row(i)).expect("evaluate");
            assert!((values[i] - h).abs() < 1e-12);
            assert!((plain[i] - h).abs() < 1e-12);
            assert!((&grads.row(i) - &g).iter().all(|d| d.abs() < 1e-12));
        }
    }

    #[test]
    fn test_linear_certificate_gradient_is_scaled() {
        // h = x_n0 with x_n0 = (x0 - 5) / 4, so dh/dx0 = 0.25.
        let art = CertificateArtifact {
            name: "linear".to_string(),
            state_dim: 2,
            network: FeedForward::new(vec![Layer::linear(array![[1.0, 0.0]], array![0.0])]),
        };
        let oracle = BarrierOracle::new(art, &envelope()).expect("oracle");
        let (h, grad) = oracle.evaluate(array![7.0, 0.0].view()).expect("evaluate");
        assert!((h - 0.5).abs() < 1e-12);
        assert!((grad[0] - 0.25).abs() < 1e-12);
        assert!(grad[1].abs() < 1e-12);
    }
}
