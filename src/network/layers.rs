//! Feed-forward layers with forward-mode Jacobian propagation.
//!
//! The Jacobian of the network output with respect to its input is carried
//! alongside the activations: affine layers left-multiply it by `W`, and
//! elementwise nonlinearities left-multiply it by `diag(σ'(a))` where `a` is
//! the pre-activation. For a scalar-output network the final Jacobian is the
//! gradient row.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Elementwise bounded nonlinearity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Tanh,
    Relu,
    Sigmoid,
}

impl Activation {
    #[inline]
    pub fn apply(self, a: f64) -> f64 {
        match self {
            Activation::Tanh => a.tanh(),
            Activation::Relu => a.max(0.0),
            Activation::Sigmoid => sigmoid(a),
        }
    }

    /// Local derivative evaluated at the pre-activation `a`.
    /// ReLU uses the sub-gradient 0 at the kink.
    #[inline]
    pub fn derivative(self, a: f64) -> f64 {
        match self {
            Activation::Tanh => {
                let t = a.tanh();
                1.0 - t * t
            }
            Activation::Relu => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Sigmoid => {
                let s = sigmoid(a);
                s * (1.0 - s)
            }
        }
    }
}

#[inline]
pub fn sigmoid(a: f64) -> f64 {
    1.0 / (1.0 + (-a).exp())
}

/// One stage of a feed-forward network.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// `y = W x + b`, with `W ∈ R^{out × in}`.
    Linear { weight: Array2<f64>, bias: Array1<f64> },
    /// Elementwise nonlinearity.
    Activation { function: Activation },
}

impl Layer {
    pub fn linear(weight: Array2<f64>, bias: Array1<f64>) -> Self {
        Layer::Linear { weight, bias }
    }

    pub fn activation(function: Activation) -> Self {
        Layer::Activation { function }
    }
}

/// A chain of layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedForward {
    pub layers: Vec<Layer>,
}

impl FeedForward {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Input width (columns of the first affine layer).
    pub fn input_dim(&self) -> Option<usize> {
        self.layers.iter().find_map(|l| match l {
            Layer::Linear { weight, .. } => Some(weight.ncols()),
            Layer::Activation { .. } => None,
        })
    }

    /// Output width (rows of the last affine layer).
    pub fn output_dim(&self) -> Option<usize> {
        self.layers.iter().rev().find_map(|l| match l {
            Layer::Linear { weight, .. } => Some(weight.nrows()),
            Layer::Activation { .. } => None,
        })
    }

    /// Check that consecutive affine layers chain and every parameter is finite.
    pub fn validate(&self) -> Result<(), String> {
        let mut width: Option<usize> = None;
        let mut saw_linear = false;
        for (i, layer) in self.layers.iter().enumerate() {
            if let Layer::Linear { weight, bias } = layer {
                saw_linear = true;
                if bias.len() != weight.nrows() {
                    return Err(format!(
                        "layer {i}: bias has {} entries for {} rows",
                        bias.len(),
                        weight.nrows()
                    ));
                }
                if let Some(w) = width {
                    if weight.ncols() != w {
                        return Err(format!(
                            "layer {i}: expects {} inputs but previous layer produces {w}",
                            weight.ncols()
                        ));
                    }
                }
                if !weight.iter().chain(bias.iter()).all(|v| v.is_finite()) {
                    return Err(format!("layer {i}: non-finite parameter"));
                }
                width = Some(weight.nrows());
            }
        }
        if !saw_linear {
            return Err("network has no affine layers".to_string());
        }
        Ok(())
    }

    /// Plain forward pass.
    pub fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mut v = x.to_owned();
        for layer in &self.layers {
            v = match layer {
                Layer::Linear { weight, bias } => weight.dot(&v) + bias,
                Layer::Activation { function } => {
                    let f = *function;
                    v.mapv(|a| f.apply(a))
                }
            };
        }
        v
    }

    /// Forward pass carrying the input Jacobian.
    ///
    /// `jacobian` is the Jacobian of `x` with respect to the quantity the
    /// caller wants gradients for (for a raw input this is the identity).
    /// Returns the output and `d output / d (caller input)`.
    pub fn forward_with_jacobian(
        &self,
        x: ArrayView1<f64>,
        jacobian: Array2<f64>,
    ) -> (Array1<f64>, Array2<f64>) {
        let mut v = x.to_owned();
        let mut jac = jacobian;
        for layer in &self.layers {
            match layer {
                Layer::Linear { weight, bias } => {
                    v = weight.dot(&v) + bias;
                    jac = weight.dot(&jac);
                }
                Layer::Activation { function } => {
                    let f = *function;
                    let deriv = v.mapv(|a| f.derivative(a));
                    v.mapv_inplace(|a| f.apply(a));
                    jac = &jac * &deriv.view().insert_axis(Axis(1));
                }
            }
        }
        (v, jac)
    }

    /// Total number of parameters.
    pub fn param_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| match l {
                Layer::Linear { weight, bias } => weight.len() + bias.len(),
                Layer::Activation { .. } => 0,
            })
            .sum()
    }
}
