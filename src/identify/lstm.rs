//! Single-layer LSTM encoder.
//!
//! Gate layout follows the common stacked convention: the 4H rows of the
//! weight matrices are input, forget, cell and output gates in that order.

use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::network::layers::sigmoid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LstmCell {
    /// `4H × I`
    pub w_ih: Array2<f64>,
    /// `4H × H`
    pub w_hh: Array2<f64>,
    /// `4H`, input and recurrent biases summed.
    pub bias: Array1<f64>,
}

impl LstmCell {
    pub fn input_dim(&self) -> usize {
        self.w_ih.ncols()
    }

    pub fn hidden_dim(&self) -> usize {
        self.w_hh.ncols()
    }

    pub fn validate(&self) -> Result<(), String> {
        let h = self.hidden_dim();
        if h == 0 {
            return Err("lstm hidden width is zero".to_string());
        }
        if self.w_ih.nrows() != 4 * h || self.w_hh.nrows() != 4 * h || self.bias.len() != 4 * h {
            return Err(format!(
                "lstm gate rows must be 4 x {h}: w_ih {}, w_hh {}, bias {}",
                self.w_ih.nrows(),
                self.w_hh.nrows(),
                self.bias.len()
            ));
        }
        let finite = self
            .w_ih
            .iter()
            .chain(self.w_hh.iter())
            .chain(self.bias.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err("lstm has non-finite parameters".to_string());
        }
        Ok(())
    }

    /// Run over `sequence` (one row per step, oldest first) from a zero
    /// state and return the final hidden state.
    pub fn encode(&self, sequence: ArrayView2<f64>) -> Array1<f64> {
        let hd = self.hidden_dim();
        let mut h = Array1::<f64>::zeros(hd);
        let mut c = Array1::<f64>::zeros(hd);
        for x in sequence.rows() {
            let gates = self.w_ih.dot(&x) + self.w_hh.dot(&h) + &self.bias;
            let i = gates.slice(s![0..hd]).mapv(sigmoid);
            let f = gates.slice(s![hd..2 * hd]).mapv(sigmoid);
            let g = gates.slice(s![2 * hd..3 * hd]).mapv(f64::tanh);
            let o = gates.slice(s![3 * hd..4 * hd]).mapv(sigmoid);
            c = &f * &c + &i * &g;
            h = &o * &c.mapv(f64::tanh);
        }
        h
    }
}
