//! Fixed-capacity trajectory window feeding the identifier.

use std::collections::VecDeque;

use ndarray::{Array1, Array2};

use crate::error::DimensionError;

/// One tick of history: measured output, output deviation, commanded control.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowSample {
    pub y: Array1<f64>,
    pub dy: Array1<f64>,
    pub u: Array1<f64>,
}

/// FIFO ring buffer of the last `capacity` samples, oldest first.
#[derive(Clone, Debug)]
pub struct TrajectoryBuffer {
    capacity: usize,
    output_dim: usize,
    control_dim: usize,
    samples: VecDeque<WindowSample>,
}

impl TrajectoryBuffer {
    pub fn new(capacity: usize, output_dim: usize, control_dim: usize) -> Self {
        Self {
            capacity,
            output_dim,
            control_dim,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.samples.len() == self.capacity
    }

    /// Width of one flattened sample: y, Δy, u.
    pub fn sample_width(&self) -> usize {
        2 * self.output_dim + self.control_dim
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: WindowSample) -> Result<(), DimensionError> {
        DimensionError::check("window output", self.output_dim, sample.y.len())?;
        DimensionError::check("window output deviation", self.output_dim, sample.dy.len())?;
        DimensionError::check("window control", self.control_dim, sample.u.len())?;
        if self.capacity == 0 {
            return Ok(());
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowSample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Rows in time order, each `[y, Δy, u]`.
    pub fn to_matrix(&self) -> Array2<f64> {
        let width = self.sample_width();
        let mut out = Array2::zeros((self.samples.len(), width));
        for (mut row, s) in out.rows_mut().into_iter().zip(self.samples.iter()) {
            let values = s.y.iter().chain(s.dy.iter()).chain(s.u.iter());
            for (dst, src) in row.iter_mut().zip(values) {
                *dst = *src;
            }
        }
        out
    }

    /// The whole window flattened in time order.
    pub fn features(&self) -> Array1<f64> {
        let width = self.sample_width();
        let mut out = Vec::with_capacity(self.samples.len() * width);
        for s in &self.samples {
            out.extend(s.y.iter().chain(s.dy.iter()).chain(s.u.iter()).copied());
        }
        Array1::from(out)
    }
}
