//! Window classifier giving a per-channel authority confidence.
//!
//! Both model families produce logits that are squashed with a sigmoid, so
//! each confidence lies in [0, 1]. A confidence near 1 means the channel
//! behaves as commanded; the lowest confidence names the suspect channel.

use std::fmt;
use std::sync::Arc;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::lstm::LstmCell;
use super::window::TrajectoryBuffer;
use crate::error::StartupError;
use crate::network::layers::{sigmoid, FeedForward};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierModel {
    /// MLP over the flattened window.
    Feedforward { head: FeedForward },
    /// LSTM over the window rows, MLP over the final hidden state.
    Recurrent { encoder: LstmCell, head: FeedForward },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifierArtifact {
    /// Window length L.
    pub window_len: usize,
    /// Width of y (and Δy).
    pub output_dim: usize,
    /// Number of channels m; also the model's output width.
    pub control_dim: usize,
    pub model: IdentifierModel,
}

impl IdentifierArtifact {
    pub fn sample_width(&self) -> usize {
        2 * self.output_dim + self.control_dim
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.window_len == 0 {
            return Err("window_len must be positive".to_string());
        }
        if self.control_dim == 0 {
            return Err("control_dim must be positive".to_string());
        }
        let (head, expected_input) = match &self.model {
            IdentifierModel::Feedforward { head } => (head, self.window_len * self.sample_width()),
            IdentifierModel::Recurrent { encoder, head } => {
                encoder.validate()?;
                if encoder.input_dim() != self.sample_width() {
                    return Err(format!(
                        "encoder expects {} inputs per step, window rows have {}",
                        encoder.input_dim(),
                        self.sample_width()
                    ));
                }
                (head, encoder.hidden_dim())
            }
        };
        head.validate()?;
        if head.input_dim() != Some(expected_input) {
            return Err(format!(
                "head expects {:?} inputs, model provides {expected_input}",
                head.input_dim()
            ));
        }
        if head.output_dim() != Some(self.control_dim) {
            return Err(format!(
                "head produces {:?} outputs for {} channels",
                head.output_dim(),
                self.control_dim
            ));
        }
        Ok(())
    }
}

/// One identifier evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentifierReport {
    pub confidences: Array1<f64>,
    /// argmin of `confidences`.
    pub candidate: usize,
    pub min_confidence: f64,
}

impl IdentifierReport {
    pub fn from_confidences(confidences: Array1<f64>) -> Option<Self> {
        let (candidate, min_confidence) = confidences
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        Some(Self {
            confidences,
            candidate,
            min_confidence,
        })
    }

    /// Estimated authority loss per channel, `1 − confidence`.
    pub fn loss_estimate(&self) -> Array1<f64> {
        self.confidences.mapv(|c| (1.0 - c).clamp(0.0, 1.0))
    }
}

#[derive(Clone)]
pub struct FaultIdentifier {
    artifact: Arc<IdentifierArtifact>,
}

impl fmt::Debug for FaultIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultIdentifier")
            .field("window_len", &self.artifact.window_len)
            .field("control_dim", &self.artifact.control_dim)
            .finish()
    }
}

impl FaultIdentifier {
    pub fn new(artifact: IdentifierArtifact) -> Result<Self, StartupError> {
        artifact
            .validate()
            .map_err(|reason| StartupError::Incompatible {
                kind: "identifier".to_string(),
                reason,
            })?;
        Ok(Self {
            artifact: Arc::new(artifact),
        })
    }

    pub fn window_len(&self) -> usize {
        self.artifact.window_len
    }

    pub fn output_dim(&self) -> usize {
        self.artifact.output_dim
    }

    pub fn control_dim(&self) -> usize {
        self.artifact.control_dim
    }

    /// Per-channel confidences, or `None` until the buffer holds a full
    /// window of the expected shape.
    pub fn identify(&self, window: &TrajectoryBuffer) -> Option<IdentifierReport> {
        if !window.is_full()
            || window.len() != self.artifact.window_len
            || window.sample_width() != self.artifact.sample_width()
        {
            return None;
        }
        let logits = match &self.artifact.model {
            IdentifierModel::Feedforward { head } => head.forward(window.features().view()),
            IdentifierModel::Recurrent { encoder, head } => {
                let hidden = encoder.encode(window.to_matrix().view());
                head.forward(hidden.view())
            }
        };
        IdentifierReport::from_confidences(logits.mapv(sigmoid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::window::WindowSample;
    use crate::network::artifact::{load, save};
    use crate::network::layers::Layer;
    use crate::testing::shortfall_identifier;
    use ndarray::{array, Array2};

    fn fill(buf: &mut TrajectoryBuffer, dy: Array1<f64>) {
        let n = dy.len();
        while !buf.is_full() {
            buf.push(WindowSample {
                y: Array1::zeros(n),
                dy: dy.clone(),
                u: Array1::ones(n),
            })
            .expect("push");
        }
    }

    #[test]
    fn test_no_opinion_until_full() {
        let id = FaultIdentifier::new(shortfall_identifier(10, 2)).expect("identifier");
        let mut buf = TrajectoryBuffer::new(10, 2, 2);
        for _ in 0..9 {
            buf.push(WindowSample {
                y: Array1::zeros(2),
                dy: Array1::zeros(2),
                u: Array1::zeros(2),
            })
            .expect("push");
            assert!(id.identify(&buf).is_none());
        }
        fill(&mut buf, Array1::zeros(2));
        assert!(id.identify(&buf).is_some());
    }

    #[test]
    fn test_shortfall_channel_is_candidate() {
        let id = FaultIdentifier::new(shortfall_identifier(10, 3)).expect("identifier");
        let mut buf = TrajectoryBuffer::new(10, 3, 3);
        fill(&mut buf, array![0.0, 0.15, 0.0]);
        let report = id.identify(&buf).expect("report");
        assert_eq!(report.candidate, 1);
        // 4 - 6 * 1.5 = -5
        assert!((report.min_confidence - sigmoid(-5.0)).abs() < 1e-12);
        assert!((report.confidences[0] - sigmoid(4.0)).abs() < 1e-12);
        assert!(report.confidences.iter().all(|c| (0.0..=1.0).contains(c)));
    }

    fn recurrent_artifact(channels: usize) -> IdentifierArtifact {
        let width = 3 * channels;
        let hidden = 3;
        IdentifierArtifact {
            window_len: 5,
            output_dim: channels,
            control_dim: channels,
            model: IdentifierModel::Recurrent {
                encoder: LstmCell {
                    w_ih: Array2::from_elem((4 * hidden, width), 0.05),
                    w_hh: Array2::zeros((4 * hidden, hidden)),
                    bias: Array1::zeros(4 * hidden),
                },
                head: FeedForward::new(vec![Layer::linear(
                    array![[1.0, 0.0, 0.0], [0.0, -1.0, 0.0]],
                    array![0.0, 0.0],
                )]),
            },
        }
    }

    #[test]
    fn test_recurrent_model() {
        let channels = 2;
        let id = FaultIdentifier::new(recurrent_artifact(channels)).expect("identifier");
        let mut buf = TrajectoryBuffer::new(5, channels, channels);
        fill(&mut buf, array![1.0, 1.0]);
        let report = id.identify(&buf).expect("report");
        assert_eq!(report.confidences.len(), channels);
        assert_eq!(report.candidate, 1);
        assert!(report.confidences[0] > 0.5);
    }

    #[test]
    fn test_both_families_load_from_bincode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channels = 2;
        for (name, artifact) in [
            ("feedforward.bin", shortfall_identifier(5, channels)),
            ("recurrent.bin", recurrent_artifact(channels)),
        ] {
            let path = dir.path().join(name);
            save(&artifact, &path).expect("save");
            let back: IdentifierArtifact = load(&path).expect("load");
            assert!(back.validate().is_ok(), "{name}");

            let mut buf = TrajectoryBuffer::new(5, channels, channels);
            fill(&mut buf, array![0.0, 0.2]);
            let before = FaultIdentifier::new(artifact).expect("identifier").identify(&buf);
            let after = FaultIdentifier::new(back).expect("identifier").identify(&buf);
            assert_eq!(before, after, "{name}");
        }
    }

    #[test]
    fn test_validation_rejects_wrong_output_width() {
        let mut art = shortfall_identifier(4, 2);
        art.control_dim = 3;
        assert!(matches!(
            FaultIdentifier::new(art),
            Err(StartupError::Incompatible { .. })
        ));
        let mut art = shortfall_identifier(4, 2);
        art.window_len = 5;
        assert!(art.validate().is_err());
    }

    #[test]
    fn test_report_argmin_and_loss() {
        let r = IdentifierReport::from_confidences(array![0.9, 0.3, 0.6]).expect("report");
        assert_eq!(r.candidate, 1);
        assert!((r.min_confidence - 0.3).abs() < 1e-12);
        let loss = r.loss_estimate();
        assert!((loss[1] - 0.7).abs() < 1e-12);
        assert!(IdentifierReport::from_confidences(Array1::zeros(0)).is_none());
    }
}
