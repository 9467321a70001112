//! The two certificates and the tag that selects between them.

use serde::{Deserialize, Serialize};

use super::oracle::BarrierOracle;
use crate::error::StartupError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateVariant {
    Nominal,
    /// Valid with one actuation channel unavailable.
    FaultTolerant,
}

/// Nominal and fault-tolerant oracles over the same state space.
#[derive(Clone, Debug)]
pub struct CertificatePair {
    nominal: BarrierOracle,
    fault_tolerant: BarrierOracle,
}

impl CertificatePair {
    pub fn new(
        nominal: BarrierOracle,
        fault_tolerant: BarrierOracle,
    ) -> Result<Self, StartupError> {
        if nominal.state_dim() != fault_tolerant.state_dim() {
            return Err(StartupError::Incompatible {
                kind: "certificate pair".to_string(),
                reason: format!(
                    "nominal expects {} states, fault-tolerant expects {}",
                    nominal.state_dim(),
                    fault_tolerant.state_dim()
                ),
            });
        }
        Ok(Self {
            nominal,
            fault_tolerant,
        })
    }

    pub fn get(&self, variant: CertificateVariant) -> &BarrierOracle {
        match variant {
            CertificateVariant::Nominal => &self.nominal,
            CertificateVariant::FaultTolerant => &self.fault_tolerant,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.nominal.state_dim()
    }
}
