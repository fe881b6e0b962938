use std::io::Read;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::{ForeachOp, BLOCK_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Capacity model has zero compute units.")]
    ZeroUnits,
    #[error("Capacity model has no usable scratch (budget {budget}, reserved {reserved}).")]
    ZeroBudget { budget: usize, reserved: usize },
    #[error("Alignment {0} must be a power of two and at least 8 bytes.")]
    Alignment(usize),
    #[error("Failed to parse hardware profile: {0}")]
    Profile(#[from] serde_json::Error),
    #[error("Reserve table has no entry for {0}.")]
    MissingReserve(ForeachOp),
}

/// # CapacityModel
///
/// Immutable description of one hardware target for a planning call.
/// `scratch_budget` is what a single unit may actually use; fixed hardware reservations are
/// removed when the model is built from a [`HardwareProfile`] and never subtracted again.
#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct CapacityModel {
    pub unit_count: usize,
    pub scratch_budget: usize,
    pub alignment: usize,
    /// Target supports the merged small-row reduction path.
    pub merged_rows: bool,
}

impl CapacityModel {
    pub const MIN_ALIGNMENT: usize = 8;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit_count == 0 {
            return Err(ConfigError::ZeroUnits);
        }
        if self.scratch_budget == 0 {
            return Err(ConfigError::ZeroBudget {
                budget: 0,
                reserved: 0,
            });
        }
        if !self.alignment.is_power_of_two() || self.alignment < Self::MIN_ALIGNMENT {
            return Err(ConfigError::Alignment(self.alignment));
        }
        Ok(())
    }

    /// Alignment expressed in elements of the given width.
    pub fn alignment_elements(&self, width: usize) -> usize {
        (self.alignment / width.max(1)).max(1)
    }
}

fn default_alignment() -> usize {
    BLOCK_BYTES
}

/// On-disk description of a hardware target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub name: String,
    pub unit_count: usize,
    pub scratch_bytes: usize,
    #[serde(default)]
    pub reserved_bytes: usize,
    #[serde(default = "default_alignment")]
    pub alignment: usize,
    #[serde(default)]
    pub merged_rows: bool,
}

impl HardwareProfile {
    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            unit_count: 48,
            scratch_bytes: 196_608,
            reserved_bytes: 0,
            alignment: BLOCK_BYTES,
            merged_rows: true,
        }
    }

    pub fn regbase() -> Self {
        Self {
            name: "regbase".to_string(),
            unit_count: 64,
            scratch_bytes: 253_952,
            reserved_bytes: 0,
            alignment: BLOCK_BYTES,
            merged_rows: false,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "standard" => Some(Self::standard()),
            "regbase" => Some(Self::regbase()),
            _ => None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn capacity(&self) -> Result<CapacityModel, ConfigError> {
        CapacityModel::try_from(self)
    }
}

impl TryFrom<&HardwareProfile> for CapacityModel {
    type Error = ConfigError;

    fn try_from(profile: &HardwareProfile) -> Result<Self, Self::Error> {
        let budget = profile
            .scratch_bytes
            .checked_sub(profile.reserved_bytes)
            .filter(|b| *b > 0)
            .ok_or(ConfigError::ZeroBudget {
                budget: profile.scratch_bytes,
                reserved: profile.reserved_bytes,
            })?;
        let model = CapacityModel::new(
            profile.unit_count,
            budget,
            profile.alignment,
            profile.merged_rows,
        );
        model.validate()?;
        log::debug!("Loaded profile {}: {model:?}", profile.name);
        Ok(model)
    }
}
