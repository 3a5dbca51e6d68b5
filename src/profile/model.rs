//! System epoch and device model measurements.

use super::stub::KERNEL_CONFIG_PCR;
use super::{ProfileConstructionError, ProtectionProfile, Result};
use crate::model::{system_epoch_digest, ModelAssertion, SYSTEM_EPOCH};
use crate::tpm::pcr::HashAlgorithm;

#[derive(Debug, Clone)]
pub struct ModelProfileParams {
    pub pcr_index: u32,
    /// Every model the key may be unsealed on.
    pub models: Vec<ModelAssertion>,
}

impl Default for ModelProfileParams {
    fn default() -> Self {
        Self {
            pcr_index: KERNEL_CONFIG_PCR,
            models: Vec::new(),
        }
    }
}

/// Predicts what the boot-time measurer extends: the current system epoch,
/// then one of `params.models`.
pub fn add_model_profile(
    profile: &mut ProtectionProfile,
    bank: HashAlgorithm,
    params: &ModelProfileParams,
) -> Result<()> {
    if params.models.is_empty() {
        return Err(ProfileConstructionError::MissingParameter("models"));
    }
    let alternatives = params
        .models
        .iter()
        .map(|model| -> Result<ProtectionProfile> {
            model.validate()?;
            let mut branch = ProtectionProfile::new();
            branch.extend_pcr(bank, params.pcr_index, model.digest(bank))?;
            Ok(branch)
        })
        .collect::<Result<Vec<_>>>()?;
    profile
        .extend_pcr(bank, params.pcr_index, system_epoch_digest(bank, SYSTEM_EPOCH))?
        .add_profile_or(alternatives)?;
    Ok(())
}
