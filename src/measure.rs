//! Boot-time measurements of the system epoch and device model.
//!
//! Both are extended into every active PCR bank. Nothing here prevents a
//! measurement from being made twice; the boot sequence in [`crate::boot`]
//! makes each exactly once.

use crate::model::{system_epoch_digest, ModelAssertion, ModelError, SYSTEM_EPOCH};
use crate::tpm::pcr::{Digest, HashAlgorithm, PcrBank};
use crate::tpm::TpmError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("cannot measure {what} into PCR {pcr}: {source}")]
    Tpm {
        what: &'static str,
        pcr: u32,
        #[source]
        source: TpmError,
    },
    #[error("cannot measure model: {0}")]
    InvalidModel(#[from] ModelError),
}

impl MeasurementError {
    pub fn pcr(&self) -> Option<u32> {
        match self {
            MeasurementError::Tpm { pcr, .. } => Some(*pcr),
            MeasurementError::InvalidModel(_) => None,
        }
    }
}

pub type Result<T, E = MeasurementError> = core::result::Result<T, E>;

fn extend_all_banks<T, F>(tpm: &mut T, pcr: u32, what: &'static str, digest: F) -> Result<()>
where
    T: PcrBank + ?Sized,
    F: Fn(HashAlgorithm) -> Digest,
{
    let tpm_error = |source: TpmError| MeasurementError::Tpm { what, pcr, source };
    let digests: Vec<_> = tpm
        .active_banks()
        .map_err(tpm_error)?
        .into_iter()
        .map(|bank| (bank, digest(bank)))
        .collect();
    tpm.pcr_extend(pcr, &digests).map_err(tpm_error)?;
    log::info!("Measured {} into PCR {}", what, pcr);
    Ok(())
}

/// Extends the current system epoch into `pcr`.
pub fn measure_system_epoch<T: PcrBank + ?Sized>(tpm: &mut T, pcr: u32) -> Result<()> {
    extend_all_banks(tpm, pcr, "system epoch", |bank| {
        system_epoch_digest(bank, SYSTEM_EPOCH)
    })
}

/// Extends the digest of a verified model assertion into `pcr`.
pub fn measure_model<T: PcrBank + ?Sized>(
    tpm: &mut T,
    pcr: u32,
    model: &ModelAssertion,
) -> Result<()> {
    model.validate()?;
    log::debug!("Model {}/{} grade {:?}", model.brand_id, model.model, model.grade);
    extend_all_banks(tpm, pcr, "model", |bank| model.digest(bank))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_model;
    use crate::tpm::pcr::PcrSelection;
    use crate::tpm::sim::SimulatedTpm;
    use eyre::Result;

    fn read(tpm: &mut SimulatedTpm, bank: HashAlgorithm, pcr: u32) -> Result<Digest> {
        let selection = PcrSelection::new().with_selection(bank, &[pcr])?;
        Ok(tpm.pcr_read(&selection)?.remove(0))
    }

    #[test]
    fn extends_every_active_bank() -> Result<()> {
        let banks = [HashAlgorithm::Sha256, HashAlgorithm::Sha384];
        let mut tpm = SimulatedTpm::with_banks(&banks);
        let model = test_model("pc");
        measure_system_epoch(&mut tpm, 12)?;
        measure_model(&mut tpm, 12, &model)?;
        for bank in banks {
            let epoch = bank.extend(&bank.zero_digest(), &system_epoch_digest(bank, SYSTEM_EPOCH));
            assert_eq!(read(&mut tpm, bank, 12)?, bank.extend(&epoch, &model.digest(bank)));
        }
        Ok(())
    }

    #[test]
    fn measuring_twice_extends_twice() -> Result<()> {
        let mut tpm = SimulatedTpm::new();
        let bank = HashAlgorithm::Sha256;
        measure_system_epoch(&mut tpm, 12)?;
        let once = read(&mut tpm, bank, 12)?;
        measure_system_epoch(&mut tpm, 12)?;
        assert_eq!(
            read(&mut tpm, bank, 12)?,
            bank.extend(&once, &system_epoch_digest(bank, SYSTEM_EPOCH))
        );
        Ok(())
    }

    #[test]
    fn failures_name_the_pcr() -> Result<()> {
        let mut tpm = SimulatedTpm::new();
        tpm.fail_pcr_extend(true);
        let err = measure_system_epoch(&mut tpm, 12).unwrap_err();
        assert_eq!(err.pcr(), Some(12));
        assert!(err.to_string().contains("system epoch"));

        tpm.fail_pcr_extend(false);
        let err = measure_model(&mut tpm, 30, &test_model("pc")).unwrap_err();
        assert!(matches!(
            err,
            MeasurementError::Tpm {
                source: TpmError::PcrError(_),
                ..
            }
        ));

        let mut model = test_model("pc");
        model.model.clear();
        assert!(matches!(
            measure_model(&mut tpm, 12, &model),
            Err(MeasurementError::InvalidModel(_))
        ));
        Ok(())
    }
}
