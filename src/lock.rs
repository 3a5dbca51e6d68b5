//! Fencing off sealed keys for the rest of the boot.

use crate::profile::KERNEL_CONFIG_PCR;
use crate::tpm::pcr::{Digest, PcrBank};
use crate::tpm::{Sealing, TpmError};
use thiserror::Error;

/// Sealing refuses PCR policies that do not select the lock PCR, so fencing
/// that one PCR is enough.
pub const DEFAULT_LOCK_PCR: u32 = KERNEL_CONFIG_PCR;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("cannot lock access to sealed keys through PCR {pcr}: {source}")]
    Tpm {
        pcr: u32,
        #[source]
        source: TpmError,
    },
}

/// Extends a random value into `pcr` in every active bank. Until the next
/// platform reset the PCR cannot hold any value a sealed key policy
/// predicts, so no sealed key bound to it can be unsealed.
#[tracing::instrument(skip(tpm))]
pub fn lock_access_to_sealed_keys<T>(tpm: &mut T, pcr: u32) -> Result<(), LockError>
where
    T: PcrBank + Sealing + ?Sized,
{
    let tpm_error = |source: TpmError| LockError::Tpm { pcr, source };
    let banks = tpm.active_banks().map_err(tpm_error)?;
    let mut fence = Vec::with_capacity(banks.len());
    for bank in banks {
        let value = tpm.get_random(bank.digest_size()).map_err(tpm_error)?;
        fence.push((bank, Digest::from(value)));
    }
    tpm.pcr_extend(pcr, &fence).map_err(tpm_error)?;
    log::info!("Access to sealed keys locked through PCR {}", pcr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keydata::SealedKeyObject;
    use crate::measure::{measure_model, measure_system_epoch};
    use crate::model::test_model;
    use crate::seal::tests::{provisioned_tpm, seal_for_model};
    use eyre::Result;

    #[test]
    fn lock_blocks_unseal_until_reset() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tpm = provisioned_tpm()?;
        let paths = seal_for_model(&mut tpm, &dir, "pc")?;
        let key = SealedKeyObject::read(&paths.key)?;

        for _ in 0..2 {
            measure_system_epoch(&mut tpm, DEFAULT_LOCK_PCR)?;
            measure_model(&mut tpm, DEFAULT_LOCK_PCR, &test_model("pc"))?;
            let values = tpm.pcr_read(&key.policy.selection)?;
            let steps = key.unseal_policy(&values)?.expect("matching branch");
            tpm.unseal(&key.sealed, &steps)?;

            lock_access_to_sealed_keys(&mut tpm, DEFAULT_LOCK_PCR)?;
            let values = tpm.pcr_read(&key.policy.selection)?;
            assert!(key.unseal_policy(&values)?.is_none());
            // replaying the policy of the unlocked state is refused by the TPM
            assert!(tpm.unseal(&key.sealed, &steps).is_err());

            tpm.platform_reset();
        }
        Ok(())
    }

    #[test]
    fn lock_failure_is_reported() {
        let mut tpm = crate::tpm::sim::SimulatedTpm::new();
        tpm.set_unavailable(true);
        assert!(matches!(
            lock_access_to_sealed_keys(&mut tpm, DEFAULT_LOCK_PCR),
            Err(LockError::Tpm { pcr: 12, .. })
        ));
    }
}
