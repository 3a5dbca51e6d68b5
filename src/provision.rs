//! Taking ownership of the TPM.

use crate::tpm::{DaParameters, Provisioning, TpmError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionMode {
    /// Clear the TPM, then provision it from scratch. Every key sealed
    /// before becomes permanently unusable.
    Full,
    /// Do nothing if already provisioned, otherwise as [`PreserveData`].
    ///
    /// [`PreserveData`]: ProvisionMode::PreserveData
    IfNeeded,
    /// Provision without clearing. Keys sealed before stay usable.
    PreserveData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    ReadStatus,
    Clear,
    CreateStorageRoot,
    DictionaryAttackParameters,
    ChangeLockoutAuth,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            ProvisionStep::ReadStatus => "reading provisioning status",
            ProvisionStep::Clear => "clearing the TPM",
            ProvisionStep::CreateStorageRoot => "creating the storage root key",
            ProvisionStep::DictionaryAttackParameters => {
                "configuring dictionary attack protection"
            }
            ProvisionStep::ChangeLockoutAuth => "changing the lockout authorization",
        };
        f.write_str(step)
    }
}

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("the TPM is in dictionary attack lockout mode")]
    Lockout,
    #[error("the lockout hierarchy authorization value is incorrect")]
    LockoutAuthInvalid,
    #[error("an empty lockout authorization value cannot protect the TPM")]
    EmptyLockoutAuth,
    #[error("TPM error while {step}: {source}")]
    Tpm {
        step: ProvisionStep,
        #[source]
        source: TpmError,
    },
}

impl ProvisioningError {
    fn at(step: ProvisionStep) -> impl Fn(TpmError) -> Self {
        move |source| match source {
            TpmError::Lockout => ProvisioningError::Lockout,
            TpmError::AuthFail(_) => ProvisioningError::LockoutAuthInvalid,
            source => ProvisioningError::Tpm { step, source },
        }
    }
}

pub type Result<T, E = ProvisioningError> = core::result::Result<T, E>;

/// Provisions a TPM whose lockout hierarchy has no authorization value,
/// e.g. one that was just cleared from the firmware.
pub fn provision_tpm<T>(tpm: &mut T, mode: ProvisionMode, new_lockout_auth: &[u8]) -> Result<()>
where
    T: Provisioning + ?Sized,
{
    provision_tpm_with_auth(tpm, mode, &[], new_lockout_auth)
}

/// Provisions the TPM, authorizing lockout hierarchy commands with
/// `current_lockout_auth` and setting it to `new_lockout_auth` afterwards.
pub fn provision_tpm_with_auth<T>(
    tpm: &mut T,
    mode: ProvisionMode,
    current_lockout_auth: &[u8],
    new_lockout_auth: &[u8],
) -> Result<()>
where
    T: Provisioning + ?Sized,
{
    provision_tpm_with_parameters(
        tpm,
        mode,
        current_lockout_auth,
        new_lockout_auth,
        &DaParameters::default(),
    )
}

#[tracing::instrument(skip(tpm, current_lockout_auth, new_lockout_auth))]
pub fn provision_tpm_with_parameters<T>(
    tpm: &mut T,
    mode: ProvisionMode,
    current_lockout_auth: &[u8],
    new_lockout_auth: &[u8],
    da_parameters: &DaParameters,
) -> Result<()>
where
    T: Provisioning + ?Sized,
{
    if new_lockout_auth.is_empty() {
        return Err(ProvisioningError::EmptyLockoutAuth);
    }
    let status = tpm
        .provision_status()
        .map_err(ProvisioningError::at(ProvisionStep::ReadStatus))?;
    if status.in_lockout {
        return Err(ProvisioningError::Lockout);
    }
    if mode == ProvisionMode::IfNeeded && status.is_complete() {
        log::info!("TPM is already provisioned");
        return Ok(());
    }

    let mut lockout_auth = current_lockout_auth;
    if mode == ProvisionMode::Full {
        log::warn!("Clearing the TPM, previously sealed keys will be lost");
        tpm.clear(lockout_auth)
            .map_err(ProvisioningError::at(ProvisionStep::Clear))?;
        lockout_auth = &[];
    }
    if mode == ProvisionMode::Full || !status.storage_root {
        tpm.create_storage_root()
            .map_err(ProvisioningError::at(ProvisionStep::CreateStorageRoot))?;
    }
    tpm.set_dictionary_attack_parameters(lockout_auth, da_parameters)
        .map_err(ProvisioningError::at(ProvisionStep::DictionaryAttackParameters))?;
    tpm.change_lockout_auth(lockout_auth, new_lockout_auth)
        .map_err(ProvisioningError::at(ProvisionStep::ChangeLockoutAuth))?;
    log::info!("TPM provisioned ({:?})", mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seal::tests::{seal_for_model, TEST_KEY};
    use crate::seal::{seal_key_to_tpm, SealingError};
    use crate::tpm::sim::SimulatedTpm;
    use crate::tpm::Sealing;
    use eyre::Result;

    #[test]
    fn full_provisioning() -> Result<()> {
        let mut tpm = SimulatedTpm::new();
        provision_tpm(&mut tpm, ProvisionMode::Full, b"secret")?;
        let status = tpm.provision_status()?;
        assert!(status.is_complete());
        assert!(tpm.get_random(8).is_ok());
        Ok(())
    }

    #[test]
    fn custom_dictionary_attack_parameters() -> Result<()> {
        let mut tpm = SimulatedTpm::new();
        provision_tpm(&mut tpm, ProvisionMode::Full, b"secret")?;
        assert_eq!(tpm.da_parameters(), Some(DaParameters::default()));

        let params = DaParameters {
            max_tries: 3,
            recovery_time: 60,
            lockout_recovery: 600,
        };
        provision_tpm_with_parameters(
            &mut tpm,
            ProvisionMode::PreserveData,
            b"secret",
            b"secret",
            &params,
        )?;
        assert_eq!(tpm.da_parameters(), Some(params));
        Ok(())
    }

    #[test]
    fn full_provisioning_invalidates_sealed_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tpm = SimulatedTpm::new();
        provision_tpm(&mut tpm, ProvisionMode::Full, b"secret")?;
        let paths = seal_for_model(&mut tpm, &dir, "pc")?;
        let key = crate::keydata::SealedKeyObject::read(&paths.key)?;

        provision_tpm_with_auth(&mut tpm, ProvisionMode::Full, b"secret", b"new secret")?;
        assert!(matches!(
            tpm.unseal(&key.sealed, &[]),
            Err(TpmError::ObjectIntegrity)
        ));
        Ok(())
    }

    #[test]
    fn preserve_data_keeps_sealed_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tpm = SimulatedTpm::new();
        tpm.create_storage_root()?;
        let paths = seal_for_model(&mut tpm, &dir, "pc")?;
        let key = crate::keydata::SealedKeyObject::read(&paths.key)?;

        provision_tpm(&mut tpm, ProvisionMode::PreserveData, b"secret")?;
        assert!(tpm.provision_status()?.is_complete());
        // the object still loads; only the policy is unsatisfied
        assert!(matches!(
            tpm.unseal(&key.sealed, &[]),
            Err(TpmError::PolicyCheck(_))
        ));
        Ok(())
    }

    #[test]
    fn if_needed_is_a_noop_when_provisioned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut tpm = SimulatedTpm::new();
        provision_tpm(&mut tpm, ProvisionMode::IfNeeded, b"secret")?;
        let paths = seal_for_model(&mut tpm, &dir, "pc")?;
        // the lockout auth is no longer empty, so anything but a no-op fails
        provision_tpm(&mut tpm, ProvisionMode::IfNeeded, b"other")?;
        let key = crate::keydata::SealedKeyObject::read(&paths.key)?;
        assert!(matches!(
            tpm.unseal(&key.sealed, &[]),
            Err(TpmError::PolicyCheck(_))
        ));
        Ok(())
    }

    #[test]
    fn lockout_failures() -> Result<()> {
        let mut tpm = SimulatedTpm::new();
        provision_tpm(&mut tpm, ProvisionMode::Full, b"secret")?;
        assert!(matches!(
            provision_tpm_with_auth(&mut tpm, ProvisionMode::Full, b"wrong", b"new"),
            Err(ProvisioningError::LockoutAuthInvalid)
        ));
        assert!(matches!(
            provision_tpm(&mut tpm, ProvisionMode::Full, b""),
            Err(ProvisioningError::EmptyLockoutAuth)
        ));
        tpm.set_lockout(true);
        assert!(matches!(
            provision_tpm_with_auth(&mut tpm, ProvisionMode::Full, b"secret", b"new"),
            Err(ProvisioningError::Lockout)
        ));
        Ok(())
    }

    #[test]
    fn sealing_requires_provisioning() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = crate::seal::tests::key_paths(&dir);
        let profile = crate::seal::tests::model_profile(&[crate::model::test_model("pc")])?;
        let mut tpm = SimulatedTpm::new();
        assert!(matches!(
            seal_key_to_tpm(&mut tpm, &TEST_KEY, &profile, &paths),
            Err(SealingError::NotProvisioned)
        ));
        provision_tpm(&mut tpm, ProvisionMode::IfNeeded, b"secret")?;
        seal_key_to_tpm(&mut tpm, &TEST_KEY, &profile, &paths)?;
        Ok(())
    }

    #[test]
    fn step_is_reported() {
        let mut tpm = SimulatedTpm::new();
        tpm.set_unavailable(true);
        let err = provision_tpm(&mut tpm, ProvisionMode::Full, b"secret").unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::Tpm {
                step: ProvisionStep::ReadStatus,
                ..
            }
        ));
        assert!(err.to_string().contains("reading provisioning status"));
    }
}
