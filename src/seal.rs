//! Sealing disk keys to a PCR protection profile.

use crate::keydata::{DynamicPolicy, KeyDataError, PolicyUpdateData, SealedKeyObject};
use crate::lock::DEFAULT_LOCK_PCR;
use crate::profile::{ProfileConstructionError, ProtectionProfile};
use crate::tpm::pcr::PcrSelection;
use crate::tpm::policy;
use crate::tpm::{Provisioning, Sealing, TpmError};
use p256::ecdsa::SigningKey;
use std::path::PathBuf;
use thiserror::Error;

/// Size of the disk keys that are sealed.
pub const SEALED_KEY_SIZE: usize = 32;

/// Policy reference bound into the static auth policy of every sealed key.
pub const PCR_POLICY_REF: &[u8] = b"tpm-secboot pcr policy";

#[derive(Error, Debug)]
pub enum SealingError {
    #[error("TPM is not provisioned")]
    NotProvisioned,
    #[error("key must be {SEALED_KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("cannot compute PCR policy: {0}")]
    Profile(#[from] ProfileConstructionError),
    #[error("PCR policy over {selection} does not include lock PCR {pcr}")]
    LockPcrNotSelected { selection: PcrSelection, pcr: u32 },
    #[error("TPM error while {operation}: {source}")]
    Tpm {
        operation: &'static str,
        #[source]
        source: TpmError,
    },
    #[error(transparent)]
    KeyData(#[from] KeyDataError),
}

pub type Result<T, E = SealingError> = core::result::Result<T, E>;

fn tpm_error(operation: &'static str) -> impl FnOnce(TpmError) -> SealingError {
    move |source| match source {
        TpmError::NotProvisioned => SealingError::NotProvisioned,
        source => SealingError::Tpm { operation, source },
    }
}

/// Where a sealed key and its policy update data are stored, and the PCR
/// that locks the key away after boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilePaths {
    pub key: PathBuf,
    pub policy_update: PathBuf,
    pub lock_pcr: u32,
}

impl KeyFilePaths {
    pub fn new(key: impl Into<PathBuf>, policy_update: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            policy_update: policy_update.into(),
            lock_pcr: DEFAULT_LOCK_PCR,
        }
    }

    pub fn with_lock_pcr(mut self, pcr: u32) -> Self {
        self.lock_pcr = pcr;
        self
    }
}

/// A policy that ignores the lock PCR would survive locking.
fn check_lock_pcr(selection: &PcrSelection, pcr: u32) -> Result<()> {
    if selection.iter().any(|(_, selected)| selected == pcr) {
        return Ok(());
    }
    Err(SealingError::LockPcrNotSelected {
        selection: selection.clone(),
        pcr,
    })
}

/// Seals `key` so that it can only be unsealed while the PCRs hold values
/// predicted by one branch of `profile`. The profile must select
/// `paths.lock_pcr`.
///
/// The sealed object's auth policy does not depend on `profile`. It
/// delegates to a PCR policy signed with a key generated here, so that
/// [`update_key_pcr_protection_policy`] can later authorize another profile.
#[tracing::instrument(skip_all, fields(key = %paths.key.display()))]
pub fn seal_key_to_tpm<T>(
    tpm: &mut T,
    key: &[u8],
    profile: &ProtectionProfile,
    paths: &KeyFilePaths,
) -> Result<()>
where
    T: Provisioning + Sealing + ?Sized,
{
    if key.len() != SEALED_KEY_SIZE {
        return Err(SealingError::InvalidKeyLength(key.len()));
    }
    let status = tpm
        .provision_status()
        .map_err(tpm_error("reading provisioning status"))?;
    if !status.storage_root {
        return Err(SealingError::NotProvisioned);
    }
    let (selection, leaves) = profile.pcr_policy_digests()?;
    check_lock_pcr(&selection, paths.lock_pcr)?;
    log::info!(
        "Sealing key to {} PCR policy branches over {}",
        leaves.len(),
        selection
    );

    let auth_key = SigningKey::random(&mut rand::rngs::OsRng);
    let auth_key_name = policy::object_name(&policy::auth_key_public_area(auth_key.verifying_key()));
    let auth_policy = policy::policy_authorize(&auth_key_name, PCR_POLICY_REF);

    let sealed = tpm
        .create_sealed_object(key, &auth_policy)
        .map_err(tpm_error("creating sealed object"))?;
    let pcr_policy = DynamicPolicy::sign(selection, leaves, 0, PCR_POLICY_REF, &auth_key)?;

    let staged_update = PolicyUpdateData::new(&sealed, &auth_key).stage(&paths.policy_update)?;
    let staged_key = SealedKeyObject::new(sealed, &auth_key, pcr_policy).stage(&paths.key)?;
    staged_key.commit()?;
    staged_update.commit()?;
    log::info!("Sealed key written to {}", paths.key.display());
    Ok(())
}

/// Authorizes `profile` for an already sealed key, replacing its current PCR
/// policy. The sealed object itself is untouched.
#[tracing::instrument(skip_all, fields(key = %paths.key.display()))]
pub fn update_key_pcr_protection_policy(
    paths: &KeyFilePaths,
    profile: &ProtectionProfile,
) -> Result<()> {
    let key = SealedKeyObject::read(&paths.key)?;
    let update = PolicyUpdateData::read(&paths.policy_update)?;
    update.check_pairing(&key)?;

    let (selection, leaves) = profile.pcr_policy_digests()?;
    check_lock_pcr(&selection, paths.lock_pcr)?;
    let generation = key.policy.generation + 1;
    let pcr_policy = DynamicPolicy::sign(
        selection,
        leaves,
        generation,
        &key.policy.policy_ref,
        &update.signing_key()?,
    )?;
    let SealedKeyObject {
        sealed,
        auth_public_key,
        version,
        ..
    } = key;
    SealedKeyObject {
        version,
        sealed,
        auth_public_key,
        policy: pcr_policy,
    }
    .write(&paths.key)?;
    log::info!("PCR policy of {} updated to generation {}", paths.key.display(), generation);
    Ok(())
}
