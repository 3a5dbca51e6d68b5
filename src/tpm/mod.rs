use self::pcr::{Digest, PcrBank, PcrError};
use self::policy::{PolicyError, PolicyStep};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(feature = "tpm2")]
pub mod device;
// `sim` delegates `PcrBank` through the macro `#[delegatable_trait]` defines
#[macro_use]
pub mod pcr;
pub mod policy;
pub mod sim;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM is unavailable: {0}")]
    Unavailable(String),
    #[error("TPM is in dictionary attack lockout mode")]
    Lockout,
    #[error("authorization failed for the {0} hierarchy")]
    AuthFail(&'static str),
    #[error("TPM storage hierarchy is not provisioned")]
    NotProvisioned,
    #[error("policy check failed: {0}")]
    PolicyCheck(String),
    #[error("sealed object cannot be loaded under the current storage hierarchy")]
    ObjectIntegrity,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("TPM I/O failure")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    PcrError(#[from] PcrError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[cfg(feature = "tpm2")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

impl TpmError {
    /// The TPM cannot be used at all for the rest of this boot.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TpmError::Unavailable(_) | TpmError::Lockout | TpmError::NotProvisioned
        )
    }
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// A sealed data object as returned by TPM2_Create, marshalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedObject {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl SealedObject {
    pub fn name(&self) -> Vec<u8> {
        policy::object_name(&self.public)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionStatus {
    pub storage_root: bool,
    pub lockout_auth_set: bool,
    pub dictionary_attack_protection: bool,
    pub in_lockout: bool,
}

impl ProvisionStatus {
    pub fn is_complete(&self) -> bool {
        self.storage_root && self.lockout_auth_set && self.dictionary_attack_protection
    }
}

/// Dictionary attack protection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaParameters {
    pub max_tries: u32,
    /// seconds
    pub recovery_time: u32,
    /// seconds
    pub lockout_recovery: u32,
}

impl Default for DaParameters {
    fn default() -> Self {
        Self {
            max_tries: 32,
            recovery_time: 7200,
            lockout_recovery: 86400,
        }
    }
}

/// Ownership and lockout management.
pub trait Provisioning {
    fn provision_status(&mut self) -> Result<ProvisionStatus>;

    /// TPM2_Clear authorized by the lockout hierarchy. Replaces the storage
    /// seed, so every object created under the old one becomes unloadable.
    fn clear(&mut self, lockout_auth: &[u8]) -> Result<()>;

    /// Creates and persists the storage root key, if absent.
    fn create_storage_root(&mut self) -> Result<()>;

    fn set_dictionary_attack_parameters(
        &mut self,
        lockout_auth: &[u8],
        params: &DaParameters,
    ) -> Result<()>;

    fn change_lockout_auth(&mut self, current: &[u8], new: &[u8]) -> Result<()>;
}

/// Creation and policy-gated release of sealed data objects.
pub trait Sealing {
    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>>;

    /// Seals `data` under the storage root with `auth_policy`.
    fn create_sealed_object(&mut self, data: &[u8], auth_policy: &Digest) -> Result<SealedObject>;

    /// Runs `policy` in a fresh policy session and unseals `object` with it.
    fn unseal(&mut self, object: &SealedObject, policy: &[PolicyStep])
        -> Result<Zeroizing<Vec<u8>>>;
}

pub trait Tpm: PcrBank + Provisioning + Sealing {
    /// Runs when a connection to this TPM is released.
    fn release(&mut self) {}
}

/// A TPM shared by everything in the process. Access is serialised.
pub struct SharedTpm<T: Tpm> {
    inner: Mutex<T>,
}

impl<T: Tpm> SharedTpm<T> {
    pub fn new(tpm: T) -> Self {
        Self {
            inner: Mutex::new(tpm),
        }
    }

    /// Blocks until no other connection is open.
    pub fn connect(&self) -> TpmConnection<'_, T> {
        let tpm = self.inner.lock().unwrap_or_else(|poisoned| {
            log::warn!("Previous TPM connection was abandoned by a panic");
            poisoned.into_inner()
        });
        log::debug!("TPM connection opened");
        TpmConnection { tpm }
    }

    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An open connection. Dropping it releases the TPM.
pub struct TpmConnection<'a, T: Tpm> {
    tpm: MutexGuard<'a, T>,
}

impl<T: Tpm> Deref for TpmConnection<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.tpm
    }
}

impl<T: Tpm> DerefMut for TpmConnection<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tpm
    }
}

impl<T: Tpm> Drop for TpmConnection<'_, T> {
    fn drop(&mut self) {
        self.tpm.release();
        log::debug!("TPM connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::pcr::HashAlgorithm;
    use super::sim::SimulatedTpm;
    use super::*;
    use eyre::Result;
    use std::sync::Arc;

    fn failing_operation(tpm: &SharedTpm<SimulatedTpm>) -> Result<()> {
        let mut conn = tpm.connect();
        conn.pcr_extend(7, &[(HashAlgorithm::Sha256, Digest::from(vec![1u8; 3]))])?;
        Ok(())
    }

    #[test]
    fn connection_released_on_error() -> Result<()> {
        let tpm = SharedTpm::new(SimulatedTpm::new());
        assert!(failing_operation(&tpm).is_err());
        assert!(failing_operation(&tpm).is_err());
        assert_eq!(tpm.connect().connections_released(), 2);
        Ok(())
    }

    #[test]
    fn connections_are_serialised() -> Result<()> {
        let tpm = Arc::new(SharedTpm::new(SimulatedTpm::new()));
        let measurement = HashAlgorithm::Sha256.hash(b"event");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tpm = Arc::clone(&tpm);
                let measurement = measurement.clone();
                std::thread::spawn(move || {
                    let mut conn = tpm.connect();
                    conn.pcr_extend(16, &[(HashAlgorithm::Sha256, measurement)])
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked")?;
        }
        let tpm = Arc::try_unwrap(tpm).ok().expect("no other references");
        assert_eq!(tpm.into_inner().connections_released(), 4);
        Ok(())
    }
}
