//! A software TPM.
//!
//! Implements the same capabilities as a hardware TPM with the same digest
//! arithmetic, so that policies computed for one are satisfied by the other.
//! State lives in memory only; [`SimulatedTpm::platform_reset`] stands in for
//! a reboot.

use super::pcr::{Digest, HashAlgorithm, PcrBank, PcrRegisters, PcrSelection};
use super::policy::{self, PolicyStep, POLICY_OR_MAX_DIGESTS};
use super::{DaParameters, ProvisionStatus, Provisioning, Result, SealedObject, Sealing, Tpm, TpmError};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ambassador::Delegate;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Largest object TPM2_Create accepts as sealed data.
const MAX_SEALED_DATA: usize = 128;
const NONCE_SIZE: usize = 12;

/// PCR bank with fault injection.
#[derive(Debug)]
pub struct SimulatedPcrs {
    registers: PcrRegisters,
    unavailable: bool,
    fail_extend: bool,
}

impl SimulatedPcrs {
    fn check(&self) -> Result<()> {
        if self.unavailable {
            return Err(TpmError::Unavailable("simulated device removed".into()));
        }
        Ok(())
    }
}

impl PcrBank for SimulatedPcrs {
    fn active_banks(&mut self) -> Result<Vec<HashAlgorithm>> {
        self.check()?;
        self.registers.active_banks()
    }

    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<Vec<Digest>> {
        self.check()?;
        self.registers.pcr_read(selection)
    }

    fn pcr_extend(&mut self, pcr: u32, digests: &[(HashAlgorithm, Digest)]) -> Result<()> {
        self.check()?;
        if self.fail_extend {
            return Err(TpmError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated PCR_Extend failure",
            )));
        }
        self.registers.pcr_extend(pcr, digests)
    }
}

#[derive(Serialize, Deserialize)]
struct SimPublic {
    auth_policy: Vec<u8>,
    unique: Vec<u8>,
}

#[derive(Delegate)]
#[delegate(PcrBank, target = "pcrs")]
pub struct SimulatedTpm {
    pcrs: SimulatedPcrs,
    storage_seed: Zeroizing<Vec<u8>>,
    storage_root: bool,
    lockout_auth: Zeroizing<Vec<u8>>,
    da_parameters: Option<DaParameters>,
    in_lockout: bool,
    connections_released: usize,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    /// A cleared TPM with a single SHA-256 bank.
    pub fn new() -> Self {
        Self::with_banks(&[HashAlgorithm::Sha256])
    }

    pub fn with_banks(banks: &[HashAlgorithm]) -> Self {
        Self {
            pcrs: SimulatedPcrs {
                registers: PcrRegisters::new(banks),
                unavailable: false,
                fail_extend: false,
            },
            storage_seed: random_bytes(32),
            storage_root: false,
            lockout_auth: Zeroizing::new(Vec::new()),
            da_parameters: None,
            in_lockout: false,
            connections_released: 0,
        }
    }

    /// Resets every PCR, as a reboot would.
    pub fn platform_reset(&mut self) {
        self.pcrs.registers.reset();
    }

    /// Every command fails as if the device had gone away.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.pcrs.unavailable = unavailable;
    }

    pub fn fail_pcr_extend(&mut self, fail: bool) {
        self.pcrs.fail_extend = fail;
    }

    pub fn set_lockout(&mut self, in_lockout: bool) {
        self.in_lockout = in_lockout;
    }

    pub fn da_parameters(&self) -> Option<DaParameters> {
        self.da_parameters
    }

    pub fn connections_released(&self) -> usize {
        self.connections_released
    }

    fn check_available(&self) -> Result<()> {
        self.pcrs.check()
    }

    fn check_lockout_auth(&self, auth: &[u8]) -> Result<()> {
        self.check_available()?;
        if self.in_lockout {
            return Err(TpmError::Lockout);
        }
        if auth != self.lockout_auth.as_slice() {
            return Err(TpmError::AuthFail("lockout"));
        }
        Ok(())
    }

    fn storage_cipher(&self) -> Result<Aes256Gcm> {
        let key = HashAlgorithm::Sha256.hash(&self.storage_seed);
        Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| TpmError::InvalidParameter("storage key".into()))
    }

    fn load(&self, object: &SealedObject) -> Result<(SimPublic, Zeroizing<Vec<u8>>)> {
        if !self.storage_root {
            return Err(TpmError::NotProvisioned);
        }
        let public: SimPublic = bincode::deserialize(&object.public)
            .map_err(|_| TpmError::InvalidParameter("malformed public area".into()))?;
        if object.private.len() < NONCE_SIZE {
            return Err(TpmError::ObjectIntegrity);
        }
        let (nonce, ciphertext) = object.private.split_at(NONCE_SIZE);
        let data = self
            .storage_cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &object.public,
                },
            )
            .map_err(|_| TpmError::ObjectIntegrity)?;
        Ok((public, Zeroizing::new(data)))
    }

    fn run_policy(&mut self, steps: &[PolicyStep]) -> Result<Digest> {
        let mut session = policy::empty_policy();
        for step in steps {
            session = match step {
                PolicyStep::Pcr { selection } => {
                    let values = self.pcrs.pcr_read(selection)?;
                    policy::policy_pcr(&session, selection, &policy::pcr_composite_digest(&values))
                }
                PolicyStep::Or { digests } => {
                    if digests.len() < 2 || digests.len() > POLICY_OR_MAX_DIGESTS {
                        return Err(TpmError::InvalidParameter(format!(
                            "PolicyOR with {} digests",
                            digests.len()
                        )));
                    }
                    if !digests.contains(&session) {
                        return Err(TpmError::PolicyCheck(
                            "PolicyOR: session digest matches no branch".into(),
                        ));
                    }
                    policy::policy_or(digests)
                }
                PolicyStep::Authorize {
                    approved_policy,
                    policy_ref,
                    key,
                    signature,
                } => {
                    if &session != approved_policy {
                        return Err(TpmError::PolicyCheck(
                            "PolicyAuthorize: session digest is not the approved policy".into(),
                        ));
                    }
                    if !policy::verify_authorization(key, approved_policy, policy_ref, signature) {
                        return Err(TpmError::PolicyCheck(
                            "VerifySignature: approval signature is invalid".into(),
                        ));
                    }
                    policy::policy_authorize(&policy::auth_key_name(key)?, policy_ref)
                }
            };
        }
        Ok(session)
    }
}

fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

impl Provisioning for SimulatedTpm {
    fn provision_status(&mut self) -> Result<ProvisionStatus> {
        self.check_available()?;
        Ok(ProvisionStatus {
            storage_root: self.storage_root,
            lockout_auth_set: !self.lockout_auth.is_empty(),
            dictionary_attack_protection: self.da_parameters.is_some(),
            in_lockout: self.in_lockout,
        })
    }

    fn clear(&mut self, lockout_auth: &[u8]) -> Result<()> {
        self.check_lockout_auth(lockout_auth)?;
        self.storage_seed = random_bytes(32);
        self.storage_root = false;
        self.lockout_auth = Zeroizing::new(Vec::new());
        Ok(())
    }

    fn create_storage_root(&mut self) -> Result<()> {
        self.check_available()?;
        self.storage_root = true;
        Ok(())
    }

    fn set_dictionary_attack_parameters(
        &mut self,
        lockout_auth: &[u8],
        params: &DaParameters,
    ) -> Result<()> {
        self.check_lockout_auth(lockout_auth)?;
        self.da_parameters = Some(*params);
        Ok(())
    }

    fn change_lockout_auth(&mut self, current: &[u8], new: &[u8]) -> Result<()> {
        self.check_lockout_auth(current)?;
        self.lockout_auth = Zeroizing::new(new.to_vec());
        Ok(())
    }
}

impl Sealing for SimulatedTpm {
    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        self.check_available()?;
        Ok(random_bytes(num_bytes).to_vec())
    }

    fn create_sealed_object(&mut self, data: &[u8], auth_policy: &Digest) -> Result<SealedObject> {
        self.check_available()?;
        if !self.storage_root {
            return Err(TpmError::NotProvisioned);
        }
        if data.len() > MAX_SEALED_DATA {
            return Err(TpmError::InvalidParameter(format!(
                "sealed data of {} bytes exceeds {}",
                data.len(),
                MAX_SEALED_DATA
            )));
        }
        let public = bincode::serialize(&SimPublic {
            auth_policy: auth_policy.as_ref().to_vec(),
            unique: random_bytes(32).to_vec(),
        })
        .map_err(|e| TpmError::InvalidParameter(e.to_string()))?;

        let nonce = random_bytes(NONCE_SIZE);
        let ciphertext = self
            .storage_cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: data,
                    aad: &public,
                },
            )
            .map_err(|_| TpmError::InvalidParameter("sealed data".into()))?;
        let mut private = nonce.to_vec();
        private.extend_from_slice(&ciphertext);

        Ok(SealedObject { public, private })
    }

    fn unseal(
        &mut self,
        object: &SealedObject,
        policy: &[PolicyStep],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.check_available()?;
        let (public, data) = self.load(object)?;
        let session = self.run_policy(policy)?;
        if session.as_ref() != public.auth_policy.as_slice() {
            return Err(TpmError::PolicyCheck(
                "session digest does not satisfy the object's auth policy".into(),
            ));
        }
        Ok(data)
    }
}

impl Tpm for SimulatedTpm {
    fn release(&mut self) {
        self.connections_released += 1;
    }
}
