//! A hardware TPM through tss-esapi.

use super::pcr::{self, HashAlgorithm, PcrBank, PcrSelection};
use super::policy::{self, PolicyError, PolicyStep};
use super::{
    DaParameters, ProvisionStatus, Provisioning, Result, SealedObject, Sealing, SharedTpm, Tpm,
    TpmConnection, TpmError,
};
use once_cell::sync::OnceCell;
use p256::ecdsa::VerifyingKey;
use std::collections::BTreeMap;
use tss_esapi::abstraction::pcr::read_all;
use tss_esapi::attributes::{ObjectAttributes, SessionAttributes};
use tss_esapi::constants::{CapabilityType, PropertyTag, SessionType, StartupType};
use tss_esapi::handles::{AuthHandle, KeyHandle, ObjectHandle, PcrHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Lockout, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, CreateKeyResult, Digest, DigestList, DigestValues, EccParameter,
    EccPoint, EccSignature, KeyedHashScheme, Nonce, PcrSelectionList, PcrSlot, Private, Public,
    PublicEccParametersBuilder, PublicKeyedHashParameters, SensitiveData, Signature,
    SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::TSS2_RC;
use tss_esapi::Context;
use zeroize::Zeroizing;

/// Where the storage root key is persisted.
pub const STORAGE_ROOT_HANDLE: u32 = 0x8100_0001;

/// TPMA_PERMANENT bits
const LOCKOUT_AUTH_SET: u32 = 1 << 2;
const IN_LOCKOUT: u32 = 1 << 9;

const TSS2_TCTI_RC_LAYER: u32 = 10;
const RC_FMT1: u32 = 0x080;
const RC_AUTH_FAIL: u32 = RC_FMT1 + 0x00e;
const RC_POLICY_FAIL: u32 = RC_FMT1 + 0x019;
const RC_SIGNATURE: u32 = RC_FMT1 + 0x01b;
const RC_INTEGRITY: u32 = RC_FMT1 + 0x01f;
const RC_BAD_AUTH: u32 = RC_FMT1 + 0x022;
const RC_PCR_CHANGED: u32 = 0x128;
const RC_LOCKOUT: u32 = 0x921;

/// Sorts a tss-esapi error into the conditions callers act on.
fn tss_error(e: tss_esapi::Error) -> TpmError {
    let rc = match &e {
        tss_esapi::Error::TssError(rc) => TSS2_RC::from(*rc),
        _ => return TpmError::TssEsapi(e),
    };
    if (rc >> 16) & 0xff == TSS2_TCTI_RC_LAYER {
        return TpmError::Unavailable(e.to_string());
    }
    let code = if rc & RC_FMT1 != 0 {
        RC_FMT1 | (rc & 0x3f)
    } else {
        rc & 0xfff
    };
    match code {
        RC_LOCKOUT => TpmError::Lockout,
        RC_AUTH_FAIL | RC_BAD_AUTH => TpmError::AuthFail("lockout"),
        RC_POLICY_FAIL | RC_PCR_CHANGED | RC_SIGNATURE => TpmError::PolicyCheck(e.to_string()),
        RC_INTEGRITY => TpmError::ObjectIntegrity,
        _ => TpmError::TssEsapi(e),
    }
}

fn hashing_algorithm(bank: HashAlgorithm) -> HashingAlgorithm {
    match bank {
        HashAlgorithm::Sha256 => HashingAlgorithm::Sha256,
        HashAlgorithm::Sha384 => HashingAlgorithm::Sha384,
        HashAlgorithm::Sha512 => HashingAlgorithm::Sha512,
    }
}

fn hash_algorithm(algorithm: HashingAlgorithm) -> Option<HashAlgorithm> {
    match algorithm {
        HashingAlgorithm::Sha256 => Some(HashAlgorithm::Sha256),
        HashingAlgorithm::Sha384 => Some(HashAlgorithm::Sha384),
        HashingAlgorithm::Sha512 => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

fn pcr_slot(index: u32) -> Result<PcrSlot> {
    if index >= pcr::PCR_COUNT {
        return Err(pcr::PcrError::PcrOutOfRange(index).into());
    }
    PcrSlot::try_from(1u32 << index).map_err(tss_error)
}

fn pcr_handle(index: u32) -> Result<PcrHandle> {
    let handle = match index {
        0 => PcrHandle::Pcr0,
        1 => PcrHandle::Pcr1,
        2 => PcrHandle::Pcr2,
        3 => PcrHandle::Pcr3,
        4 => PcrHandle::Pcr4,
        5 => PcrHandle::Pcr5,
        6 => PcrHandle::Pcr6,
        7 => PcrHandle::Pcr7,
        8 => PcrHandle::Pcr8,
        9 => PcrHandle::Pcr9,
        10 => PcrHandle::Pcr10,
        11 => PcrHandle::Pcr11,
        12 => PcrHandle::Pcr12,
        13 => PcrHandle::Pcr13,
        14 => PcrHandle::Pcr14,
        15 => PcrHandle::Pcr15,
        16 => PcrHandle::Pcr16,
        17 => PcrHandle::Pcr17,
        18 => PcrHandle::Pcr18,
        19 => PcrHandle::Pcr19,
        20 => PcrHandle::Pcr20,
        21 => PcrHandle::Pcr21,
        22 => PcrHandle::Pcr22,
        23 => PcrHandle::Pcr23,
        _ => return Err(pcr::PcrError::PcrOutOfRange(index).into()),
    };
    Ok(handle)
}

fn selection_list(selection: &PcrSelection) -> Result<PcrSelectionList> {
    let mut banks: BTreeMap<HashAlgorithm, Vec<PcrSlot>> = BTreeMap::new();
    for (bank, index) in selection.iter() {
        banks.entry(bank).or_default().push(pcr_slot(index)?);
    }
    let mut builder = PcrSelectionList::builder();
    for (bank, slots) in &banks {
        builder = builder.with_selection(hashing_algorithm(*bank), slots);
    }
    builder.build().map_err(tss_error)
}

fn tss_digest(digest: &pcr::Digest) -> Result<Digest> {
    Digest::try_from(digest.as_ref().to_vec()).map_err(tss_error)
}

pub struct DeviceTpm {
    context: Context,
}

impl DeviceTpm {
    /// Opens the TPM named by the `TCTI` environment variable.
    pub fn from_environment() -> Result<Self> {
        let tcti = TctiNameConf::from_environment_variable()
            .map_err(|e| TpmError::Unavailable(e.to_string()))?;
        let mut context = Context::new(tcti).map_err(|e| TpmError::Unavailable(e.to_string()))?;
        if let Err(e) = context.startup(StartupType::Clear) {
            log::debug!("TPM2_Startup: {}", e);
        }
        Ok(Self { context })
    }

    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(tss_error)?
            .ok_or_else(|| TpmError::Unavailable("no session handle returned".into()))?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.context
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)
            .map_err(tss_error)?;
        Ok(session)
    }

    fn flush_session(&mut self, session: AuthSession) {
        let handle = match session {
            AuthSession::HmacSession(HmacSession::HmacSession { session_handle, .. }) => {
                Some(session_handle.into())
            }
            AuthSession::PolicySession(PolicySession::PolicySession { session_handle, .. }) => {
                Some(session_handle.into())
            }
            _ => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = self.context.flush_context(handle) {
                log::debug!("Cannot flush session: {}", e);
            }
        }
    }

    fn flush_transient(&mut self) -> Result<()> {
        let (capabilities, _) = self
            .context
            .get_capability(CapabilityType::Handles, 0, 80)
            .map_err(tss_error)?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = self
                    .context
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))
                    .map_err(tss_error)?;
                self.context.flush_context(handle).ok();
            }
        }
        Ok(())
    }

    fn storage_root(&mut self) -> Result<Option<KeyHandle>> {
        let handle = PersistentTpmHandle::new(STORAGE_ROOT_HANDLE).map_err(tss_error)?;
        Ok(self
            .context
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))
            .ok()
            .map(KeyHandle::from))
    }

    fn set_lockout_auth(&mut self, auth: &[u8]) -> Result<()> {
        let auth = Auth::try_from(auth.to_vec()).map_err(tss_error)?;
        self.context
            .tr_set_auth(ObjectHandle::Lockout, auth)
            .map_err(tss_error)
    }

    fn run_policy(&mut self, session: PolicySession, steps: &[PolicyStep]) -> Result<()> {
        for step in steps {
            match step {
                PolicyStep::Pcr { selection } => {
                    let list = selection_list(selection)?;
                    self.context
                        .policy_pcr(session, Digest::default(), list)
                        .map_err(tss_error)?;
                }
                PolicyStep::Or { digests } => {
                    let mut list = DigestList::new();
                    for digest in digests {
                        list.add(tss_digest(digest)?).map_err(tss_error)?;
                    }
                    self.context.policy_or(session, list).map_err(tss_error)?;
                }
                PolicyStep::Authorize {
                    approved_policy,
                    policy_ref,
                    key,
                    signature,
                } => self.policy_authorize(session, approved_policy, policy_ref, key, signature)?,
            }
        }
        Ok(())
    }

    fn policy_authorize(
        &mut self,
        session: PolicySession,
        approved_policy: &pcr::Digest,
        policy_ref: &[u8],
        key: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let key = VerifyingKey::from_sec1_bytes(key).map_err(|_| PolicyError::InvalidAuthKey)?;
        let public = Public::unmarshall(&policy::auth_key_public_area(&key)).map_err(tss_error)?;
        let key_handle = self
            .context
            .load_external_public(public, Hierarchy::Owner)
            .map_err(tss_error)?;

        let (r, s) = signature.split_at(signature.len() / 2);
        let signature = EccSignature::create(
            HashingAlgorithm::Sha256,
            EccParameter::try_from(r.to_vec()).map_err(tss_error)?,
            EccParameter::try_from(s.to_vec()).map_err(tss_error)?,
        )
        .map_err(tss_error)?;
        let digest = policy::authorization_digest(approved_policy, policy_ref);
        let verified = self
            .context
            .read_public(key_handle)
            .and_then(|(_, name, _)| {
                let ticket = self.context.verify_signature(
                    key_handle,
                    Digest::try_from(digest.as_ref().to_vec())?,
                    Signature::EcDsa(signature),
                )?;
                Ok((name, ticket))
            });
        self.context.flush_context(key_handle.into()).ok();
        let (name, ticket) = verified.map_err(tss_error)?;

        self.context
            .policy_authorize(
                session,
                tss_digest(approved_policy)?,
                Nonce::try_from(policy_ref.to_vec()).map_err(tss_error)?,
                &name,
                ticket,
            )
            .map_err(tss_error)
    }

    fn unseal_loaded(&mut self, object: KeyHandle, steps: &[PolicyStep]) -> Result<SensitiveData> {
        let session = self.make_session(SessionType::Policy)?;
        let result = PolicySession::try_from(session)
            .map_err(tss_error)
            .and_then(|policy_session| self.run_policy(policy_session, steps))
            .and_then(|()| {
                self.context
                    .execute_with_session(Some(session), |ctx| ctx.unseal(object.into()))
                    .map_err(tss_error)
            });
        self.flush_session(session);
        result
    }
}

impl PcrBank for DeviceTpm {
    fn active_banks(&mut self) -> Result<Vec<HashAlgorithm>> {
        let (capabilities, _) = self
            .context
            .get_capability(CapabilityType::AssignedPcr, 0, 1)
            .map_err(tss_error)?;
        let CapabilityData::AssignedPcr(list) = capabilities else {
            return Ok(Vec::new());
        };
        Ok(list
            .get_selections()
            .iter()
            .filter(|selection| !selection.is_empty())
            .filter_map(|selection| hash_algorithm(selection.hashing_algorithm()))
            .collect())
    }

    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<Vec<pcr::Digest>> {
        let list = selection_list(selection)?;
        let data = self
            .context
            .execute_without_session(|ctx| read_all(ctx, list))
            .map_err(tss_error)?;
        selection
            .iter()
            .map(|(bank, index)| {
                data.pcr_bank(hashing_algorithm(bank))
                    .and_then(|values| values.get_digest(pcr_slot(index).ok()?))
                    .map(|digest| pcr::Digest::from(digest.value().to_vec()))
                    .ok_or_else(|| {
                        TpmError::InvalidParameter(format!("PCR {}:{} was not read", bank, index))
                    })
            })
            .collect()
    }

    fn pcr_extend(&mut self, index: u32, digests: &[(HashAlgorithm, pcr::Digest)]) -> Result<()> {
        let handle = pcr_handle(index)?;
        let mut values = DigestValues::new();
        for (bank, digest) in digests {
            bank.check_digest(digest)?;
            values.set(hashing_algorithm(*bank), tss_digest(digest)?);
        }
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| ctx.pcr_extend(handle, values))
            .map_err(tss_error)
    }
}

impl Provisioning for DeviceTpm {
    fn provision_status(&mut self) -> Result<ProvisionStatus> {
        let permanent = self
            .context
            .get_tpm_property(PropertyTag::Permanent)
            .map_err(tss_error)?
            .unwrap_or(0);
        let max_auth_fail = self
            .context
            .get_tpm_property(PropertyTag::MaxAuthFail)
            .map_err(tss_error)?;
        let lockout_auth_set = permanent & LOCKOUT_AUTH_SET != 0;
        Ok(ProvisionStatus {
            storage_root: self.storage_root()?.is_some(),
            lockout_auth_set,
            dictionary_attack_protection: lockout_auth_set && max_auth_fail.map_or(false, |n| n > 0),
            in_lockout: permanent & IN_LOCKOUT != 0,
        })
    }

    fn clear(&mut self, lockout_auth: &[u8]) -> Result<()> {
        self.set_lockout_auth(lockout_auth)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| ctx.clear(AuthHandle::Lockout))
            .map_err(tss_error)
    }

    fn create_storage_root(&mut self) -> Result<()> {
        if self.storage_root()?.is_some() {
            return Ok(());
        }
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_sign_encrypt(false)
            .with_restricted(true)
            .build()
            .map_err(tss_error)?;
        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_ecc_parameters(
                PublicEccParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    EccCurve::NistP256,
                )
                .build()
                .map_err(tss_error)?,
            )
            .with_ecc_unique_identifier(EccPoint::default())
            .build()
            .map_err(tss_error)?;

        let persistent = PersistentTpmHandle::new(STORAGE_ROOT_HANDLE).map_err(tss_error)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                let primary = ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)?;
                let transient: ObjectHandle = primary.key_handle.into();
                let mut stored =
                    ctx.evict_control(Provision::Owner, transient, Persistent::Persistent(persistent))?;
                ctx.flush_context(transient)?;
                ctx.tr_close(&mut stored)
            })
            .map_err(tss_error)?;
        log::info!("Storage root key persisted at {:#x}", STORAGE_ROOT_HANDLE);
        Ok(())
    }

    fn set_dictionary_attack_parameters(
        &mut self,
        lockout_auth: &[u8],
        params: &DaParameters,
    ) -> Result<()> {
        self.set_lockout_auth(lockout_auth)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.dictionary_attack_parameters(
                    Lockout::Lockout,
                    params.max_tries,
                    params.recovery_time,
                    params.lockout_recovery,
                )
            })
            .map_err(tss_error)
    }

    fn change_lockout_auth(&mut self, current: &[u8], new: &[u8]) -> Result<()> {
        self.set_lockout_auth(current)?;
        let new = Auth::try_from(new.to_vec()).map_err(tss_error)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.hierarchy_change_auth(AuthHandle::Lockout, new)
            })
            .map_err(tss_error)
    }
}

impl Sealing for DeviceTpm {
    fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(num_bytes);
        while bytes.len() < num_bytes {
            let chunk = self
                .context
                .get_random(num_bytes - bytes.len())
                .map_err(tss_error)?;
            bytes.extend_from_slice(chunk.value());
        }
        Ok(bytes)
    }

    fn create_sealed_object(&mut self, data: &[u8], auth_policy: &pcr::Digest) -> Result<SealedObject> {
        let parent = self.storage_root()?.ok_or(TpmError::NotProvisioned)?;
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()
            .map_err(tss_error)?;
        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(tss_digest(auth_policy)?)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()
            .map_err(tss_error)?;
        let data = SensitiveData::try_from(data.to_vec()).map_err(tss_error)?;

        let CreateKeyResult {
            out_private,
            out_public,
            ..
        } = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create(parent, public, None, Some(data), None, None)
            })
            .map_err(tss_error)?;
        Ok(SealedObject {
            public: out_public.marshall().map_err(tss_error)?,
            private: out_private.value().to_vec(),
        })
    }

    fn unseal(
        &mut self,
        object: &SealedObject,
        policy: &[PolicyStep],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let parent = self.storage_root()?.ok_or(TpmError::NotProvisioned)?;
        let public = Public::unmarshall(&object.public).map_err(tss_error)?;
        let private = Private::try_from(object.private.clone()).map_err(tss_error)?;
        let loaded = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| ctx.load(parent, private, public))
            .map_err(tss_error)?;
        let result = self.unseal_loaded(loaded, policy);
        self.context.flush_context(loaded.into()).ok();
        Ok(Zeroizing::new(result?.value().to_vec()))
    }
}

impl Tpm for DeviceTpm {
    fn release(&mut self) {
        if let Err(e) = self.flush_transient() {
            log::warn!("Cannot flush transient objects: {}", e);
        }
    }
}

static DEFAULT_TPM: OnceCell<SharedTpm<DeviceTpm>> = OnceCell::new();

/// Connects to the TPM named by `TCTI`, opening it on first use.
pub fn connect_to_default_tpm() -> Result<TpmConnection<'static, DeviceTpm>> {
    let tpm = DEFAULT_TPM.get_or_try_init(|| DeviceTpm::from_environment().map(SharedTpm::new))?;
    Ok(tpm.connect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn pcr_handles() -> Result<()> {
        assert!(matches!(pcr_handle(7)?, PcrHandle::Pcr7));
        assert!(matches!(pcr_handle(23)?, PcrHandle::Pcr23));
        assert!(pcr_handle(24).is_err());
        assert!(matches!(pcr_slot(12)?, PcrSlot::Slot12));
        Ok(())
    }

    #[test]
    fn selection_conversion() -> Result<()> {
        let selection = PcrSelection::new()
            .with_selection(HashAlgorithm::Sha256, &[7, 12])?
            .with_selection(HashAlgorithm::Sha384, &[4])?;
        let list = selection_list(&selection)?;
        assert_eq!(list.get_selections().len(), 2);
        Ok(())
    }
}
