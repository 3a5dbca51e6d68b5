//! Policy digest arithmetic.
//!
//! These functions compute the same digests a TPM computes in a policy
//! session, so that a policy can be built ahead of time for PCR values that
//! are predicted rather than current.

use super::pcr::{Digest, HashAlgorithm, PcrSelection};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use thiserror::Error;

pub const TPM_CC_POLICY_AUTHORIZE: u32 = 0x0000_016a;
pub const TPM_CC_POLICY_OR: u32 = 0x0000_0171;
pub const TPM_CC_POLICY_PCR: u32 = 0x0000_017f;

/// Session digests are always SHA-256.
pub const POLICY_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

/// TPM2_PolicyOR accepts at most this many digests.
pub const POLICY_OR_MAX_DIGESTS: usize = 8;
const POLICY_OR_MAX_DEPTH: u32 = 4;
pub const MAX_POLICY_BRANCHES: usize = POLICY_OR_MAX_DIGESTS.pow(POLICY_OR_MAX_DEPTH);

const TPM_ALG_ECC: u16 = 0x0023;
const TPM_ALG_ECDSA: u16 = 0x0018;
const TPM_ALG_NULL: u16 = 0x0010;
const TPM_ECC_NIST_P256: u16 = 0x0003;
/// `sign | userWithAuth`
pub const AUTH_KEY_OBJECT_ATTRIBUTES: u32 = 0x0004_0040;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy has no branches")]
    NoBranches,
    #[error("policy has {0} branches, at most {MAX_POLICY_BRANCHES} are supported")]
    TooManyBranches(usize),
    #[error("invalid policy authorization key")]
    InvalidAuthKey,
}

/// One assertion executed in a policy session before the sealed object is
/// used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyStep {
    /// TPM2_PolicyPCR against the current value of the selected PCRs.
    Pcr { selection: PcrSelection },
    /// TPM2_PolicyOR; the session digest must be one of `digests`.
    Or { digests: Vec<Digest> },
    /// TPM2_VerifySignature + TPM2_PolicyAuthorize.
    Authorize {
        approved_policy: Digest,
        policy_ref: Vec<u8>,
        /// SEC1 encoded P-256 public key
        key: Vec<u8>,
        /// `r || s`
        signature: Vec<u8>,
    },
}

pub fn empty_policy() -> Digest {
    POLICY_ALGORITHM.zero_digest()
}

/// Digest of the concatenated PCR values, as used by TPM2_PolicyPCR.
pub fn pcr_composite_digest(values: &[Digest]) -> Digest {
    let parts: Vec<&[u8]> = values.iter().map(AsRef::as_ref).collect();
    POLICY_ALGORITHM.hash_parts(&parts)
}

pub fn policy_pcr(old: &Digest, selection: &PcrSelection, composite: &Digest) -> Digest {
    POLICY_ALGORITHM.hash_parts(&[
        old.as_ref(),
        &TPM_CC_POLICY_PCR.to_be_bytes(),
        &selection.marshal(),
        composite.as_ref(),
    ])
}

/// PolicyOR always resets the session digest before extending.
pub fn policy_or(digests: &[Digest]) -> Digest {
    let cc = TPM_CC_POLICY_OR.to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![empty_policy_bytes(), &cc];
    parts.extend(digests.iter().map(AsRef::as_ref));
    POLICY_ALGORITHM.hash_parts(&parts)
}

fn empty_policy_bytes() -> &'static [u8] {
    &[0u8; 32]
}

/// PolicyAuthorize resets the session digest, then extends the key name and
/// the policy reference.
pub fn policy_authorize(key_name: &[u8], policy_ref: &[u8]) -> Digest {
    let digest = POLICY_ALGORITHM.hash_parts(&[
        empty_policy_bytes(),
        &TPM_CC_POLICY_AUTHORIZE.to_be_bytes(),
        key_name,
    ]);
    POLICY_ALGORITHM.hash_parts(&[digest.as_ref(), policy_ref])
}

/// The digest signed to approve a policy: `H(approvedPolicy || policyRef)`.
pub fn authorization_digest(approved_policy: &Digest, policy_ref: &[u8]) -> Digest {
    POLICY_ALGORITHM.hash_parts(&[approved_policy.as_ref(), policy_ref])
}

/// Marshalled `TPMT_PUBLIC` of an unrestricted ECDSA P-256 SHA-256 signing
/// key, the template used for policy authorization keys.
pub fn auth_key_public_area(key: &VerifyingKey) -> Vec<u8> {
    let point = key.to_encoded_point(false);
    let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
    let y = point.y().map(|y| y.to_vec()).unwrap_or_default();

    let mut buf = Vec::with_capacity(88);
    buf.extend_from_slice(&TPM_ALG_ECC.to_be_bytes());
    buf.extend_from_slice(&POLICY_ALGORITHM.tpm_alg_id().to_be_bytes());
    buf.extend_from_slice(&AUTH_KEY_OBJECT_ATTRIBUTES.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
    buf.extend_from_slice(&TPM_ALG_ECDSA.to_be_bytes());
    buf.extend_from_slice(&POLICY_ALGORITHM.tpm_alg_id().to_be_bytes());
    buf.extend_from_slice(&TPM_ECC_NIST_P256.to_be_bytes());
    buf.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
    for coordinate in [x, y] {
        buf.extend_from_slice(&(coordinate.len() as u16).to_be_bytes());
        buf.extend_from_slice(&coordinate);
    }
    buf
}

/// TPM object name: `nameAlg || H(TPMT_PUBLIC)`.
pub fn object_name(public_area: &[u8]) -> Vec<u8> {
    let mut name = POLICY_ALGORITHM.tpm_alg_id().to_be_bytes().to_vec();
    name.extend_from_slice(POLICY_ALGORITHM.hash(public_area).as_ref());
    name
}

pub fn auth_key_name(key: &[u8]) -> Result<Vec<u8>, PolicyError> {
    let key = VerifyingKey::from_sec1_bytes(key).map_err(|_| PolicyError::InvalidAuthKey)?;
    Ok(object_name(&auth_key_public_area(&key)))
}

/// Checks an approval signature the way TPM2_VerifySignature would.
pub fn verify_authorization(
    key: &[u8],
    approved_policy: &Digest,
    policy_ref: &[u8],
    signature: &[u8],
) -> bool {
    let (Ok(key), Ok(signature)) = (
        VerifyingKey::from_sec1_bytes(key),
        Signature::from_slice(signature),
    ) else {
        return false;
    };
    let digest = authorization_digest(approved_policy, policy_ref);
    key.verify_prehash(digest.as_ref(), &signature).is_ok()
}

/// PolicyOR digests arranged as a tree so that more alternatives than a
/// single TPM2_PolicyOR accepts can be expressed.
///
/// Level 0 holds the leaf policies. Every further level holds one PolicyOR
/// digest per group of up to 8 digests of the level below. A group with a
/// single member is ORed with itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOrTree {
    levels: Vec<Vec<Digest>>,
}

impl PolicyOrTree {
    pub fn new(leaves: Vec<Digest>) -> Result<Self, PolicyError> {
        if leaves.is_empty() {
            return Err(PolicyError::NoBranches);
        }
        if leaves.len() > MAX_POLICY_BRANCHES {
            return Err(PolicyError::TooManyBranches(leaves.len()));
        }
        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let next = levels[levels.len() - 1]
                .chunks(POLICY_OR_MAX_DIGESTS)
                .map(|group| policy_or(&or_operands(group)))
                .collect();
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    pub fn root(&self) -> &Digest {
        &self.levels[self.levels.len() - 1][0]
    }

    /// The PolicyOR operands to execute, bottom up, after a session has
    /// reached `leaf`. `None` if `leaf` is not one of the branches.
    pub fn path(&self, leaf: &Digest) -> Option<Vec<Vec<Digest>>> {
        let mut index = self.leaves().iter().position(|l| l == leaf)?;
        let mut path = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let group = index / POLICY_OR_MAX_DIGESTS;
            let start = group * POLICY_OR_MAX_DIGESTS;
            let end = (start + POLICY_OR_MAX_DIGESTS).min(level.len());
            path.push(or_operands(&level[start..end]));
            index = group;
        }
        Some(path)
    }
}

fn or_operands(group: &[Digest]) -> Vec<Digest> {
    match group {
        [single] => vec![single.clone(), single.clone()],
        _ => group.to_vec(),
    }
}
