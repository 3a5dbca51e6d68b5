//! On-disk sealed key objects and their policy update data.
//!
//! A key file holds the sealed object, the public half of the policy update
//! key and the currently authorized PCR policy. The matching policy update
//! file holds the private half, which is needed to authorize a new PCR
//! policy. Both start with a four byte magic followed by a bincode payload.
//!
//! The policy generation is informational. Nothing in the TPM records which
//! generation is current, so a copy of a key file holding an older signed
//! policy keeps unsealing on boots that policy accepts. Revoking old policies
//! needs a monotonic NV counter in the static policy, which is not done.

use crate::tpm::pcr::{Digest, PcrSelection};
use crate::tpm::policy::{self, PolicyError, PolicyOrTree, PolicyStep};
use crate::tpm::SealedObject;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

const KEY_DATA_MAGIC: &[u8; 4] = b"TSBK";
const POLICY_UPDATE_MAGIC: &[u8; 4] = b"TSBU";
pub const KEY_DATA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum KeyDataError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a {expected}")]
    InvalidMagic { path: PathBuf, expected: &'static str },
    #[error("unsupported key data version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed key data: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid policy update key")]
    InvalidAuthKey,
    #[error("cannot sign PCR policy: {0}")]
    Signing(String),
    #[error("policy update data does not belong to this sealed key")]
    Mismatch,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type Result<T, E = KeyDataError> = core::result::Result<T, E>;

/// The PCR policy currently authorized for a sealed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPolicy {
    pub selection: PcrSelection,
    /// One TPM2_PolicyPCR digest per acceptable branch.
    pub leaves: Vec<Digest>,
    pub generation: u64,
    pub policy_ref: Vec<u8>,
    /// ECDSA `r || s` over `H(root || policy_ref)`
    pub signature: Vec<u8>,
}

impl DynamicPolicy {
    pub fn sign(
        selection: PcrSelection,
        leaves: Vec<Digest>,
        generation: u64,
        policy_ref: &[u8],
        key: &SigningKey,
    ) -> Result<Self> {
        let tree = PolicyOrTree::new(leaves)?;
        let digest = policy::authorization_digest(tree.root(), policy_ref);
        let signature: Signature = key
            .sign_prehash(digest.as_ref())
            .map_err(|e| KeyDataError::Signing(e.to_string()))?;
        let leaves = tree.leaves().to_vec();
        Ok(Self {
            selection,
            leaves,
            generation,
            policy_ref: policy_ref.to_vec(),
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn tree(&self) -> Result<PolicyOrTree> {
        Ok(PolicyOrTree::new(self.leaves.clone())?)
    }
}

/// Contents of a key file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyObject {
    pub version: u32,
    pub sealed: SealedObject,
    /// SEC1 encoded policy update public key.
    pub auth_public_key: Vec<u8>,
    pub policy: DynamicPolicy,
}

impl SealedKeyObject {
    pub fn new(sealed: SealedObject, auth_key: &SigningKey, policy: DynamicPolicy) -> Self {
        Self {
            version: KEY_DATA_VERSION,
            sealed,
            auth_public_key: encode_public_key(auth_key.verifying_key()),
            policy,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let key: Self = read_file(path, KEY_DATA_MAGIC, "sealed key file")?;
        if key.version != KEY_DATA_VERSION {
            return Err(KeyDataError::UnsupportedVersion(key.version));
        }
        VerifyingKey::from_sec1_bytes(&key.auth_public_key)
            .map_err(|_| KeyDataError::InvalidAuthKey)?;
        key.policy.tree()?;
        Ok(key)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        self.stage(path)?.commit()
    }

    pub fn stage(&self, path: &Path) -> Result<StagedFile> {
        StagedFile::new(path, KEY_DATA_MAGIC, self)
    }

    /// The static auth policy of the sealed object.
    pub fn auth_policy(&self) -> Result<Digest> {
        let name = policy::auth_key_name(&self.auth_public_key)?;
        Ok(policy::policy_authorize(&name, &self.policy.policy_ref))
    }

    /// The assertions that satisfy the auth policy given the current values
    /// of the selected PCRs, or `None` if they match no authorized branch.
    pub fn unseal_policy(&self, current_values: &[Digest]) -> Result<Option<Vec<PolicyStep>>> {
        let tree = self.policy.tree()?;
        let leaf = policy::policy_pcr(
            &policy::empty_policy(),
            &self.policy.selection,
            &policy::pcr_composite_digest(current_values),
        );
        let Some(path) = tree.path(&leaf) else {
            return Ok(None);
        };
        let mut steps = vec![PolicyStep::Pcr {
            selection: self.policy.selection.clone(),
        }];
        steps.extend(path.into_iter().map(|digests| PolicyStep::Or { digests }));
        steps.push(PolicyStep::Authorize {
            approved_policy: tree.root().clone(),
            policy_ref: self.policy.policy_ref.clone(),
            key: self.auth_public_key.clone(),
            signature: self.policy.signature.clone(),
        });
        Ok(Some(steps))
    }
}

/// Contents of a policy update file.
#[derive(Clone, Serialize, Deserialize)]
pub struct PolicyUpdateData {
    pub version: u32,
    pub object_name: Vec<u8>,
    auth_private_key: Vec<u8>,
}

impl Drop for PolicyUpdateData {
    fn drop(&mut self) {
        self.auth_private_key.zeroize();
    }
}

impl std::fmt::Debug for PolicyUpdateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyUpdateData")
            .field("version", &self.version)
            .field("object_name", &hex::encode(&self.object_name))
            .finish_non_exhaustive()
    }
}

impl PolicyUpdateData {
    pub fn new(sealed: &SealedObject, auth_key: &SigningKey) -> Self {
        Self {
            version: KEY_DATA_VERSION,
            object_name: sealed.name(),
            auth_private_key: auth_key.to_bytes().to_vec(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data: Self = read_file(path, POLICY_UPDATE_MAGIC, "policy update file")?;
        if data.version != KEY_DATA_VERSION {
            return Err(KeyDataError::UnsupportedVersion(data.version));
        }
        data.signing_key()?;
        Ok(data)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        self.stage(path)?.commit()
    }

    pub fn stage(&self, path: &Path) -> Result<StagedFile> {
        StagedFile::new(path, POLICY_UPDATE_MAGIC, self)
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        SigningKey::from_slice(&self.auth_private_key).map_err(|_| KeyDataError::InvalidAuthKey)
    }

    /// Fails unless this is the update data created together with `key`.
    pub fn check_pairing(&self, key: &SealedKeyObject) -> Result<()> {
        if self.object_name != key.sealed.name() {
            return Err(KeyDataError::Mismatch);
        }
        if encode_public_key(self.signing_key()?.verifying_key()) != key.auth_public_key {
            return Err(KeyDataError::Mismatch);
        }
        Ok(())
    }
}

pub fn encode_public_key(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

fn read_file<T: DeserializeOwned>(path: &Path, magic: &[u8; 4], expected: &'static str) -> Result<T> {
    let data = Zeroizing::new(fs::read(path).map_err(|source| KeyDataError::Io {
        path: path.to_path_buf(),
        source,
    })?);
    match data.strip_prefix(magic.as_slice()) {
        Some(payload) => Ok(bincode::deserialize(payload)?),
        None => Err(KeyDataError::InvalidMagic {
            path: path.to_path_buf(),
            expected,
        }),
    }
}

/// `magic || payload` written and synced next to its destination, but not
/// yet in place. Dropping it without [`StagedFile::commit`] leaves the
/// destination untouched.
pub struct StagedFile {
    file: tempfile::NamedTempFile,
    path: PathBuf,
}

impl StagedFile {
    fn new<T: Serialize>(path: &Path, magic: &[u8; 4], value: &T) -> Result<Self> {
        let io_error = |source: std::io::Error| KeyDataError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut data = Zeroizing::new(magic.to_vec());
        data.extend_from_slice(&bincode::serialize(value)?);

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = tempfile::Builder::new()
            .prefix(".tpm-secboot")
            .tempfile_in(dir)
            .map_err(io_error)?;
        file.as_file()
            .set_permissions(Permissions::from_mode(0o600))
            .map_err(io_error)?;
        file.write_all(&data).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Renames the file into place. Readers see either the old or the new
    /// contents.
    pub fn commit(self) -> Result<()> {
        let Self { file, path } = self;
        file.persist(&path).map_err(|e| KeyDataError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }
}
