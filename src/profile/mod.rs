//! PCR protection profiles.
//!
//! A [`ProtectionProfile`] is a list of operations predicting the PCR values
//! of an acceptable boot. Alternatives (a firmware update that may or may not
//! have been applied, two kernel command lines, ...) are [`ProfileOp::Or`]
//! nodes. Computing a profile yields every acceptable combination of PCR
//! values as a separate branch; a sealed key can be unsealed if the TPM's
//! current PCR values match any one branch.

use crate::model::ModelError;
use crate::tpm::pcr::{Digest, HashAlgorithm, PcrError, PcrSelection, PCR_COUNT};
use crate::tpm::policy::{self, PolicyError, MAX_POLICY_BRANCHES};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod secureboot;
pub mod stub;
pub mod model;

pub use secureboot::{
    add_boot_manager_profile, add_secure_boot_policy_profile, BootManagerParams, ImageLoadEvent,
    SecureBootPolicyParams, BOOT_MANAGER_CODE_PCR, SECURE_BOOT_POLICY_PCR,
};
pub use stub::{add_systemd_stub_profile, SystemdStubParams, KERNEL_CONFIG_PCR};
pub use model::{add_model_profile, ModelProfileParams};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProfileConstructionError {
    #[error("missing required profile parameter: {0}")]
    MissingParameter(&'static str),
    #[error("cannot parse {what} digest `{value}`")]
    InvalidDigest { what: String, value: String },
    #[error("invalid {what}: {source}")]
    Measurement {
        what: String,
        #[source]
        source: PcrError,
    },
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error("invalid model: {0}")]
    InvalidModel(#[from] ModelError),
    #[error("{bank} PCR {pcr} is not predicted by every branch of the profile")]
    InconsistentSelection { bank: HashAlgorithm, pcr: u32 },
    #[error("profile predicts no PCR values")]
    EmptyProfile,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type Result<T, E = ProfileConstructionError> = core::result::Result<T, E>;

/// Predicted values of every PCR a branch covers.
pub type PcrValues = BTreeMap<(HashAlgorithm, u32), Digest>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOp {
    /// The PCR holds exactly `value` at this point.
    AddValue {
        bank: HashAlgorithm,
        pcr: u32,
        value: Digest,
    },
    /// The PCR is extended with `digest`.
    Extend {
        bank: HashAlgorithm,
        pcr: u32,
        digest: Digest,
    },
    /// Any one of the alternatives is applied.
    Or(Vec<ProtectionProfile>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionProfile {
    ops: Vec<ProfileOp>,
}

fn check_pcr(bank: HashAlgorithm, pcr: u32, digest: &Digest) -> Result<()> {
    if pcr >= PCR_COUNT {
        return Err(PcrError::PcrOutOfRange(pcr).into());
    }
    bank.check_digest(digest)?;
    Ok(())
}

/// Parses a hex encoded measurement and checks it fits `bank`.
pub fn parse_digest(bank: HashAlgorithm, what: &str, value: &str) -> Result<Digest> {
    let digest = Digest::from_hex(value).map_err(|_| ProfileConstructionError::InvalidDigest {
        what: what.to_string(),
        value: value.to_string(),
    })?;
    check_measurement(bank, what, &digest)?;
    Ok(digest)
}

pub(crate) fn check_measurement(bank: HashAlgorithm, what: &str, digest: &Digest) -> Result<()> {
    bank.check_digest(digest)
        .map_err(|source| ProfileConstructionError::Measurement {
            what: what.to_string(),
            source,
        })
}

impl ProtectionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[ProfileOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn add_pcr_value(&mut self, bank: HashAlgorithm, pcr: u32, value: Digest) -> Result<&mut Self> {
        check_pcr(bank, pcr, &value)?;
        self.ops.push(ProfileOp::AddValue { bank, pcr, value });
        Ok(self)
    }

    pub fn extend_pcr(&mut self, bank: HashAlgorithm, pcr: u32, digest: Digest) -> Result<&mut Self> {
        check_pcr(bank, pcr, &digest)?;
        self.ops.push(ProfileOp::Extend { bank, pcr, digest });
        Ok(self)
    }

    pub fn add_profile_or(&mut self, alternatives: Vec<ProtectionProfile>) -> Result<&mut Self> {
        if alternatives.is_empty() {
            return Err(ProfileConstructionError::MissingParameter("profile alternatives"));
        }
        self.ops.push(ProfileOp::Or(alternatives));
        Ok(self)
    }

    /// Every distinct set of PCR values this profile accepts, in the order
    /// they were first produced.
    pub fn compute_branches(&self) -> Result<Vec<PcrValues>> {
        let branches = self.apply(vec![PcrValues::new()])?;
        let mut unique: Vec<PcrValues> = Vec::with_capacity(branches.len());
        for branch in branches {
            if !unique.contains(&branch) {
                unique.push(branch);
            }
        }
        Ok(unique)
    }

    fn apply(&self, mut branches: Vec<PcrValues>) -> Result<Vec<PcrValues>> {
        for op in &self.ops {
            match op {
                ProfileOp::AddValue { bank, pcr, value } => {
                    for branch in &mut branches {
                        branch.insert((*bank, *pcr), value.clone());
                    }
                }
                ProfileOp::Extend { bank, pcr, digest } => {
                    for branch in &mut branches {
                        let old = branch
                            .get(&(*bank, *pcr))
                            .cloned()
                            .unwrap_or_else(|| bank.zero_digest());
                        branch.insert((*bank, *pcr), bank.extend(&old, digest));
                    }
                }
                ProfileOp::Or(alternatives) => {
                    let mut forked = Vec::new();
                    for alternative in alternatives {
                        forked.extend(alternative.apply(branches.clone())?);
                        if forked.len() > MAX_POLICY_BRANCHES {
                            return Err(PolicyError::TooManyBranches(forked.len()).into());
                        }
                    }
                    branches = forked;
                }
            }
        }
        Ok(branches)
    }

    /// The selected PCRs and, per branch, their values in selection order.
    pub fn compute_pcr_values(&self) -> Result<(PcrSelection, Vec<Vec<Digest>>)> {
        let branches = self.compute_branches()?;
        let mut selection = PcrSelection::new();
        for (bank, pcr) in branches.iter().flat_map(BTreeMap::keys) {
            selection.insert(*bank, *pcr)?;
        }
        if selection.is_empty() {
            return Err(ProfileConstructionError::EmptyProfile);
        }
        let values = branches
            .iter()
            .map(|branch| {
                selection
                    .iter()
                    .map(|(bank, pcr)| {
                        branch
                            .get(&(bank, pcr))
                            .cloned()
                            .ok_or(ProfileConstructionError::InconsistentSelection { bank, pcr })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((selection, values))
    }

    /// The acceptable values of each PCR, across all branches.
    pub fn expected_values(&self) -> Result<BTreeMap<(HashAlgorithm, u32), Vec<Digest>>> {
        let mut expected: BTreeMap<_, Vec<Digest>> = BTreeMap::new();
        for branch in self.compute_branches()? {
            for (key, value) in branch {
                let values = expected.entry(key).or_default();
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        Ok(expected)
    }

    /// One TPM2_PolicyPCR digest per branch.
    pub fn pcr_policy_digests(&self) -> Result<(PcrSelection, Vec<Digest>)> {
        let (selection, values) = self.compute_pcr_values()?;
        let mut digests = Vec::with_capacity(values.len());
        for branch in values {
            let digest = policy::policy_pcr(
                &policy::empty_policy(),
                &selection,
                &policy::pcr_composite_digest(&branch),
            );
            if !digests.contains(&digest) {
                digests.push(digest);
            }
        }
        Ok((selection, digests))
    }
}

/// Everything the profile for a boot chain is computed from.
#[derive(Debug, Clone)]
pub struct ProfileInputs {
    pub pcr_bank: HashAlgorithm,
    pub secure_boot: Option<SecureBootPolicyParams>,
    pub boot_manager: Option<BootManagerParams>,
    pub systemd_stub: Option<SystemdStubParams>,
    pub model: Option<ModelProfileParams>,
}

impl ProfileInputs {
    pub fn new(pcr_bank: HashAlgorithm) -> Self {
        Self {
            pcr_bank,
            secure_boot: None,
            boot_manager: None,
            systemd_stub: None,
            model: None,
        }
    }

    pub fn build(&self) -> Result<ProtectionProfile> {
        let mut profile = ProtectionProfile::new();
        if let Some(params) = &self.secure_boot {
            add_secure_boot_policy_profile(&mut profile, self.pcr_bank, params)?;
        }
        if let Some(params) = &self.boot_manager {
            add_boot_manager_profile(&mut profile, self.pcr_bank, params)?;
        }
        if let Some(params) = &self.systemd_stub {
            add_systemd_stub_profile(&mut profile, self.pcr_bank, params)?;
        }
        if let Some(params) = &self.model {
            add_model_profile(&mut profile, self.pcr_bank, params)?;
        }
        if profile.is_empty() {
            return Err(ProfileConstructionError::MissingParameter("profile inputs"));
        }
        log::debug!("Built PCR protection profile with {} operations", profile.ops().len());
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const SHA256: HashAlgorithm = HashAlgorithm::Sha256;

    fn h(s: &str) -> Digest {
        SHA256.hash(s.as_bytes())
    }

    #[test]
    fn linear_profile() -> Result<()> {
        let mut profile = ProtectionProfile::new();
        profile.extend_pcr(SHA256, 7, h("a"))?.extend_pcr(SHA256, 7, h("b"))?;
        let branches = profile.compute_branches()?;
        assert_eq!(branches.len(), 1);
        let expected = SHA256.extend(&SHA256.extend(&SHA256.zero_digest(), &h("a")), &h("b"));
        assert_eq!(branches[0][&(SHA256, 7)], expected);
        Ok(())
    }

    #[test]
    fn or_forks_and_composes() -> Result<()> {
        let mut a = ProtectionProfile::new();
        a.extend_pcr(SHA256, 12, h("cmdline-1"))?;
        let mut b = ProtectionProfile::new();
        b.extend_pcr(SHA256, 12, h("cmdline-2"))?;

        let mut profile = ProtectionProfile::new();
        profile
            .add_pcr_value(SHA256, 7, h("pcr7"))?
            .add_profile_or(vec![a.clone(), b.clone()])?
            .extend_pcr(SHA256, 12, h("epoch"))?
            .add_profile_or(vec![a, b])?;

        let branches = profile.compute_branches()?;
        assert_eq!(branches.len(), 4);
        assert!(branches.iter().all(|b| b[&(SHA256, 7)] == h("pcr7")));

        let expected = profile.expected_values()?;
        assert_eq!(expected[&(SHA256, 7)].len(), 1);
        assert_eq!(expected[&(SHA256, 12)].len(), 4);
        Ok(())
    }

    #[test]
    fn duplicate_branches_collapse() -> Result<()> {
        let mut a = ProtectionProfile::new();
        a.extend_pcr(SHA256, 4, h("x"))?;
        let mut profile = ProtectionProfile::new();
        profile.add_profile_or(vec![a.clone(), a])?;
        assert_eq!(profile.compute_branches()?.len(), 1);
        Ok(())
    }

    #[test]
    fn inconsistent_selection_is_rejected() -> Result<()> {
        let mut a = ProtectionProfile::new();
        a.extend_pcr(SHA256, 4, h("x"))?;
        let mut b = ProtectionProfile::new();
        b.extend_pcr(SHA256, 7, h("y"))?;
        let mut profile = ProtectionProfile::new();
        profile.add_profile_or(vec![a, b])?;
        assert!(matches!(
            profile.compute_pcr_values(),
            Err(ProfileConstructionError::InconsistentSelection { .. })
        ));
        Ok(())
    }

    #[test]
    fn malformed_inputs() {
        let mut profile = ProtectionProfile::new();
        assert!(profile.extend_pcr(SHA256, 24, h("x")).is_err());
        assert!(profile
            .extend_pcr(SHA256, 7, Digest::from(vec![0u8; 20]))
            .is_err());
        assert!(profile.add_profile_or(vec![]).is_err());
        assert_eq!(
            ProtectionProfile::new().compute_pcr_values(),
            Err(ProfileConstructionError::EmptyProfile)
        );
        assert!(matches!(
            parse_digest(SHA256, "shim", "not-hex"),
            Err(ProfileConstructionError::InvalidDigest { .. })
        ));
        assert!(matches!(
            parse_digest(SHA256, "shim", "abcd"),
            Err(ProfileConstructionError::Measurement { .. })
        ));
    }

    #[test]
    fn deterministic() -> Result<()> {
        let build = || -> Result<(PcrSelection, Vec<Digest>)> {
            let mut a = ProtectionProfile::new();
            a.extend_pcr(SHA256, 12, h("a"))?;
            let mut b = ProtectionProfile::new();
            b.extend_pcr(SHA256, 12, h("b"))?;
            let mut profile = ProtectionProfile::new();
            profile.add_profile_or(vec![a, b])?;
            Ok(profile.pcr_policy_digests()?)
        };
        assert_eq!(build()?, build()?);
        assert_eq!(build()?.1.len(), 2);
        Ok(())
    }

    #[test]
    fn too_many_branches() -> Result<()> {
        let mut profile = ProtectionProfile::new();
        for round in 0..5 {
            let alternatives = (0..8)
                .map(|i| -> Result<ProtectionProfile> {
                    let mut p = ProtectionProfile::new();
                    p.extend_pcr(SHA256, 12, h(&format!("{}-{}", round, i)))?;
                    Ok(p)
                })
                .collect::<Result<Vec<_>>>()?;
            profile.add_profile_or(alternatives)?;
        }
        assert!(matches!(
            profile.compute_branches(),
            Err(ProfileConstructionError::Policy(PolicyError::TooManyBranches(_)))
        ));
        Ok(())
    }

    #[test]
    fn inputs_required() {
        assert_eq!(
            ProfileInputs::new(SHA256).build(),
            Err(ProfileConstructionError::MissingParameter("profile inputs"))
        );
    }
}
