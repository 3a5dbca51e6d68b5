//! Kernel command line measurements made by the systemd EFI stub.

use super::{ProfileConstructionError, ProtectionProfile, Result};
use crate::tpm::pcr::{Digest, HashAlgorithm};

pub const KERNEL_CONFIG_PCR: u32 = 12;

#[derive(Debug, Clone)]
pub struct SystemdStubParams {
    pub pcr_index: u32,
    /// Every command line the kernel may be started with.
    pub kernel_cmdlines: Vec<String>,
}

impl Default for SystemdStubParams {
    fn default() -> Self {
        Self {
            pcr_index: KERNEL_CONFIG_PCR,
            kernel_cmdlines: Vec::new(),
        }
    }
}

/// The stub measures the command line as NUL terminated UTF-16LE.
pub fn kernel_cmdline_digest(bank: HashAlgorithm, cmdline: &str) -> Digest {
    let mut data: Vec<u8> = cmdline.encode_utf16().flat_map(u16::to_le_bytes).collect();
    data.extend_from_slice(&[0, 0]);
    bank.hash(&data)
}

pub fn add_systemd_stub_profile(
    profile: &mut ProtectionProfile,
    bank: HashAlgorithm,
    params: &SystemdStubParams,
) -> Result<()> {
    if params.kernel_cmdlines.is_empty() {
        return Err(ProfileConstructionError::MissingParameter("kernel command lines"));
    }
    let alternatives = params
        .kernel_cmdlines
        .iter()
        .map(|cmdline| -> Result<ProtectionProfile> {
            let mut branch = ProtectionProfile::new();
            branch.extend_pcr(bank, params.pcr_index, kernel_cmdline_digest(bank, cmdline))?;
            Ok(branch)
        })
        .collect::<Result<Vec<_>>>()?;
    profile.add_profile_or(alternatives)?;
    Ok(())
}
