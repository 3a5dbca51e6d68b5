//! UEFI secure boot policy (PCR 7) and boot manager code (PCR 4) profiles.

use super::{check_measurement, ProfileConstructionError, ProtectionProfile, Result};
use crate::tpm::pcr::{Digest, HashAlgorithm};
use std::collections::HashSet;

pub const SECURE_BOOT_POLICY_PCR: u32 = 7;
pub const BOOT_MANAGER_CODE_PCR: u32 = 4;

const BOOT_MANAGER_ACTION: &[u8] = b"Calling EFI Application from Boot Option";
const SEPARATOR_EVENT_DATA: [u8; 4] = [0; 4];

/// An EFI image that firmware or a previous stage loads, and the images it
/// may load in turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLoadEvent {
    pub name: String,
    /// Measurement of the db entry that verifies this image.
    pub authority: Digest,
    /// Authenticode digest of the image.
    pub image_digest: Digest,
    pub next: Vec<ImageLoadEvent>,
}

impl ImageLoadEvent {
    pub fn new(name: &str, authority: Digest, image_digest: Digest) -> Self {
        Self {
            name: name.to_string(),
            authority,
            image_digest,
            next: Vec::new(),
        }
    }

    pub fn then(mut self, next: ImageLoadEvent) -> Self {
        self.next.push(next);
        self
    }
}

/// Every root to leaf path through the load trees.
fn load_paths(sequences: &[ImageLoadEvent]) -> Vec<Vec<&ImageLoadEvent>> {
    let mut paths = Vec::new();
    for event in sequences {
        if event.next.is_empty() {
            paths.push(vec![event]);
            continue;
        }
        for tail in load_paths(&event.next) {
            let mut path = Vec::with_capacity(tail.len() + 1);
            path.push(event);
            path.extend(tail);
            paths.push(path);
        }
    }
    paths
}

fn check_images(bank: HashAlgorithm, sequences: &[ImageLoadEvent]) -> Result<()> {
    for event in sequences {
        check_measurement(bank, &format!("{} authority", event.name), &event.authority)?;
        check_measurement(bank, &format!("{} image", event.name), &event.image_digest)?;
        check_images(bank, &event.next)?;
    }
    Ok(())
}

/// Measurements of the secure boot configuration. `db` and `dbx` list every
/// value the variable may hold at boot, e.g. before and after a pending
/// update is applied.
#[derive(Debug, Clone, Default)]
pub struct SecureBootPolicyParams {
    pub secure_boot: Option<Digest>,
    pub pk: Option<Digest>,
    pub kek: Option<Digest>,
    pub db: Vec<Digest>,
    pub dbx: Vec<Digest>,
    pub load_sequences: Vec<ImageLoadEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct BootManagerParams {
    pub load_sequences: Vec<ImageLoadEvent>,
}

fn separator(bank: HashAlgorithm) -> Digest {
    bank.hash(&SEPARATOR_EVENT_DATA)
}

fn required<'a>(value: &'a Option<Digest>, name: &'static str) -> Result<&'a Digest> {
    value
        .as_ref()
        .ok_or(ProfileConstructionError::MissingParameter(name))
}

pub fn add_secure_boot_policy_profile(
    profile: &mut ProtectionProfile,
    bank: HashAlgorithm,
    params: &SecureBootPolicyParams,
) -> Result<()> {
    let variables = [
        ("SecureBoot", required(&params.secure_boot, "SecureBoot variable")?),
        ("PK", required(&params.pk, "PK variable")?),
        ("KEK", required(&params.kek, "KEK variable")?),
    ];
    if params.db.is_empty() {
        return Err(ProfileConstructionError::MissingParameter("db variable"));
    }
    if params.dbx.is_empty() {
        return Err(ProfileConstructionError::MissingParameter("dbx variable"));
    }
    if params.load_sequences.is_empty() {
        return Err(ProfileConstructionError::MissingParameter("load sequences"));
    }
    for (name, digest) in variables {
        check_measurement(bank, name, digest)?;
    }
    check_images(bank, &params.load_sequences)?;

    let mut verifications = Vec::new();
    for path in load_paths(&params.load_sequences) {
        let mut seen = HashSet::new();
        let mut branch = ProtectionProfile::new();
        for event in path {
            if seen.insert(&event.authority) {
                branch.extend_pcr(bank, SECURE_BOOT_POLICY_PCR, event.authority.clone())?;
            }
        }
        verifications.push(branch);
    }

    let mut configurations = Vec::with_capacity(params.db.len() * params.dbx.len());
    for db in &params.db {
        check_measurement(bank, "db", db)?;
        for dbx in &params.dbx {
            check_measurement(bank, "dbx", dbx)?;
            let mut branch = ProtectionProfile::new();
            for (_, digest) in &variables {
                branch.extend_pcr(bank, SECURE_BOOT_POLICY_PCR, (*digest).clone())?;
            }
            branch
                .extend_pcr(bank, SECURE_BOOT_POLICY_PCR, db.clone())?
                .extend_pcr(bank, SECURE_BOOT_POLICY_PCR, dbx.clone())?
                .extend_pcr(bank, SECURE_BOOT_POLICY_PCR, separator(bank))?
                .add_profile_or(verifications.clone())?;
            configurations.push(branch);
        }
    }
    log::debug!(
        "Secure boot profile: {} variable configurations, {} load paths",
        configurations.len(),
        verifications.len()
    );
    profile.add_profile_or(configurations)?;
    Ok(())
}

pub fn add_boot_manager_profile(
    profile: &mut ProtectionProfile,
    bank: HashAlgorithm,
    params: &BootManagerParams,
) -> Result<()> {
    if params.load_sequences.is_empty() {
        return Err(ProfileConstructionError::MissingParameter("load sequences"));
    }
    check_images(bank, &params.load_sequences)?;

    let mut paths = Vec::new();
    for path in load_paths(&params.load_sequences) {
        let mut branch = ProtectionProfile::new();
        for event in path {
            branch.extend_pcr(bank, BOOT_MANAGER_CODE_PCR, event.image_digest.clone())?;
        }
        paths.push(branch);
    }
    profile
        .extend_pcr(bank, BOOT_MANAGER_CODE_PCR, bank.hash(BOOT_MANAGER_ACTION))?
        .extend_pcr(bank, BOOT_MANAGER_CODE_PCR, separator(bank))?
        .add_profile_or(paths)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use eyre::Result;

    const SHA256: HashAlgorithm = HashAlgorithm::Sha256;

    pub(crate) fn h(s: &str) -> Digest {
        SHA256.hash(s.as_bytes())
    }

    /// shim loads grub, grub loads one of two kernels.
    pub(crate) fn shim_grub_kernels() -> Vec<ImageLoadEvent> {
        let grub = ImageLoadEvent::new("grub", h("ca"), h("grub"))
            .then(ImageLoadEvent::new("kernel-1", h("ca"), h("kernel-1")))
            .then(ImageLoadEvent::new("kernel-2", h("vendor"), h("kernel-2")));
        vec![ImageLoadEvent::new("shim", h("ca"), h("shim")).then(grub)]
    }

    pub(crate) fn secure_boot_params() -> SecureBootPolicyParams {
        SecureBootPolicyParams {
            secure_boot: Some(h("SecureBoot")),
            pk: Some(h("PK")),
            kek: Some(h("KEK")),
            db: vec![h("db")],
            dbx: vec![h("dbx-1"), h("dbx-2")],
            load_sequences: shim_grub_kernels(),
        }
    }

    fn replay(measurements: &[Digest]) -> Digest {
        measurements
            .iter()
            .fold(SHA256.zero_digest(), |pcr, m| SHA256.extend(&pcr, m))
    }

    #[test]
    fn load_paths_cover_every_leaf() {
        let sequences = shim_grub_kernels();
        let paths = load_paths(&sequences);
        let names: Vec<Vec<&str>> = paths
            .iter()
            .map(|p| p.iter().map(|e| e.name.as_str()).collect())
            .collect();
        assert_eq!(
            names,
            vec![vec!["shim", "grub", "kernel-1"], vec!["shim", "grub", "kernel-2"]]
        );
    }

    #[test]
    fn secure_boot_policy() -> Result<()> {
        let mut profile = ProtectionProfile::new();
        add_secure_boot_policy_profile(&mut profile, SHA256, &secure_boot_params())?;
        let expected = profile.expected_values()?;
        let values = &expected[&(SHA256, SECURE_BOOT_POLICY_PCR)];

        let prefix = [h("SecureBoot"), h("PK"), h("KEK"), h("db")];
        let sep = SHA256.hash(&[0; 4]);
        for dbx in ["dbx-1", "dbx-2"] {
            let mut chain = prefix.to_vec();
            chain.extend([h(dbx), sep.clone()]);
            // kernel-1 is verified by the same authority as shim and grub
            let mut one = chain.clone();
            one.push(h("ca"));
            let mut two = chain;
            two.extend([h("ca"), h("vendor")]);
            assert!(values.contains(&replay(&one)));
            assert!(values.contains(&replay(&two)));
        }
        assert_eq!(values.len(), 4);
        Ok(())
    }

    #[test]
    fn boot_manager_code() -> Result<()> {
        let mut profile = ProtectionProfile::new();
        add_boot_manager_profile(
            &mut profile,
            SHA256,
            &BootManagerParams {
                load_sequences: shim_grub_kernels(),
            },
        )?;
        let expected = profile.expected_values()?;
        let action = SHA256.hash(b"Calling EFI Application from Boot Option");
        let sep = SHA256.hash(&[0; 4]);
        let kernel_1 = replay(&[action, sep, h("shim"), h("grub"), h("kernel-1")]);
        assert!(expected[&(SHA256, BOOT_MANAGER_CODE_PCR)].contains(&kernel_1));
        assert_eq!(expected[&(SHA256, BOOT_MANAGER_CODE_PCR)].len(), 2);
        Ok(())
    }

    #[test]
    fn missing_parameters() {
        let mut profile = ProtectionProfile::new();
        let params = SecureBootPolicyParams {
            kek: None,
            ..secure_boot_params()
        };
        assert_eq!(
            add_secure_boot_policy_profile(&mut profile, SHA256, &params),
            Err(ProfileConstructionError::MissingParameter("KEK variable"))
        );
        let params = SecureBootPolicyParams {
            dbx: vec![],
            ..secure_boot_params()
        };
        assert!(add_secure_boot_policy_profile(&mut profile, SHA256, &params).is_err());
        assert_eq!(
            add_boot_manager_profile(&mut profile, SHA256, &BootManagerParams::default()),
            Err(ProfileConstructionError::MissingParameter("load sequences"))
        );
        assert!(profile.is_empty());
    }

    #[test]
    fn wrong_bank_digest() {
        let mut profile = ProtectionProfile::new();
        assert!(matches!(
            add_secure_boot_policy_profile(&mut profile, HashAlgorithm::Sha384, &secure_boot_params()),
            Err(ProfileConstructionError::Measurement { .. })
        ));
    }
}
