//! YAML configuration.
//!
//! ```yaml
//! pcr-bank: sha256
//! volumes:
//!   - name: ubuntu-data
//!     key-file: /run/mnt/ubuntu-boot/device/fde/ubuntu-data.sealed-key
//!     policy-update-file: /run/mnt/ubuntu-save/device/fde/ubuntu-data.policy-update
//! model-file: /run/mnt/ubuntu-boot/device/model.yaml
//! profile:
//!   kernel-cmdlines:
//!     - snapd_recovery_mode=run console=ttyS0
//!   models:
//!     - series: "16"
//!       brand-id: canonical
//!       model: pc
//!       grade: signed
//!       sign-key-id: 9tydnLa6MTJ-jaQTFUXEwHl1yRx7ZS4K5cyFDhYDcPzhS7uyEkDxdUjg9g08BtNn
//! ```

use crate::activate::{ActivateOptions, DeviceLocator};
use crate::boot::BootPcrs;
use crate::model::ModelAssertion;
use crate::profile::{
    parse_digest, BootManagerParams, ImageLoadEvent, ModelProfileParams, ProfileConstructionError,
    ProfileInputs, SecureBootPolicyParams, SystemdStubParams,
};
use crate::seal::KeyFilePaths;
use crate::tpm::pcr::{HashAlgorithm, PcrError, PCR_COUNT};
use crate::tpm::DaParameters;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error("no volume named {0} is configured")]
    UnknownVolume(String),
    #[error("no model-file is configured")]
    NoModel,
    #[error(transparent)]
    Profile(#[from] ProfileConstructionError),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeConfig {
    pub name: String,
    pub key_file: PathBuf,
    pub policy_update_file: PathBuf,
}

impl VolumeConfig {
    pub fn key_paths(&self, lock_pcr: u32) -> KeyFilePaths {
        KeyFilePaths::new(&self.key_file, &self.policy_update_file).with_lock_pcr(lock_pcr)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SecureBootConfig {
    pub secure_boot: Option<String>,
    pub pk: Option<String>,
    pub kek: Option<String>,
    #[serde(default)]
    pub db: Vec<String>,
    #[serde(default)]
    pub dbx: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ImageConfig {
    pub name: String,
    pub authority: String,
    pub image_digest: String,
    #[serde(default)]
    pub next: Vec<ImageConfig>,
}

impl ImageConfig {
    fn to_event(&self, bank: HashAlgorithm) -> Result<ImageLoadEvent, ProfileConstructionError> {
        Ok(ImageLoadEvent {
            name: self.name.clone(),
            authority: parse_digest(bank, &format!("{} authority", self.name), &self.authority)?,
            image_digest: parse_digest(bank, &format!("{} image", self.name), &self.image_digest)?,
            next: self
                .next
                .iter()
                .map(|image| image.to_event(bank))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// What a sealed key's PCR profile is built from. Digests are hex encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub secure_boot: Option<SecureBootConfig>,
    /// Include boot manager code measurements of `load-sequences`.
    pub boot_manager: bool,
    pub load_sequences: Vec<ImageConfig>,
    pub kernel_cmdlines: Vec<String>,
    pub models: Vec<ModelAssertion>,
}

impl ProfileConfig {
    pub fn to_inputs(
        &self,
        bank: HashAlgorithm,
        pcrs: &BootPcrs,
    ) -> Result<ProfileInputs, ProfileConstructionError> {
        let load_sequences = self
            .load_sequences
            .iter()
            .map(|image| image.to_event(bank))
            .collect::<Result<Vec<_>, _>>()?;
        let variable = |name: &str, value: &Option<String>| {
            value
                .as_deref()
                .map(|value| parse_digest(bank, name, value))
                .transpose()
        };
        let variables = |name: &str, values: &[String]| {
            values
                .iter()
                .map(|value| parse_digest(bank, name, value))
                .collect::<Result<Vec<_>, _>>()
        };

        let mut inputs = ProfileInputs::new(bank);
        if let Some(sb) = &self.secure_boot {
            inputs.secure_boot = Some(SecureBootPolicyParams {
                secure_boot: variable("SecureBoot", &sb.secure_boot)?,
                pk: variable("PK", &sb.pk)?,
                kek: variable("KEK", &sb.kek)?,
                db: variables("db", &sb.db)?,
                dbx: variables("dbx", &sb.dbx)?,
                load_sequences: load_sequences.clone(),
            });
        }
        if self.boot_manager {
            inputs.boot_manager = Some(BootManagerParams { load_sequences });
        }
        if !self.kernel_cmdlines.is_empty() {
            inputs.systemd_stub = Some(SystemdStubParams {
                kernel_cmdlines: self.kernel_cmdlines.clone(),
                ..Default::default()
            });
        }
        if !self.models.is_empty() {
            inputs.model = Some(ModelProfileParams {
                pcr_index: pcrs.model,
                models: self.models.clone(),
            });
        }
        Ok(inputs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    pub pcr_bank: HashAlgorithm,
    pub pcrs: BootPcrs,
    pub devices: DeviceLocator,
    pub activate: ActivateOptions,
    pub dictionary_attack: DaParameters,
    pub model_file: Option<PathBuf>,
    pub volumes: Vec<VolumeConfig>,
    pub profile: ProfileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pcr_bank: HashAlgorithm::Sha256,
            pcrs: BootPcrs::default(),
            devices: DeviceLocator::default(),
            activate: ActivateOptions::default(),
            dictionary_attack: DaParameters::default(),
            model_file: None,
            volumes: Vec::new(),
            profile: ProfileConfig::default(),
        }
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_yaml(path)?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for pcr in [self.pcrs.model, self.pcrs.lock] {
            if pcr >= PCR_COUNT {
                return Err(PcrError::PcrOutOfRange(pcr).into());
            }
        }
        Ok(())
    }

    pub fn volume(&self, name: &str) -> Result<&VolumeConfig> {
        self.volumes
            .iter()
            .find(|volume| volume.name == name)
            .ok_or_else(|| ConfigError::UnknownVolume(name.to_string()))
    }

    /// The verified model assertion of this device.
    pub fn model(&self) -> Result<ModelAssertion> {
        let path = self.model_file.as_deref().ok_or(ConfigError::NoModel)?;
        read_yaml(path)
    }

    pub fn profile_inputs(&self) -> Result<ProfileInputs> {
        Ok(self.profile.to_inputs(self.pcr_bank, &self.pcrs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Grade;
    use crate::profile::{KERNEL_CONFIG_PCR, SECURE_BOOT_POLICY_PCR};
    use eyre::Result;

    fn h(s: &str) -> String {
        HashAlgorithm::Sha256.hash(s.as_bytes()).to_hex()
    }

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> Result<PathBuf> {
        let path = dir.path().join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    #[test]
    fn defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load(&write(&dir, "config.yaml", "{}")?)?;
        assert_eq!(config, Config::default());
        assert_eq!(config.devices.by_label_dir, Path::new("/dev/disk/by-label"));
        assert_eq!(config.pcrs.model, KERNEL_CONFIG_PCR);
        assert!(matches!(config.model(), Err(ConfigError::NoModel)));
        assert!(matches!(
            config.volume("ubuntu-data"),
            Err(ConfigError::UnknownVolume(_))
        ));
        Ok(())
    }

    #[test]
    fn full_config_builds_profile() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = write(
            &dir,
            "model.yaml",
            "series: '16'\nbrand-id: canonical\nmodel: pc\ngrade: dangerous\nsign-key-id: key\n",
        )?;
        let yaml = format!(
            r#"
pcr-bank: sha256
devices:
  by-label-dir: /tmp/labels
activate:
  passphrase-tries: 1
model-file: {model}
volumes:
  - name: ubuntu-data
    key-file: /boot/ubuntu-data.sealed-key
    policy-update-file: /save/ubuntu-data.policy-update
profile:
  secure-boot:
    secure-boot: {sb}
    pk: {pk}
    kek: {kek}
    db: [{db}]
    dbx: [{dbx1}, {dbx2}]
  boot-manager: true
  load-sequences:
    - name: shim
      authority: {ca}
      image-digest: {shim}
      next:
        - name: kernel
          authority: {ca}
          image-digest: {kernel}
  kernel-cmdlines:
    - snapd_recovery_mode=run
  models:
    - series: "16"
      brand-id: canonical
      model: pc
      sign-key-id: key
"#,
            model = model.display(),
            sb = h("SecureBoot"),
            pk = h("PK"),
            kek = h("KEK"),
            db = h("db"),
            dbx1 = h("dbx-1"),
            dbx2 = h("dbx-2"),
            ca = h("ca"),
            shim = h("shim"),
            kernel = h("kernel"),
        );
        let config = Config::load(&write(&dir, "config.yaml", &yaml)?)?;
        assert_eq!(config.activate.passphrase_tries, 1);
        assert_eq!(config.devices.mapper_dir, Path::new("/dev/mapper"));
        assert_eq!(config.model()?.grade, Grade::Dangerous);
        let paths = config.volume("ubuntu-data")?.key_paths(config.pcrs.lock);
        assert_eq!(paths.key, Path::new("/boot/ubuntu-data.sealed-key"));
        assert_eq!(paths.lock_pcr, 12);

        let profile = config.profile_inputs()?.build()?;
        let expected = profile.expected_values()?;
        assert_eq!(expected[&(HashAlgorithm::Sha256, SECURE_BOOT_POLICY_PCR)].len(), 2);
        assert_eq!(expected.len(), 3);
        Ok(())
    }

    #[test]
    fn invalid_configs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write(&dir, "unknown.yaml", "pcr-banks: sha256\n")?;
        assert!(matches!(Config::load(&path), Err(ConfigError::Yaml { .. })));

        let path = write(&dir, "range.yaml", "pcrs:\n  lock: 24\n")?;
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Pcr(PcrError::PcrOutOfRange(24)))
        ));

        let path = write(&dir, "digest.yaml", "profile:\n  kernel-cmdlines: [quiet]\n  secure-boot:\n    pk: zz\n")?;
        assert!(matches!(
            Config::load(&path)?.profile_inputs(),
            Err(ConfigError::Profile(ProfileConstructionError::InvalidDigest { .. }))
        ));

        let path = write(&dir, "missing.yaml", "profile:\n  secure-boot:\n    db: []\n")?;
        assert!(matches!(
            Config::load(&path)?.profile_inputs()?.build(),
            Err(ProfileConstructionError::MissingParameter(_))
        ));

        assert!(matches!(
            Config::load(&dir.path().join("absent.yaml")),
            Err(ConfigError::Io { .. })
        ));
        Ok(())
    }
}
