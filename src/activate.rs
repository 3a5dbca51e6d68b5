//! Unlocking encrypted volumes with sealed keys, falling back to a
//! passphrase.

use crate::keydata::{KeyDataError, SealedKeyObject};
use crate::luks::{VolumeBackend, VolumeError};
use crate::measure::MeasurementError;
use crate::tpm::pcr::PcrBank;
use crate::tpm::{Sealing, TpmError};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Label suffix of encrypted volumes.
pub const ENCRYPTED_LABEL_SUFFIX: &str = "-enc";

/// Broad classes of activation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The measured boot does not match any authorized PCR policy, or the
    /// sealed key is otherwise unusable on this machine.
    PolicyMismatch,
    /// A transient failure talking to the TPM or a device.
    IoError,
    /// There is no usable TPM.
    TpmUnavailable,
}

#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("current PCR values match no authorized policy branch")]
    NoMatchingBranch,
    #[error("TPM refused to unseal the key: {0}")]
    UnsealRefused(#[source] TpmError),
    #[error("TPM is unavailable: {0}")]
    TpmUnavailable(#[source] TpmError),
    #[error("TPM communication failed: {0}")]
    TpmIo(#[source] TpmError),
    #[error("boot was not measured, sealed keys are not used: {0}")]
    Unmeasured(#[source] Arc<MeasurementError>),
    #[error("cannot load sealed key: {0}")]
    KeyData(#[from] KeyDataError),
    #[error("cannot activate {volume}: {source}")]
    Volume {
        volume: String,
        #[source]
        source: VolumeError,
    },
    #[error("no volume labelled {0}")]
    NoSuchVolume(String),
    #[error("passphrase not accepted after {tries} tries (sealed key: {sealed_key_error})")]
    PassphraseFailed {
        tries: u32,
        sealed_key_error: Box<ActivationError>,
    },
}

impl ActivationError {
    fn from_tpm(err: TpmError) -> Self {
        if err.is_unavailable() {
            return ActivationError::TpmUnavailable(err);
        }
        match err {
            TpmError::Io(_) => ActivationError::TpmIo(err),
            #[cfg(feature = "tpm2")]
            TpmError::TssEsapi(_) => ActivationError::TpmIo(err),
            err => ActivationError::UnsealRefused(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ActivationError::NoMatchingBranch | ActivationError::UnsealRefused(_) => {
                ErrorKind::PolicyMismatch
            }
            ActivationError::TpmUnavailable(_) | ActivationError::Unmeasured(_) => {
                ErrorKind::TpmUnavailable
            }
            ActivationError::TpmIo(_) | ActivationError::NoSuchVolume(_) => ErrorKind::IoError,
            ActivationError::KeyData(KeyDataError::Io { .. }) => ErrorKind::IoError,
            ActivationError::KeyData(_) => ErrorKind::PolicyMismatch,
            ActivationError::Volume {
                source: VolumeError::KeyRejected { .. },
                ..
            } => ErrorKind::PolicyMismatch,
            ActivationError::Volume { .. } => ErrorKind::IoError,
            ActivationError::PassphraseFailed {
                sealed_key_error, ..
            } => sealed_key_error.kind(),
        }
    }

    /// Only transient I/O failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::IoError
    }
}

pub type Result<T, E = ActivationError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ActivateOptions {
    /// Passphrases read before giving up. No passphrase is read when zero.
    pub passphrase_tries: u32,
}

impl Default for ActivateOptions {
    fn default() -> Self {
        Self {
            passphrase_tries: 3,
        }
    }
}

/// How a volume was unlocked.
#[derive(Debug)]
pub enum Unlocked {
    SealedKey,
    /// The sealed key could not be used, for the recorded reason, and a
    /// passphrase was accepted instead.
    Passphrase { sealed_key_error: ActivationError },
}

impl Unlocked {
    pub fn passphrase_used(&self) -> bool {
        matches!(self, Unlocked::Passphrase { .. })
    }
}

fn unseal_key<T>(tpm: Option<&mut T>, key_path: &Path) -> Result<Zeroizing<Vec<u8>>>
where
    T: PcrBank + Sealing + ?Sized,
{
    let tpm = tpm.ok_or_else(|| {
        ActivationError::TpmUnavailable(TpmError::Unavailable("no TPM device".into()))
    })?;
    let key = SealedKeyObject::read(key_path)?;
    let values = tpm
        .pcr_read(&key.policy.selection)
        .map_err(ActivationError::from_tpm)?;
    let steps = key
        .unseal_policy(&values)?
        .ok_or(ActivationError::NoMatchingBranch)?;
    log::debug!(
        "PCR policy generation {} matches, unsealing with {} policy assertions",
        key.policy.generation,
        steps.len()
    );
    tpm.unseal(&key.sealed, &steps)
        .map_err(ActivationError::from_tpm)
}

fn read_passphrase(reader: &mut dyn BufRead) -> Option<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    match reader.read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => {
            let len = line.trim_end_matches(&['\r', '\n'][..]).len();
            line.truncate(len);
            Some(line)
        }
        Err(e) => {
            log::error!("Cannot read passphrase: {}", e);
            None
        }
    }
}

fn activate_with_passphrase<V>(
    volumes: &mut V,
    volume_name: &str,
    source_device: &Path,
    reader: &mut dyn BufRead,
    tries: u32,
    sealed_key_error: ActivationError,
) -> Result<Unlocked>
where
    V: VolumeBackend + ?Sized,
{
    for attempt in 1..=tries {
        let Some(passphrase) = read_passphrase(reader) else {
            break;
        };
        match volumes.activate(volume_name, source_device, passphrase.as_bytes()) {
            Ok(()) => {
                log::info!("{} activated with passphrase", volume_name);
                return Ok(Unlocked::Passphrase { sealed_key_error });
            }
            Err(VolumeError::KeyRejected { .. }) => {
                log::warn!("Passphrase {}/{} for {} rejected", attempt, tries, volume_name);
            }
            Err(e) => {
                log::error!("Cannot activate {} with passphrase: {}", volume_name, e);
                break;
            }
        }
    }
    Err(ActivationError::PassphraseFailed {
        tries,
        sealed_key_error: Box::new(sealed_key_error),
    })
}

/// Activates `source_device` as `volume_name` with the key sealed in
/// `key_path`.
///
/// If the key cannot be unsealed or is not accepted and `passphrase` is
/// given, up to `options.passphrase_tries` lines are read from it and tried
/// as passphrases. A sealed key is never used unless the TPM released it.
#[tracing::instrument(skip(tpm, volumes, passphrase, options), fields(device = %source_device.display()))]
pub fn activate_volume_with_sealed_key<T, V>(
    tpm: Option<&mut T>,
    volumes: &mut V,
    volume_name: &str,
    source_device: &Path,
    key_path: &Path,
    passphrase: Option<&mut dyn BufRead>,
    options: &ActivateOptions,
) -> Result<Unlocked>
where
    T: PcrBank + Sealing + ?Sized,
    V: VolumeBackend + ?Sized,
{
    activate_volume(
        unseal_key(tpm, key_path),
        volumes,
        volume_name,
        source_device,
        key_path,
        passphrase,
        options,
    )
}

/// Activates with an unsealed key, or with a passphrase if unsealing failed
/// or the key was not accepted.
pub(crate) fn activate_volume<V>(
    unsealed: Result<Zeroizing<Vec<u8>>>,
    volumes: &mut V,
    volume_name: &str,
    source_device: &Path,
    key_path: &Path,
    passphrase: Option<&mut dyn BufRead>,
    options: &ActivateOptions,
) -> Result<Unlocked>
where
    V: VolumeBackend + ?Sized,
{
    let sealed_key_error = match unsealed {
        Ok(key) => match volumes.activate(volume_name, source_device, &key) {
            Ok(()) => {
                log::info!("{} activated with sealed key", volume_name);
                return Ok(Unlocked::SealedKey);
            }
            Err(source) => ActivationError::Volume {
                volume: volume_name.to_string(),
                source,
            },
        },
        Err(e) => e,
    };
    log::warn!(
        "Cannot activate {} with sealed key from {}: {}",
        volume_name,
        key_path.display(),
        sealed_key_error
    );
    match passphrase {
        Some(reader) if options.passphrase_tries > 0 => activate_with_passphrase(
            volumes,
            volume_name,
            source_device,
            reader,
            options.passphrase_tries,
            sealed_key_error,
        ),
        _ => Err(sealed_key_error),
    }
}

/// Finds volumes by filesystem label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceLocator {
    pub by_label_dir: PathBuf,
    pub mapper_dir: PathBuf,
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self {
            by_label_dir: PathBuf::from("/dev/disk/by-label"),
            mapper_dir: PathBuf::from("/dev/mapper"),
        }
    }
}

impl DeviceLocator {
    pub fn find_by_label(&self, label: &str) -> Option<PathBuf> {
        let path = self.by_label_dir.join(label);
        path.exists().then_some(path)
    }
}

/// A volume ready to be mounted.
#[derive(Debug)]
pub struct VolumeDevice {
    pub device: PathBuf,
    /// How the volume was unlocked, `None` if it is not encrypted.
    pub unlocked: Option<Unlocked>,
}

/// Activates the volume labelled `<name>-enc` as `<name>` if there is one,
/// otherwise returns the unencrypted volume labelled `<name>`.
pub fn unlock_volume_if_encrypted<T, V>(
    tpm: Option<&mut T>,
    volumes: &mut V,
    locator: &DeviceLocator,
    name: &str,
    key_path: &Path,
    passphrase: Option<&mut dyn BufRead>,
    options: &ActivateOptions,
) -> Result<VolumeDevice>
where
    T: PcrBank + Sealing + ?Sized,
    V: VolumeBackend + ?Sized,
{
    let encrypted_label = format!("{}{}", name, ENCRYPTED_LABEL_SUFFIX);
    if let Some(source_device) = locator.find_by_label(&encrypted_label) {
        let unlocked = activate_volume_with_sealed_key(
            tpm,
            volumes,
            name,
            &source_device,
            key_path,
            passphrase,
            options,
        )?;
        return Ok(VolumeDevice {
            device: locator.mapper_dir.join(name),
            unlocked: Some(unlocked),
        });
    }
    match locator.find_by_label(name) {
        Some(device) => {
            log::info!("{} is not encrypted", name);
            Ok(VolumeDevice {
                device,
                unlocked: None,
            })
        }
        None => Err(ActivationError::NoSuchVolume(name.to_string())),
    }
}
