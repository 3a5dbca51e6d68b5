//! Encrypted volume activation.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("no keyslot of {} accepts the key", device.display())]
    KeyRejected { device: PathBuf },
    #[error("cannot open {}: {source}", device.display())]
    Device {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "luks")]
    #[error(transparent)]
    CryptSetup(#[from] cryptsetup_rs::Error),
}

pub type Result<T, E = VolumeError> = core::result::Result<T, E>;

/// Encrypted volumes that can be opened with a key.
pub trait VolumeBackend {
    /// Opens `source_device` with `key` and maps it as `volume_name`.
    fn activate(&mut self, volume_name: &str, source_device: &Path, key: &[u8]) -> Result<()>;

    /// Adds `new_key` to a free keyslot, authorized by `existing_key`.
    fn enroll_key(&mut self, source_device: &Path, existing_key: &[u8], new_key: &[u8])
        -> Result<()>;
}

/// LUKS1 and LUKS2 volumes through libcryptsetup.
#[cfg(feature = "luks")]
#[derive(Debug, Default)]
pub struct LuksVolumes;

#[cfg(feature = "luks")]
mod cryptsetup {
    use super::{LuksVolumes, Result, VolumeBackend, VolumeError};
    use cryptsetup_rs::api::{
        Keyslot, Luks1CryptDeviceHandle, Luks2CryptDeviceHandle, LuksCryptDevice,
    };
    use either::Either;
    use std::path::Path;

    type LuksDevice = Either<Luks1CryptDeviceHandle, Luks2CryptDeviceHandle>;

    /// libcryptsetup fails with EPERM when no keyslot accepts the key.
    pub(super) fn keyslot_error(device: &Path, err: cryptsetup_rs::Error) -> VolumeError {
        match err {
            cryptsetup_rs::Error::CryptsetupError(errno) if errno.0 == libc::EPERM => {
                VolumeError::KeyRejected {
                    device: device.to_path_buf(),
                }
            }
            err => VolumeError::CryptSetup(err),
        }
    }

    fn open(source_device: &Path) -> Result<LuksDevice> {
        if !source_device.exists() {
            return Err(VolumeError::Device {
                device: source_device.to_path_buf(),
                source: std::io::ErrorKind::NotFound.into(),
            });
        }
        Ok(cryptsetup_rs::open(source_device)?.luks()?)
    }

    impl VolumeBackend for LuksVolumes {
        fn activate(&mut self, volume_name: &str, source_device: &Path, key: &[u8]) -> Result<()> {
            let mut device = open(source_device)?;
            let keyslot: Keyslot =
                either::for_both!(device.as_mut(), d => d.activate(volume_name, key))
                    .map_err(|e| keyslot_error(source_device, e))?;
            log::info!(
                "Activated {} as {} with keyslot {}",
                source_device.display(),
                volume_name,
                keyslot
            );
            Ok(())
        }

        fn enroll_key(
            &mut self,
            source_device: &Path,
            existing_key: &[u8],
            new_key: &[u8],
        ) -> Result<()> {
            let mut device = open(source_device)?;
            let keyslot: Keyslot = either::for_both!(device.as_mut(), d => {
                d.add_keyslot(new_key, Some(existing_key), None)
            })
            .map_err(|e| keyslot_error(source_device, e))?;
            log::info!("Enrolled key in keyslot {} of {}", keyslot, source_device.display());
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Volumes held in memory. Each device accepts the keys in its keyslots.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryVolumes {
        pub keyslots: BTreeMap<PathBuf, Vec<Vec<u8>>>,
        pub active: BTreeMap<String, PathBuf>,
        pub attempts: usize,
    }

    impl MemoryVolumes {
        pub fn with_volume(device: &Path, key: &[u8]) -> Self {
            let mut volumes = Self::default();
            volumes
                .keyslots
                .insert(device.to_path_buf(), vec![key.to_vec()]);
            volumes
        }

        fn check(&self, device: &Path, key: &[u8]) -> Result<()> {
            let keyslots = self.keyslots.get(device).ok_or_else(|| VolumeError::Device {
                device: device.to_path_buf(),
                source: std::io::ErrorKind::NotFound.into(),
            })?;
            if !keyslots.iter().any(|k| k == key) {
                return Err(VolumeError::KeyRejected {
                    device: device.to_path_buf(),
                });
            }
            Ok(())
        }
    }

    impl VolumeBackend for MemoryVolumes {
        fn activate(&mut self, volume_name: &str, source_device: &Path, key: &[u8]) -> Result<()> {
            self.attempts += 1;
            self.check(source_device, key)?;
            self.active
                .insert(volume_name.to_string(), source_device.to_path_buf());
            Ok(())
        }

        fn enroll_key(
            &mut self,
            source_device: &Path,
            existing_key: &[u8],
            new_key: &[u8],
        ) -> Result<()> {
            self.check(source_device, existing_key)?;
            self.keyslots
                .entry(source_device.to_path_buf())
                .or_default()
                .push(new_key.to_vec());
            Ok(())
        }
    }

    #[test]
    fn add_key() -> eyre::Result<()> {
        let device = Path::new("/dev/vda4");
        let mut volumes = MemoryVolumes::with_volume(device, b"recovery");
        assert!(matches!(
            volumes.enroll_key(device, b"wrong", b"sealed"),
            Err(VolumeError::KeyRejected { .. })
        ));
        volumes.enroll_key(device, b"recovery", b"sealed")?;
        volumes.activate("ubuntu-data", device, b"sealed")?;
        assert_eq!(volumes.active["ubuntu-data"], device);
        Ok(())
    }

    #[cfg(feature = "luks")]
    #[test]
    fn wrong_key_is_rejected_not_failed() {
        use super::cryptsetup::keyslot_error;
        use cryptsetup_rs::Error::{CryptsetupError, IOError};

        let device = Path::new("/dev/vda4");
        assert!(matches!(
            keyslot_error(device, CryptsetupError(errno::Errno(libc::EPERM))),
            VolumeError::KeyRejected { device: d } if d.as_path() == device
        ));
        assert!(matches!(
            keyslot_error(device, CryptsetupError(errno::Errno(libc::EIO))),
            VolumeError::CryptSetup(_)
        ));
        assert!(matches!(
            keyslot_error(device, IOError(std::io::ErrorKind::NotFound.into())),
            VolumeError::CryptSetup(_)
        ));
    }
}
