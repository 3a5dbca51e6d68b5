//! The order of boot-time operations, enforced by the type system.
//!
//! ```text
//! Unmeasured --measure--> Measured --activate--> Activated --lock--> Locked
//!                             \                    |   ^                ^
//!                              \                   +---+ activate       |
//!                               +------------------lock-----------------+
//! ```
//!
//! A sealed key can only be unsealed after the system epoch and model were
//! measured, and never after access to sealed keys was locked.

use crate::activate::{
    activate_volume, activate_volume_with_sealed_key, ActivateOptions, ActivationError, Unlocked,
};
use crate::lock::{lock_access_to_sealed_keys, LockError, DEFAULT_LOCK_PCR};
use crate::luks::VolumeBackend;
use crate::measure::{measure_model, measure_system_epoch, MeasurementError};
use crate::model::ModelAssertion;
use crate::profile::KERNEL_CONFIG_PCR;
use crate::tpm::Tpm;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BootPcrs {
    /// Receives the system epoch and model measurements.
    pub model: u32,
    pub lock: u32,
}

impl Default for BootPcrs {
    fn default() -> Self {
        Self {
            model: KERNEL_CONFIG_PCR,
            lock: DEFAULT_LOCK_PCR,
        }
    }
}

pub trait BootState {}

pub struct Unmeasured;

pub struct Measured {
    measurement_error: Option<Arc<MeasurementError>>,
}

pub struct Activated {
    measurement_error: Option<Arc<MeasurementError>>,
}

pub struct Locked {
    lock_error: Option<LockError>,
}

impl BootState for Unmeasured {}
impl BootState for Measured {}
impl BootState for Activated {}
impl BootState for Locked {}

pub struct Boot<'t, T: Tpm + ?Sized, S: BootState> {
    tpm: &'t mut T,
    pcrs: BootPcrs,
    state: S,
}

impl<'t, T: Tpm + ?Sized> Boot<'t, T, Unmeasured> {
    pub fn new(tpm: &'t mut T, pcrs: BootPcrs) -> Self {
        Self {
            tpm,
            pcrs,
            state: Unmeasured,
        }
    }

    /// Measures the system epoch, then `model`. A failure is recorded rather
    /// than returned: the boot goes on, but no sealed key will be used.
    pub fn measure(self, model: &ModelAssertion) -> Boot<'t, T, Measured> {
        let result = measure_system_epoch(&mut *self.tpm, self.pcrs.model)
            .and_then(|()| measure_model(&mut *self.tpm, self.pcrs.model, model));
        if let Err(e) = &result {
            log::error!("Boot measurement failed, sealed keys will not be used: {}", e);
        }
        Boot {
            tpm: self.tpm,
            pcrs: self.pcrs,
            state: Measured {
                measurement_error: result.err().map(Arc::new),
            },
        }
    }
}

impl<'t, T: Tpm + ?Sized> Boot<'t, T, Measured> {
    pub fn measurement_error(&self) -> Option<&MeasurementError> {
        self.state.measurement_error.as_deref()
    }

    /// Activates the first volume, moving on to the state in which further
    /// volumes can be activated.
    pub fn activate<V: VolumeBackend + ?Sized>(
        self,
        volumes: &mut V,
        volume_name: &str,
        source_device: &Path,
        key_path: &Path,
        passphrase: Option<&mut dyn BufRead>,
        options: &ActivateOptions,
    ) -> (
        Boot<'t, T, Activated>,
        crate::activate::Result<Unlocked>,
    ) {
        let mut boot = Boot {
            tpm: self.tpm,
            pcrs: self.pcrs,
            state: Activated {
                measurement_error: self.state.measurement_error,
            },
        };
        let result = boot.activate(volumes, volume_name, source_device, key_path, passphrase, options);
        (boot, result)
    }
}

impl<'t, T: Tpm + ?Sized> Boot<'t, T, Activated> {
    /// Activates another volume. If the boot could not be measured the TPM
    /// is not asked for the sealed key and only a passphrase can unlock it.
    pub fn activate<V: VolumeBackend + ?Sized>(
        &mut self,
        volumes: &mut V,
        volume_name: &str,
        source_device: &Path,
        key_path: &Path,
        passphrase: Option<&mut dyn BufRead>,
        options: &ActivateOptions,
    ) -> crate::activate::Result<Unlocked> {
        match &self.state.measurement_error {
            None => activate_volume_with_sealed_key(
                Some(&mut *self.tpm),
                volumes,
                volume_name,
                source_device,
                key_path,
                passphrase,
                options,
            ),
            Some(e) => activate_volume(
                Err(ActivationError::Unmeasured(Arc::clone(e))),
                volumes,
                volume_name,
                source_device,
                key_path,
                passphrase,
                options,
            ),
        }
    }
}

/// States from which access to sealed keys may be locked.
pub trait Lockable: BootState {}
impl Lockable for Measured {}
impl Lockable for Activated {}

impl<'t, T: Tpm + ?Sized, S: Lockable> Boot<'t, T, S> {
    /// Locks access to sealed keys until the next platform reset. A failure
    /// is recorded; the boot goes on regardless.
    pub fn lock(self) -> Boot<'t, T, Locked> {
        let result = lock_access_to_sealed_keys(&mut *self.tpm, self.pcrs.lock);
        if let Err(e) = &result {
            log::error!("{}", e);
        }
        Boot {
            tpm: self.tpm,
            pcrs: self.pcrs,
            state: Locked {
                lock_error: result.err(),
            },
        }
    }
}

impl<'t, T: Tpm + ?Sized> Boot<'t, T, Locked> {
    pub fn lock_error(&self) -> Option<&LockError> {
        self.state.lock_error.as_ref()
    }
}
