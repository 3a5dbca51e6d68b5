//! Seal disk encryption keys to a TPM and release them only to a boot chain
//! that measured what it was expected to.
//!
//! # Get Started
//!
//! Provision the TPM once, then seal the volume key to a profile of the
//! boot chain:
//! ```bash
//! tpm-secboot provision --lockout-auth-file lockout.key
//! tpm-secboot --config /etc/tpm-secboot.yaml seal ubuntu-data --key-file data.key
//! ```
//!
//! At boot, measure the model, unlock the volumes and lock the sealed keys
//! away for the rest of the boot:
//! ```bash
//! tpm-secboot --config /etc/tpm-secboot.yaml boot ubuntu-data ubuntu-save
//! ```
//!
//! Without the `tpm2` feature only the simulated TPM is available, and
//! without the `luks` feature no volume can be activated.

pub mod activate;
pub mod boot;
pub mod cli;
pub mod config;
pub mod keydata;
pub mod lock;
pub mod luks;
pub mod manifest;
pub mod measure;
pub mod model;
pub mod profile;
pub mod provision;
pub mod seal;
pub mod tpm;
