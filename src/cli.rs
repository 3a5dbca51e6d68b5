use crate::activate::{activate_volume_with_sealed_key, Unlocked, ENCRYPTED_LABEL_SUFFIX};
use crate::boot::Boot;
use crate::config::Config;
use crate::lock::lock_access_to_sealed_keys;
use crate::luks::VolumeBackend;
use crate::measure::{measure_model, measure_system_epoch};
use crate::provision::{provision_tpm_with_parameters, ProvisionMode};
use crate::seal::{seal_key_to_tpm, update_key_pcr_protection_policy, SEALED_KEY_SIZE};
use crate::tpm::pcr::{parse_pcr_selection_list, PcrBank, PcrSelection};
use crate::tpm::{Sealing, Tpm, TpmConnection};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[cfg(feature = "tpm2")]
type DefaultTpm = crate::tpm::device::DeviceTpm;
#[cfg(not(feature = "tpm2"))]
type DefaultTpm = crate::tpm::sim::SimulatedTpm;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// PCRs to show with `digest`
    #[arg(short, long, value_name = "PCR List", default_value = "sha256:0,2,4,7,12", value_parser = parse_pcr_selection_list)]
    pcrs: PcrSelection,

    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    /// Configuration file, built-in defaults if not given
    #[arg(short, long, value_name = "FILE", env = "TPM_SECBOOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show PCR values of the running system
    Digest,
    /// Show the PCR values the configured profile accepts
    Profile,
    /// Take ownership of the TPM
    Provision {
        #[arg(short, long, value_enum, default_value = "if-needed")]
        mode: ProvisionMode,
        /// File holding the new lockout hierarchy authorization value
        #[arg(long, value_name = "FILE")]
        lockout_auth_file: PathBuf,
        /// File holding the current lockout hierarchy authorization value
        #[arg(long, value_name = "FILE")]
        current_lockout_auth_file: Option<PathBuf>,
    },
    /// Seal a volume key to the configured profile
    Seal {
        /// Volume name, e.g. `ubuntu-data`
        #[arg(value_name = "name")]
        volume: String,
        /// Key to seal, a random one from the TPM if not given
        #[arg(long, value_name = "FILE")]
        key_file: Option<PathBuf>,
        /// Also add the key to a keyslot of this LUKS device
        #[arg(long, value_name = "DEVICE", requires = "existing_key_file")]
        enroll: Option<PathBuf>,
        /// Key already enrolled in the LUKS device
        #[arg(long, value_name = "FILE")]
        existing_key_file: Option<PathBuf>,
    },
    /// Authorize the configured profile for an already sealed key
    UpdatePolicy {
        #[arg(value_name = "name")]
        volume: String,
    },
    /// Measure the system epoch and model of this device
    Measure,
    /// Measure, unlock volumes, then lock access to sealed keys
    Boot {
        #[arg(value_name = "name")]
        volumes: Vec<String>,
    },
    /// Lock access to sealed keys until the next reboot
    Lock,
}

fn read_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let secret = fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Ok(Zeroizing::new(secret))
}

#[cfg(feature = "tpm2")]
fn connect() -> Result<TpmConnection<'static, DefaultTpm>> {
    Ok(crate::tpm::device::connect_to_default_tpm()?)
}

#[cfg(not(feature = "tpm2"))]
fn connect() -> Result<TpmConnection<'static, DefaultTpm>> {
    Err(eyre!("built without TPM support, enable the `tpm2` feature"))
}

#[cfg(feature = "luks")]
fn volume_backend() -> Result<Box<dyn VolumeBackend>> {
    Ok(Box::new(crate::luks::LuksVolumes))
}

#[cfg(not(feature = "luks"))]
fn volume_backend() -> Result<Box<dyn VolumeBackend>> {
    Err(eyre!("built without LUKS support, enable the `luks` feature"))
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        env::set_var(TPM_ENV_VAR, &cli.tcti);
        cli
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        let config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        match &self.command {
            Commands::Digest => self.show_pcr_digest()?,
            Commands::Profile => show_profile(&config)?,
            Commands::Provision {
                mode,
                lockout_auth_file,
                current_lockout_auth_file,
            } => {
                let new = read_secret(lockout_auth_file)?;
                let current = match current_lockout_auth_file {
                    Some(path) => read_secret(path)?,
                    None => Zeroizing::new(Vec::new()),
                };
                provision_tpm_with_parameters(
                    &mut *connect()?,
                    *mode,
                    &current,
                    &new,
                    &config.dictionary_attack,
                )?;
            }
            Commands::Seal {
                volume,
                key_file,
                enroll,
                existing_key_file,
            } => seal(
                &config,
                volume,
                key_file.as_deref(),
                enroll.as_deref(),
                existing_key_file.as_deref(),
            )?,
            Commands::UpdatePolicy { volume } => {
                let profile = config.profile_inputs()?.build()?;
                let paths = config.volume(volume)?.key_paths(config.pcrs.lock);
                update_key_pcr_protection_policy(&paths, &profile)?;
            }
            Commands::Measure => {
                let model = config.model()?;
                let mut tpm = connect()?;
                measure_system_epoch(&mut *tpm, config.pcrs.model)?;
                measure_model(&mut *tpm, config.pcrs.model, &model)?;
            }
            Commands::Boot { volumes } => boot(&config, volumes)?,
            Commands::Lock => lock_access_to_sealed_keys(&mut *connect()?, config.pcrs.lock)?,
        };
        Ok(self)
    }

    fn show_pcr_digest(&self) -> Result<()> {
        let values = connect()?.pcr_read(&self.pcrs)?;
        for ((bank, pcr), value) in self.pcrs.iter().zip(values) {
            println!("{}:{:<2} {}", bank, pcr, value);
        }
        Ok(())
    }
}

fn show_profile(config: &Config) -> Result<()> {
    let profile = config.profile_inputs()?.build()?;
    for ((bank, pcr), values) in profile.expected_values()? {
        for value in values {
            println!("{}:{:<2} {}", bank, pcr, value);
        }
    }
    let (selection, branches) = profile.pcr_policy_digests()?;
    println!("{} policy branches over {}", branches.len(), selection);
    Ok(())
}

fn seal(
    config: &Config,
    volume: &str,
    key_file: Option<&Path>,
    enroll: Option<&Path>,
    existing_key_file: Option<&Path>,
) -> Result<()> {
    let paths = config.volume(volume)?.key_paths(config.pcrs.lock);
    let profile = config.profile_inputs()?.build()?;
    let mut tpm = connect()?;
    let key = match key_file {
        Some(path) => read_secret(path)?,
        None => Zeroizing::new(tpm.get_random(SEALED_KEY_SIZE)?),
    };
    seal_key_to_tpm(&mut *tpm, &key, &profile, &paths)?;
    if let (Some(device), Some(existing)) = (enroll, existing_key_file) {
        let existing = read_secret(existing)?;
        volume_backend()?.enroll_key(device, &existing, &key)?;
    }
    Ok(())
}

/// Encrypted volumes among `names`, with their source devices.
fn encrypted_volumes(config: &Config, names: &[String]) -> Result<Vec<(String, PathBuf, PathBuf)>> {
    let mut encrypted = Vec::new();
    for name in names {
        let label = format!("{}{}", name, ENCRYPTED_LABEL_SUFFIX);
        match config.devices.find_by_label(&label) {
            Some(source) => {
                let key = config.volume(name)?.key_file.clone();
                encrypted.push((name.clone(), source, key));
            }
            None => match config.devices.find_by_label(name) {
                Some(device) => println!("{} {}", name, device.display()),
                None => return Err(eyre!("no volume labelled {} or {}", name, label)),
            },
        }
    }
    Ok(encrypted)
}

fn report(name: &str, config: &Config, result: crate::activate::Result<Unlocked>) -> bool {
    match result {
        Ok(unlocked) => {
            if let Unlocked::Passphrase { sealed_key_error } = &unlocked {
                log::warn!("{} unlocked with a passphrase: {}", name, sealed_key_error);
            }
            println!("{} {}", name, config.devices.mapper_dir.join(name).display());
            true
        }
        Err(e) => {
            log::error!("Cannot unlock {}: {}", name, e);
            false
        }
    }
}

fn boot(config: &Config, names: &[String]) -> Result<()> {
    let mut tpm = match connect() {
        Ok(tpm) => Some(tpm),
        Err(e) => {
            log::error!("Cannot connect to the TPM, only passphrases can be used: {}", e);
            None
        }
    };
    let stdin = io::stdin();
    let mut input = stdin.lock();
    boot_volumes(config, names, tpm.as_deref_mut(), volume_backend(), &mut input)
}

/// Measures, unlocks `names` and locks access to sealed keys. The lock is
/// also taken when the volumes cannot even be looked up.
fn boot_volumes<T: Tpm + ?Sized>(
    config: &Config,
    names: &[String],
    tpm: Option<&mut T>,
    volumes: Result<Box<dyn VolumeBackend>>,
    input: &mut dyn BufRead,
) -> Result<()> {
    let prepared = config
        .model()
        .map_err(eyre::Report::from)
        .and_then(|model| Ok((model, encrypted_volumes(config, names)?, volumes?)));
    let (model, encrypted, mut volumes) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            if let Some(tpm) = tpm {
                if let Err(lock_error) = lock_access_to_sealed_keys(tpm, config.pcrs.lock) {
                    log::warn!("Sealed keys remain accessible: {}", lock_error);
                }
            }
            return Err(e);
        }
    };
    let options = &config.activate;
    let mut failed = 0;

    match tpm {
        Some(tpm) => {
            let boot = Boot::new(tpm, config.pcrs).measure(&model);
            let boot = match encrypted.split_first() {
                None => boot.lock(),
                Some(((name, source, key), rest)) => {
                    let (mut boot, result) =
                        boot.activate(volumes.as_mut(), name, source, key, Some(&mut *input), options);
                    failed += usize::from(!report(name, config, result));
                    for (name, source, key) in rest {
                        let result =
                            boot.activate(volumes.as_mut(), name, source, key, Some(&mut *input), options);
                        failed += usize::from(!report(name, config, result));
                    }
                    boot.lock()
                }
            };
            if let Some(e) = boot.lock_error() {
                log::warn!("Sealed keys remain accessible: {}", e);
            }
        }
        None => {
            for (name, source, key) in &encrypted {
                let result = activate_volume_with_sealed_key(
                    None::<&mut T>,
                    volumes.as_mut(),
                    name,
                    source,
                    key,
                    Some(&mut *input),
                    options,
                );
                failed += usize::from(!report(name, config, result));
            }
        }
    }
    match failed {
        0 => Ok(()),
        n => Err(eyre!("{} of {} volumes could not be unlocked", n, names.len())),
    }
}
