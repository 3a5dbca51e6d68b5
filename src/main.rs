/// To build a distributable binary with TPM and LUKS support:
/// ```
/// TPM_SECBOOT_BUILD_STATIC=1 cargo build --release --features tpm2,luks --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use std::env;
use tpm_secboot::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
