use std::env;

fn enabled(feature: &str) -> bool {
    env::var_os(format!("CARGO_FEATURE_{}", feature)).is_some()
}

fn main() {
    println!("cargo:rerun-if-env-changed=TPM_SECBOOT_BUILD_STATIC");
    let Ok(build_static) = env::var("TPM_SECBOOT_BUILD_STATIC") else {
        return;
    };
    if !matches!(build_static.to_lowercase().as_ref(), "1" | "y" | "yes" | "true") {
        return;
    }
    println!("cargo:rustc-link-arg=-l:libc.a");
    if enabled("TPM2") {
        println!("cargo:rustc-link-arg=-l:libtss2-tcti-device.a");
        for lib in ["tss2-esys", "tss2-mu", "tss2-sys", "crypto", "ssl"] {
            println!("cargo:rustc-link-lib=static={}", lib);
        }
    }
    if enabled("LUKS") {
        for lib in ["cryptsetup", "devmapper", "json-c", "uuid", "crypto", "ssl"] {
            println!("cargo:rustc-link-lib=static={}", lib);
        }
    }
    println!("cargo:rustc-link-search=/usr/lib");
    println!("cargo:rustc-link-search=/usr/local/ssl/lib");
}
