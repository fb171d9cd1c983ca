use std::process::Command;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    emit_build_info();

    let proto_root = "proto";
    let api_proto = format!("{proto_root}/deviceplugin/v1beta1/api.proto");

    // Tell Cargo to rerun if the proto file changes
    println!("cargo:rerun-if-changed={api_proto}");
    println!("cargo:rerun-if-env-changed=MICRO_REGENERATE_PROTO");

    // Normal builds use the checked-in bindings in src/proto and need no protoc.
    if std::env::var_os("MICRO_REGENERATE_PROTO").is_none() {
        return Ok(());
    }

    if !std::path::Path::new(&api_proto).exists() {
        println!("cargo:warning=Proto source not found, using pre-generated file");
        return Ok(());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/proto")
        .compile(&[&api_proto], &[proto_root])?;

    Ok(())
}

/// Exposes build metadata to `src/version.rs` as compile-time env vars.
fn emit_build_info() {
    for key in [
        "MICRO_BUILD_REVISION",
        "MICRO_BUILD_BRANCH",
        "MICRO_BUILD_USER",
        "MICRO_BUILD_DATE",
    ] {
        println!("cargo:rerun-if-env-changed={key}");
    }

    let revision = std::env::var("MICRO_BUILD_REVISION")
        .ok()
        .or_else(|| git(&["rev-parse", "--short", "HEAD"]))
        .unwrap_or_else(|| "unknown".to_string());
    let branch = std::env::var("MICRO_BUILD_BRANCH")
        .ok()
        .or_else(|| git(&["rev-parse", "--abbrev-ref", "HEAD"]))
        .unwrap_or_else(|| "unknown".to_string());
    let user = std::env::var("MICRO_BUILD_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string());
    let date = std::env::var("MICRO_BUILD_DATE").unwrap_or_else(|_| "unknown".to_string());
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=MICRO_BUILD_REVISION={revision}");
    println!("cargo:rustc-env=MICRO_BUILD_BRANCH={branch}");
    println!("cargo:rustc-env=MICRO_BUILD_USER={user}");
    println!("cargo:rustc-env=MICRO_BUILD_DATE={date}");
    println!("cargo:rustc-env=MICRO_BUILD_TARGET={target}");
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8(output.stdout).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
