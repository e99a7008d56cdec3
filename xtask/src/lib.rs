use std::process::Command;

pub static HALS: &[(&str, &str)] = &[("apollo3-hal", "thumbv7em-none-eabihf")];

/// Feature sets every HAL is build-tested with. The logging backends are
/// exclusive in practice, so they are tried one at a time.
pub static FEATURE_SETS: &[&[&str]] = &[
    &[],
    &["critical-section-single-core"],
    &["critical-section-single-core", "defmt"],
    &["critical-section-single-core", "log"],
];

pub fn install_targets() {
    let mut targets = HALS.iter().map(|(_, target)| *target).collect::<Vec<_>>();
    targets.sort();
    targets.dedup();

    let mut cmd = Command::new("rustup");
    cmd.args(["target", "add"]).args(&targets);
    run(cmd);
}

/// Runs `cmd`, panicking if it cannot be spawned or exits unsuccessfully.
pub fn run(mut cmd: Command) {
    let status = cmd
        .status()
        .map_err(|e| format!("couldn't execute {:?}: {}", cmd, e))
        .unwrap();
    assert!(
        status.success(),
        "command exited with error status: {:?}",
        cmd
    );
}

/// Cross-builds `hal` for `target` with `features`.
pub fn build_hal(hal: &str, target: &str, features: &[&str]) {
    println!("building `{}` for `{}` with {:?}", hal, target, features);
    let toml_path = format!("{}/Cargo.toml", hal);
    let mut cargo = Command::new("cargo");
    cargo.args(["build", "--manifest-path", &toml_path, "--target", target]);
    if !features.is_empty() {
        cargo.args(["--features", &features.join(",")]);
    }
    run(cargo);
}

/// Runs the host unit tests of `hal`, which drive the BLE engine against a
/// simulated interface.
pub fn test_hal(hal: &str) {
    println!("testing `{}` on the host", hal);
    let toml_path = format!("{}/Cargo.toml", hal);
    let mut cargo = Command::new("cargo");
    cargo.args(["test", "--manifest-path", &toml_path]);
    run(cargo);
}
