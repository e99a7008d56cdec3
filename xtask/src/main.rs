use std::env;

const WORKSPACE_ROOT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/..");

fn main() {
    let mut args = env::args().skip(1);
    let subcommand = args.next();
    match subcommand.as_deref() {
        Some("targets") => xtask::install_targets(),
        Some("test") => {
            env::set_current_dir(WORKSPACE_ROOT).unwrap();
            for (hal, _) in xtask::HALS {
                xtask::test_hal(hal);
            }
        }
        Some("build") => {
            env::set_current_dir(WORKSPACE_ROOT).unwrap();
            for (hal, target) in xtask::HALS {
                for features in xtask::FEATURE_SETS {
                    xtask::build_hal(hal, target, features);
                }
            }
        }
        _ => {
            eprintln!("usage: cargo xtask <subcommand>");
            eprintln!();
            eprintln!("subcommands:");
            eprintln!("    targets - install the rustup targets of every HAL");
            eprintln!("    test    - run the host tests of every HAL");
            eprintln!("    build   - cross-build every HAL with each feature set");
        }
    }
}
