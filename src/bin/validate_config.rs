//! Standalone binary to validate runtime configuration files.
//! Used by CI and before deployments to catch bad settings early.
//!
//! Usage: `validate_config <file>...` (defaults to `$BATCHLINE_CONFIG`).

use batchline::logging::init_logging;
use batchline::RuntimeConfig;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    init_logging("warn");

    let mut paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        match std::env::var_os("BATCHLINE_CONFIG") {
            Some(p) => paths.push(PathBuf::from(p)),
            None => {
                eprintln!("usage: validate_config <config.yaml|config.json>...");
                return ExitCode::from(2);
            }
        }
    }

    let mut errors = Vec::new();
    println!("=== Validating Runtime Configs ===");
    for path in &paths {
        print!("Validating {}... ", path.display());
        match RuntimeConfig::load(path).and_then(|cfg| cfg.validate().map(|()| cfg)) {
            Ok(cfg) => {
                println!("✅");
                match serde_yaml::to_string(&cfg) {
                    Ok(effective) => println!("--- effective configuration ---\n{}", effective),
                    Err(e) => errors.push(format!("  {}: cannot render: {}", path.display(), e)),
                }
            }
            Err(e) => {
                println!("❌");
                errors.push(format!("  {}: {}", path.display(), e));
            }
        }
    }

    if errors.is_empty() {
        println!("\n✅ All {} config file(s) valid", paths.len());
        ExitCode::SUCCESS
    } else {
        println!("\n❌ Validation errors:");
        for e in &errors {
            println!("{}", e);
        }
        ExitCode::FAILURE
    }
}
