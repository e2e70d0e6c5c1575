use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use warp_noize::config::{NoizeConfig, PRESETS};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Noize obfuscation config tool", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validates a noize config file
    Validate {
        /// Path to the noize config JSON file
        #[clap(long, value_name = "PATH")]
        config: PathBuf,
    },
    /// Merges an override config onto a base config, printing the result
    Merge {
        /// Path to the base noize config JSON file
        #[clap(long, value_name = "PATH")]
        base: PathBuf,
        /// Path to the override noize config JSON file
        #[clap(long, value_name = "PATH")]
        over: PathBuf,
        /// Where to write the merged config; prints to stdout if omitted
        #[clap(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Writes a preset's default config to a file
    ExportPreset {
        /// Preset name (minimal, light, medium, heavy, stealth, gfw, firewall)
        #[clap(long)]
        preset: String,
        /// Output path
        #[clap(long, value_name = "PATH")]
        out: PathBuf,
    },
    /// Prints a preset's default config to stdout
    ShowPreset {
        /// Preset name
        #[clap(long)]
        preset: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let result = match &cli.command {
        Commands::Validate { config } => validate(config),
        Commands::Merge { base, over, out } => merge(base, over, out.as_deref()),
        Commands::ExportPreset { preset, out } => export_preset(preset, out),
        Commands::ShowPreset { preset } => show_preset(preset),
    };

    if let Err(msg) = result {
        error!("{msg}");
        std::process::exit(1);
    }
}

fn validate(path: &PathBuf) -> Result<(), String> {
    let cfg = NoizeConfig::load_file(path).map_err(|e| e.to_string())?;
    cfg.validate().map_err(|e| e.to_string())?;
    info!("{} is valid", path.display());
    Ok(())
}

fn merge(base_path: &PathBuf, over_path: &PathBuf, out: Option<&std::path::Path>) -> Result<(), String> {
    let base = NoizeConfig::load_file(base_path).map_err(|e| e.to_string())?;
    let over = NoizeConfig::load_file(over_path).map_err(|e| e.to_string())?;
    let merged = NoizeConfig::merge(&base, &over);
    if let Err(e) = merged.validate() {
        warn!("merged config failed validation: {e}");
    }
    let json = merged.to_json().map_err(|e| e.to_string())?;
    match out {
        Some(path) => std::fs::write(path, json).map_err(|e| e.to_string()),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn export_preset(name: &str, out: &PathBuf) -> Result<(), String> {
    if !PRESETS.contains(&name) {
        return Err(format!("unknown preset '{name}', expected one of {PRESETS:?}"));
    }
    NoizeConfig::export_preset(name, out).map_err(|e| e.to_string())?;
    info!("wrote preset '{name}' to {}", out.display());
    Ok(())
}

fn show_preset(name: &str) -> Result<(), String> {
    if !PRESETS.contains(&name) {
        return Err(format!("unknown preset '{name}', expected one of {PRESETS:?}"));
    }
    let cfg = NoizeConfig::load_preset(name).map_err(|e| e.to_string())?;
    let json = cfg.to_json().map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
