use anyhow::{bail, Error};
use log::{info, warn};
use markers::Protocol;
use payload_mask::{process_file, Config};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(global_settings(&[
    structopt::clap::AppSettings::ColoredHelp,
    structopt::clap::AppSettings::VersionlessSubcommands,
    // Print help, if no arguments are given
    structopt::clap::AppSettings::ArgRequiredElseHelp
]))]
struct CliArgs {
    /// Config file for all advanced settings
    #[structopt(short = "c", long = "config")]
    config: Option<PathBuf>,
    /// Which analyzer to run: tls, http, or auto
    #[structopt(short = "p", long = "protocol")]
    protocol: Option<Protocol>,
    /// Byte value written over masked payload bytes
    #[structopt(long = "mask-byte")]
    mask_byte: Option<u8>,
    /// Directory for the rewritten captures
    ///
    /// By default each output is placed next to its input.
    #[structopt(short = "o", long = "output-dir")]
    output_dir: Option<PathBuf>,
    /// Suffix inserted into each output file name
    #[structopt(long = "suffix", default_value = "masked")]
    suffix: String,
    /// Write the keep rules as JSON next to each output
    #[structopt(long = "dump-rules")]
    dump_rules: bool,
    /// Print per-file statistics as JSON instead of a summary line
    #[structopt(long = "json-stats")]
    json_stats: bool,
    /// List of PCAP files
    #[structopt(name = "PCAPS", required = true)]
    pcap_files: Vec<PathBuf>,
}

fn main() {
    // generic setup
    env_logger::init();
    let cli_args = CliArgs::from_args();

    if let Err(err) = run(cli_args) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(cli_args: CliArgs) -> Result<(), Error> {
    let mut config = match &cli_args.config {
        Some(path) => Config::try_load_config(path)?,
        None => Config::default(),
    };
    if let Some(protocol) = cli_args.protocol {
        config.protocol = protocol;
    }
    if let Some(mask_byte) = cli_args.mask_byte {
        config.masker.mask_byte = mask_byte;
    }
    if let Some(dir) = &cli_args.output_dir {
        if !dir.is_dir() {
            bail!("output directory {} does not exist", dir.display());
        }
    }

    let mut failures = 0usize;
    for input in &cli_args.pcap_files {
        let output = output_path(input, cli_args.output_dir.as_deref(), &cli_args.suffix);
        match process_file(input, &output, &config) {
            Ok(report) => {
                if cli_args.dump_rules {
                    let mut rules_path = output.clone();
                    rules_path.set_extension("rules.json");
                    fs::write(&rules_path, report.rules.to_json()?)?;
                    info!("Keep rules written to {}", rules_path.display());
                }
                if cli_args.json_stats {
                    println!("{}", serde_json::to_string_pretty(&report.stats)?);
                } else {
                    println!(
                        "{}: {} packets, {} modified, {} bytes masked, {} preserved{}",
                        input.display(),
                        report.stats.packets_processed,
                        report.stats.packets_modified,
                        report.stats.masked_bytes,
                        report.stats.preserved_bytes,
                        if report.stats.validation_passed {
                            ""
                        } else {
                            " (validation FAILED)"
                        }
                    );
                }
            }
            Err(err) => {
                failures += 1;
                warn!("Skipping {}: {:#}", input.display(), err);
                eprintln!("{}: failed: {:#}", input.display(), err);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} files failed", failures, cli_args.pcap_files.len());
    }
    Ok(())
}

/// `capture.pcap` becomes `capture-masked.pcap`, either next to the input
/// or inside the requested output directory.
fn output_path(input: &Path, output_dir: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .unwrap_or_else(|| OsStr::new("capture"))
        .to_string_lossy();
    let extension = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pcap".to_string());
    let name = format!("{}-{}.{}", stem, suffix, extension);
    match output_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}
