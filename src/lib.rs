//! Capture-sanitizing pipeline: analyze protocol structure, then rewrite
//! payload bytes.
//!
//! Data flows strictly one way per input file: the selected marker(s)
//! produce a [`KeepRuleSet`], the masker consumes it together with the
//! original capture and writes the sanitized copy. The rule set is the only
//! thing the two halves share.

use anyhow::{Context as _, Error};
use keep_rules::KeepRuleSet;
use log::info;
use markers::{DissectorConfig, HttpConfig, Protocol, TlsConfig};
use masker::{MaskerConfig, MaskingStats, PayloadMasker};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Configuration for the whole pipeline, loadable from TOML. Every section
/// and field is optional and falls back to its default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which marker(s) to run.
    pub protocol: Protocol,
    pub tls: TlsConfig,
    pub http: HttpConfig,
    pub dissector: DissectorConfig,
    pub masker: MaskerConfig,
}

impl Config {
    pub fn try_load_config(path: &Path) -> Result<Config, Error> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Could not parse config file {}", path.display()))
    }
}

/// Everything one pipeline run produced.
#[derive(Clone, Debug)]
pub struct ProcessReport {
    pub rules: KeepRuleSet,
    pub stats: MaskingStats,
}

/// Run marker(s) and masker over one capture.
///
/// Analyzer failure is not fatal: it yields an empty rule set and the
/// masker blanks every TCP payload. Masker failures (unreadable input,
/// unwritable output, sustained memory pressure) propagate.
pub fn process_file(input: &Path, output: &Path, config: &Config) -> Result<ProcessReport, Error> {
    info!(
        "Processing {} -> {} (protocol: {})",
        input.display(),
        output.display(),
        config.protocol
    );
    let rules = markers::analyze(
        input,
        config.protocol,
        &config.tls,
        &config.http,
        &config.dissector,
    );
    let stats = PayloadMasker::new(config.masker.clone())
        .apply(input, output, &rules)
        .with_context(|| format!("Masking {} failed", input.display()))?;
    Ok(ProcessReport { rules, stats })
}
