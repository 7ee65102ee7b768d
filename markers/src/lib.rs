//! Protocol-aware analyzers producing [`KeepRuleSet`]s.
//!
//! A marker reads a capture and decides which payload byte ranges must
//! survive masking. Each marker is fail-closed: whenever it cannot analyze,
//! it emits no rules, and the rewriter masks everything it has no rule for.

pub mod dissector;
pub mod http;
pub mod tls;

use keep_rules::KeepRuleSet;
use log::info;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

pub use crate::{
    dissector::{DissectorConfig, RecordDescriptor, RecordSource, SegmentRecords, TsharkSource},
    http::{HttpConfig, HttpMarker},
    tls::{MessageType, RecordPolicy, TlsConfig, TlsMarker},
};

/// Which marker(s) to run on an input file.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tls,
    Http,
    Auto,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Auto
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tls" => Ok(Protocol::Tls),
            "http" => Ok(Protocol::Http),
            "auto" => Ok(Protocol::Auto),
            other => Err(format!("unknown protocol selector `{}`", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tls => f.write_str("tls"),
            Protocol::Http => f.write_str("http"),
            Protocol::Auto => f.write_str("auto"),
        }
    }
}

/// Run the selected marker(s) on `pcap`.
///
/// `auto` runs TLS first, then HTTP, and concatenates the rule sets;
/// overlap between their outputs is resolved byte-wise by the rewriter.
/// This function never fails: analyzer breakage is recorded in the returned
/// metadata and results in fewer (or no) keep rules.
pub fn analyze(
    pcap: &Path,
    protocol: Protocol,
    tls_config: &TlsConfig,
    http_config: &HttpConfig,
    dissector_config: &DissectorConfig,
) -> KeepRuleSet {
    let rules = match protocol {
        Protocol::Tls => analyze_tls(pcap, tls_config, dissector_config),
        Protocol::Http => HttpMarker::new(http_config.clone()).analyze(pcap),
        Protocol::Auto => analyze_tls(pcap, tls_config, dissector_config)
            .merge(HttpMarker::new(http_config.clone()).analyze(pcap)),
    };
    info!(
        "Analyzer `{}` produced {} keep rules from {} records{}",
        rules.metadata.analyzer,
        rules.len(),
        rules.metadata.record_count,
        if rules.metadata.analysis_failed {
            " (analysis failed, masking everything)"
        } else {
            ""
        }
    );
    rules
}

fn analyze_tls(pcap: &Path, config: &TlsConfig, dissector: &DissectorConfig) -> KeepRuleSet {
    let source = TsharkSource::new(dissector.clone());
    TlsMarker::new(Box::new(source), config.clone()).analyze(pcap)
}
