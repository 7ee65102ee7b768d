//! The keep-rule contract between analyzer and rewriter.

use crate::flow::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol structure a rule was derived from. Informational only; the
/// rewriter never branches on it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    TlsHeader,
    TlsChangeCipherSpec,
    TlsAlert,
    TlsHandshake,
    TlsHeartbeat,
    TlsApplicationData,
    TlsUnknown,
    HttpHeader,
}

/// How a rule interacts with overlapping rules of the other kind.
///
/// `HeaderOnly` ranges must never be merged into or swallowed by
/// `FullPreserve` ranges during preprocessing; both ultimately mean "copy
/// the original bytes".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreserveStrategy {
    FullPreserve,
    HeaderOnly,
}

/// A half-open byte range `[seq_start, seq_end)` of one flow direction that
/// must survive masking unchanged.
///
/// Sequence numbers are absolute 32-bit TCP sequence values as seen on the
/// wire. Wraparound is not modeled; flows transferring more than 4 GiB in
/// one direction are out of scope.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct KeepRule {
    /// Per-run numeric flow id, secondary lookup key.
    pub stream_id: u64,
    /// Canonical flow identity, primary lookup key.
    pub tuple_key: String,
    pub direction: Direction,
    pub seq_start: u32,
    pub seq_end: u32,
    pub rule_type: RuleType,
    pub preserve_strategy: PreserveStrategy,
}

impl KeepRule {
    pub fn len(&self) -> u32 {
        self.seq_end - self.seq_start
    }

    pub fn is_empty(&self) -> bool {
        self.seq_end <= self.seq_start
    }
}

/// Provenance and health of one analyzer run.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    /// Name of the producing analyzer, e.g. `tls` or `tls+http`.
    pub analyzer: String,
    pub pcap_path: String,
    /// Set when the analyzer could not run at all. The rewriter treats an
    /// empty rule set as "mask everything", so this flag is informational
    /// for reporting rather than a control signal.
    pub analysis_failed: bool,
    pub errors: Vec<String>,
    /// Number of protocol records the rules were derived from.
    pub record_count: usize,
    pub created: DateTime<Utc>,
}

impl AnalysisMetadata {
    pub fn new(analyzer: impl Into<String>, pcap_path: impl Into<String>) -> Self {
        AnalysisMetadata {
            analyzer: analyzer.into(),
            pcap_path: pcap_path.into(),
            analysis_failed: false,
            errors: Vec::new(),
            record_count: 0,
            created: Utc::now(),
        }
    }
}

/// Everything one analyzer run produced. Immutable once handed to the
/// rewriter.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct KeepRuleSet {
    pub rules: Vec<KeepRule>,
    pub metadata: AnalysisMetadata,
}

impl KeepRuleSet {
    pub fn new(analyzer: impl Into<String>, pcap_path: impl Into<String>) -> Self {
        KeepRuleSet {
            rules: Vec::new(),
            metadata: AnalysisMetadata::new(analyzer, pcap_path),
        }
    }

    /// An empty set carrying the fail-closed marker.
    pub fn failed(
        analyzer: impl Into<String>,
        pcap_path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut set = Self::new(analyzer, pcap_path);
        set.metadata.analysis_failed = true;
        set.metadata.errors.push(error.into());
        set
    }

    pub fn push(&mut self, rule: KeepRule) {
        debug_assert!(!rule.is_empty(), "degenerate keep range {:?}", rule);
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Concatenate two analyzer outputs (the `auto` selector).
    pub fn merge(mut self, other: KeepRuleSet) -> KeepRuleSet {
        self.rules.extend(other.rules);
        self.metadata.analyzer = format!(
            "{}+{}",
            self.metadata.analyzer, other.metadata.analyzer
        );
        self.metadata.analysis_failed |= other.metadata.analysis_failed;
        self.metadata.errors.extend(other.metadata.errors);
        self.metadata.record_count += other.metadata.record_count;
        self
    }

    /// JSON rendering for debugging and test fixtures.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
