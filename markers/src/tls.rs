//! TLS marker: preserve record framing, drop application payload.
//!
//! All the hard work of TCP reassembly and record framing is delegated to
//! the external dissector; this module only turns record descriptors into
//! keep rules on the absolute sequence axis. Because the rules are sequence
//! ranges, a record spanning several TCP segments needs no special handling
//! here, and neither do retransmissions.

use crate::dissector::RecordSource;
use keep_rules::{FlowKey, KeepRule, KeepRuleSet, PreserveStrategy, RuleType};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

/// TLS record header length: content type, two version bytes, two length
/// bytes.
pub const RECORD_HEADER_LEN: u32 = 5;

/// Enum representing the different TLS record types.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum MessageType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(content_type: u8) -> Self {
        match content_type {
            20 => MessageType::ChangeCipherSpec,
            21 => MessageType::Alert,
            22 => MessageType::Handshake,
            23 => MessageType::ApplicationData,
            24 => MessageType::Heartbeat,
            other => MessageType::Unknown(other),
        }
    }
}

impl MessageType {
    fn label(self) -> Option<ContentLabel> {
        match self {
            MessageType::ChangeCipherSpec => Some(ContentLabel::ChangeCipherSpec),
            MessageType::Alert => Some(ContentLabel::Alert),
            MessageType::Handshake => Some(ContentLabel::Handshake),
            MessageType::ApplicationData => Some(ContentLabel::ApplicationData),
            MessageType::Heartbeat => Some(ContentLabel::Heartbeat),
            MessageType::Unknown(_) => None,
        }
    }

    fn rule_type(self) -> RuleType {
        match self {
            MessageType::ChangeCipherSpec => RuleType::TlsChangeCipherSpec,
            MessageType::Alert => RuleType::TlsAlert,
            MessageType::Handshake => RuleType::TlsHandshake,
            MessageType::ApplicationData => RuleType::TlsApplicationData,
            MessageType::Heartbeat => RuleType::TlsHeartbeat,
            MessageType::Unknown(_) => RuleType::TlsUnknown,
        }
    }
}

/// Named content types addressable from the configuration file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentLabel {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
}

/// What to preserve of a record with a given content type.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    /// Header and body survive.
    KeepAll,
    /// Only the 5-byte record header survives; the body is masked.
    HeaderOnly,
}

/// TLS marker configuration.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Per-content-type override of the preservation policy. Types absent
    /// from the map use the built-in defaults; unknown content types are
    /// always kept whole as a safety default.
    pub preserve_by_content_type: HashMap<ContentLabel, RecordPolicy>,
}

impl TlsConfig {
    pub fn policy_for(&self, message_type: MessageType) -> RecordPolicy {
        match message_type.label() {
            Some(label) => self
                .preserve_by_content_type
                .get(&label)
                .copied()
                .unwrap_or_else(|| default_policy(label)),
            None => RecordPolicy::KeepAll,
        }
    }
}

fn default_policy(label: ContentLabel) -> RecordPolicy {
    match label {
        ContentLabel::ApplicationData => RecordPolicy::HeaderOnly,
        ContentLabel::ChangeCipherSpec
        | ContentLabel::Alert
        | ContentLabel::Handshake
        | ContentLabel::Heartbeat => RecordPolicy::KeepAll,
    }
}

/// Turns the dissector's record descriptors into keep rules.
pub struct TlsMarker {
    source: Box<dyn RecordSource>,
    config: TlsConfig,
}

impl TlsMarker {
    pub fn new(source: Box<dyn RecordSource>, config: TlsConfig) -> Self {
        TlsMarker { source, config }
    }

    /// Analyze a capture. Never fails: a broken dissector yields an empty,
    /// `analysis_failed` rule set, and the rewriter masks everything.
    pub fn analyze(&self, pcap: &Path) -> KeepRuleSet {
        let pcap_name = pcap.to_string_lossy().into_owned();
        let segments = match self.source.segments(pcap) {
            Ok(segments) => segments,
            Err(err) => {
                warn!("TLS analysis failed, falling back to full masking: {:#}", err);
                return KeepRuleSet::failed("tls", pcap_name, format!("{:#}", err));
            }
        };

        let mut rules = KeepRuleSet::new("tls", pcap_name);
        for seg in &segments {
            let flow = FlowKey::from_endpoints(seg.src, seg.dst);
            let direction = flow.direction_of(seg.src);
            let tuple_key = flow.tuple_key();

            for record in &seg.records {
                rules.metadata.record_count += 1;
                let r0 = record.seq_offset;
                let body_start = match r0.checked_add(RECORD_HEADER_LEN) {
                    Some(v) => v,
                    None => {
                        warn!("Record at seq {} overflows the sequence axis, skipped", r0);
                        continue;
                    }
                };
                rules.push(KeepRule {
                    stream_id: seg.stream,
                    tuple_key: tuple_key.clone(),
                    direction,
                    seq_start: r0,
                    seq_end: body_start,
                    rule_type: RuleType::TlsHeader,
                    preserve_strategy: PreserveStrategy::HeaderOnly,
                });

                let keep_body = self.config.policy_for(record.content_type) == RecordPolicy::KeepAll;
                if keep_body && record.length > 0 {
                    let body_end = match body_start.checked_add(record.length) {
                        Some(v) => v,
                        None => {
                            warn!("Record body at seq {} overflows the sequence axis, skipped", body_start);
                            continue;
                        }
                    };
                    rules.push(KeepRule {
                        stream_id: seg.stream,
                        tuple_key: tuple_key.clone(),
                        direction,
                        seq_start: body_start,
                        seq_end: body_end,
                        rule_type: record.content_type.rule_type(),
                        preserve_strategy: PreserveStrategy::FullPreserve,
                    });
                }
            }
        }
        debug!(
            "TLS marker: {} rules from {} records in {} segments",
            rules.len(),
            rules.metadata.record_count,
            segments.len()
        );
        rules
    }
}
