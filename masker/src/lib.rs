//! Capture rewriter: applies a [`KeepRuleSet`] to a pcap/pcapng file.
//!
//! Streams packets in wire order, replaces every TCP payload byte outside
//! the keep ranges with the mask byte, recomputes the affected checksums,
//! and leaves everything else byte-identical. Payload lengths never change;
//! the output stays a valid TCP trace with the original sequence geometry.

pub mod checksum;
pub mod decap;
pub mod error;
pub mod index;
pub mod pcap;
pub mod resource;
pub mod stats;

use crate::{
    decap::{IpVersion, LinkKind, TcpView},
    error::{ErrorCategory, RecoveryHandler},
    index::{DirectionalRules, RuleIndex},
    pcap::PcapSink,
    resource::MemoryMonitor,
};
use anyhow::{bail, Context as _, Error};
use keep_rules::{intervals, FlowKey, KeepRuleSet, StreamIdAllocator};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

pub use crate::{error::ErrorInfo, stats::MaskingStats};

/// Consecutive over-ceiling memory readings tolerated before aborting.
const MEMORY_STRIKES: u32 = 3;

/// Output file size tolerance relative to the input (same-format runs).
const SIZE_TOLERANCE: f64 = 0.1;

/// Rewriter configuration.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskerConfig {
    /// Byte written over masked payload positions.
    pub mask_byte: u8,
    /// Recompute IP/TCP checksums of modified packets; when false the
    /// fields are zeroed instead (never left stale).
    pub verify_checksums: bool,
    /// Packets between buffered-sink flushes.
    pub chunk_size: usize,
    pub memory_limit_bytes: u64,
    /// Fraction of the limit at which flushes are forced.
    pub memory_pressure_threshold: f64,
    /// Tunnel nesting depth the decapsulator follows.
    pub max_decap_depth: usize,
    pub max_retry_attempts: usize,
    pub retry_delay_ms: u64,
}

impl Default for MaskerConfig {
    fn default() -> Self {
        MaskerConfig {
            mask_byte: 0x00,
            verify_checksums: true,
            chunk_size: 1000,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            memory_pressure_threshold: 0.8,
            max_decap_depth: decap::DEFAULT_MAX_DEPTH,
            max_retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Applies keep rules to a capture.
pub struct PayloadMasker {
    config: MaskerConfig,
}

impl PayloadMasker {
    pub fn new(config: MaskerConfig) -> Self {
        PayloadMasker { config }
    }

    /// Rewrite `input` into `output` under `keep_rules`.
    ///
    /// Input and output problems are fatal; per-packet problems pass the
    /// original packet through and are reported in the returned stats.
    pub fn apply(
        &self,
        input: &Path,
        output: &Path,
        keep_rules: &KeepRuleSet,
    ) -> Result<MaskingStats, Error> {
        let started = Instant::now();
        let mut recovery = RecoveryHandler::new(
            self.config.max_retry_attempts,
            Duration::from_millis(self.config.retry_delay_ms),
        );
        let input_probe = input.to_path_buf();
        recovery.register(ErrorCategory::Input, move |_| input_probe.exists());

        let input_size = recovery.retry(ErrorCategory::Input, || {
            let meta = fs::metadata(input)
                .with_context(|| format!("Could not read input capture {}", input.display()))?;
            if meta.len() == 0 {
                bail!("input capture {} is empty", input.display());
            }
            pcap::detect_format(input)?;
            Ok(meta.len())
        })?;
        let input_format = pcap::detect_format(input)?;

        let index = RuleIndex::build(keep_rules);
        if keep_rules.metadata.analysis_failed {
            warn!("Analyzer reported failure; every TCP payload will be masked");
        }
        let monitor = MemoryMonitor::new(
            self.config.memory_limit_bytes,
            self.config.memory_pressure_threshold,
        );
        let mut streams = StreamIdAllocator::new();
        let mut stats = MaskingStats::default();
        let mut sink: Option<PcapSink> = None;
        let mut memory_strikes = 0u32;

        let no_rules = DirectionalRules::default();
        let input_count = pcap::stream_packets(input, |frame| {
            stats.packets_processed += 1;
            let rewritten = self.process_frame(
                &frame,
                &index,
                &no_rules,
                &mut streams,
                &mut stats,
                &mut recovery,
            );
            let data = rewritten.as_deref().unwrap_or(frame.data);

            if sink.is_none() {
                sink = Some(PcapSink::create(output, frame.linktype, 65535)?);
            }
            let sink = sink.as_mut().unwrap();
            sink.write_packet(frame.ts_sec, frame.ts_usec, frame.origlen, data)
                .with_context(|| format!("Could not write packet {}", stats.packets_processed))?;

            if stats.packets_processed % self.config.chunk_size.max(1) as u64 == 0 {
                sink.flush()?;
                if monitor.over_pressure() {
                    recovery.record(
                        ErrorCategory::Memory,
                        format!(
                            "memory pressure at packet {}, flushing buffers",
                            stats.packets_processed
                        ),
                    );
                    if monitor.over_limit() {
                        memory_strikes += 1;
                        if memory_strikes >= MEMORY_STRIKES {
                            bail!(
                                "resident memory stayed above the {} byte ceiling",
                                self.config.memory_limit_bytes
                            );
                        }
                    } else {
                        memory_strikes = 0;
                    }
                }
            }
            Ok(())
        })?;

        match sink {
            Some(sink) => sink.finish()?,
            None => {
                // Packet-less but well-formed capture: emit a valid empty
                // output with the same link type.
                let linktype = pcap::capture_linktype(input).unwrap_or(1);
                PcapSink::create(output, linktype, 65535)?.finish()?;
            }
        }

        stats.validation_passed =
            self.validate(input_size, input_format, input_count, output, &mut recovery);
        stats.errors = recovery.error_messages();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats.peak_memory_bytes = MemoryMonitor::peak_bytes().unwrap_or(0);
        info!(
            "Masked {} of {} packets: {} bytes masked, {} preserved, {} pass-through errors",
            stats.packets_modified,
            stats.packets_processed,
            stats.masked_bytes,
            stats.preserved_bytes,
            stats.pass_through_errors
        );
        Ok(stats)
    }

    /// Rewrite one frame, or `None` to pass it through untouched.
    fn process_frame(
        &self,
        frame: &pcap::Frame,
        index: &RuleIndex,
        no_rules: &DirectionalRules,
        streams: &mut StreamIdAllocator,
        stats: &mut MaskingStats,
        recovery: &mut RecoveryHandler,
    ) -> Option<Vec<u8>> {
        let link = match LinkKind::from_linktype(frame.linktype) {
            Some(link) => link,
            None => {
                stats.pass_through_errors += 1;
                recovery.record(
                    ErrorCategory::PacketProcessing,
                    format!(
                        "packet {}: unrecognized link type {}",
                        stats.packets_processed, frame.linktype
                    ),
                );
                return None;
            }
        };
        let view = match decap::innermost_tcp(frame.data, link, self.config.max_decap_depth) {
            Ok(Some(view)) => view,
            Ok(None) => return None,
            Err(err) => {
                stats.pass_through_errors += 1;
                recovery.record(
                    ErrorCategory::PacketProcessing,
                    format!("packet {}: {:#}", stats.packets_processed, err),
                );
                return None;
            }
        };
        if view.payload_len == 0 {
            return None;
        }

        let flow = FlowKey::from_endpoints(view.src, view.dst);
        let direction = flow.direction_of(view.src);
        let stream_id = streams.id_for(&flow);
        let tuple_key = flow.tuple_key();
        let rules = index
            .lookup(&tuple_key, stream_id, direction)
            .unwrap_or(no_rules);

        let payload = &frame.data[view.payload_offset..view.payload_offset + view.payload_len];
        let (masked, preserved) = mask_payload(payload, view.seq, rules, self.config.mask_byte);
        stats.preserved_bytes += preserved;
        stats.masked_bytes += payload.len() as u64 - preserved;
        if masked == payload {
            // Fully preserved segment: the original packet, checksums
            // included, is already correct.
            return None;
        }

        let mut data = frame.data.to_vec();
        data[view.payload_offset..view.payload_offset + view.payload_len].copy_from_slice(&masked);
        self.patch_checksums(&mut data, &view);
        stats.packets_modified += 1;
        Some(data)
    }

    /// Clear (and by default recompute) every checksum the rewrite
    /// invalidated.
    fn patch_checksums(&self, data: &mut [u8], view: &TcpView) {
        for &offset in &view.tunnel_udp_checksums {
            if offset + 2 <= data.len() {
                data[offset] = 0;
                data[offset + 1] = 0;
            }
        }
        data[view.tcp_offset + 16] = 0;
        data[view.tcp_offset + 17] = 0;
        let segment_end = view.payload_offset + view.payload_len;
        match view.ip_version {
            IpVersion::V4 => {
                let ihl = usize::from(data[view.ip_offset] & 0x0f) * 4;
                data[view.ip_offset + 10] = 0;
                data[view.ip_offset + 11] = 0;
                if self.config.verify_checksums {
                    let ip_checksum =
                        checksum::ipv4_header(&data[view.ip_offset..view.ip_offset + ihl]);
                    data[view.ip_offset + 10..view.ip_offset + 12]
                        .copy_from_slice(&ip_checksum.to_be_bytes());

                    let mut src = [0u8; 4];
                    let mut dst = [0u8; 4];
                    src.copy_from_slice(&data[view.ip_offset + 12..view.ip_offset + 16]);
                    dst.copy_from_slice(&data[view.ip_offset + 16..view.ip_offset + 20]);
                    let tcp_checksum =
                        checksum::tcp_v4(src, dst, &data[view.tcp_offset..segment_end]);
                    data[view.tcp_offset + 16..view.tcp_offset + 18]
                        .copy_from_slice(&tcp_checksum.to_be_bytes());
                }
            }
            IpVersion::V6 => {
                if self.config.verify_checksums {
                    let mut src = [0u8; 16];
                    let mut dst = [0u8; 16];
                    src.copy_from_slice(&data[view.ip_offset + 8..view.ip_offset + 24]);
                    dst.copy_from_slice(&data[view.ip_offset + 24..view.ip_offset + 40]);
                    let tcp_checksum =
                        checksum::tcp_v6(src, dst, &data[view.tcp_offset..segment_end]);
                    data[view.tcp_offset + 16..view.tcp_offset + 18]
                        .copy_from_slice(&tcp_checksum.to_be_bytes());
                }
            }
        }
    }

    /// Post-run output check: packet counts must match, and for
    /// pcap-to-pcap runs the sizes must agree within tolerance.
    fn validate(
        &self,
        input_size: u64,
        input_format: pcap::CaptureFormat,
        input_count: u64,
        output: &Path,
        recovery: &mut RecoveryHandler,
    ) -> bool {
        let output_count = match pcap::stream_packets(output, |_| Ok(())) {
            Ok(count) => count,
            Err(err) => {
                recovery.record(
                    ErrorCategory::Validation,
                    format!("output unreadable: {:#}", err),
                );
                return false;
            }
        };
        if output_count != input_count {
            recovery.record(
                ErrorCategory::Validation,
                format!(
                    "packet count mismatch: {} in, {} out",
                    input_count, output_count
                ),
            );
            return false;
        }
        if input_format == pcap::CaptureFormat::Pcap {
            let output_size = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
            let tolerance = (input_size as f64 * SIZE_TOLERANCE) as u64 + 1024;
            let diff = if output_size > input_size {
                output_size - input_size
            } else {
                input_size - output_size
            };
            if diff > tolerance {
                recovery.record(
                    ErrorCategory::Validation,
                    format!(
                        "output size {} deviates from input size {} beyond tolerance",
                        output_size, input_size
                    ),
                );
                return false;
            }
        }
        debug!("Validation passed: {} packets", output_count);
        true
    }
}

/// Build the output payload for one segment.
///
/// Every byte defaults to the mask byte. Header-only intersections are
/// copied first and locked; full-preserve intersections then fill the
/// positions still unlocked. A byte therefore survives exactly when it lies
/// in the union of all keep ranges. Returns the new payload and the count
/// of preserved bytes.
pub fn mask_payload(
    payload: &[u8],
    seq: u32,
    rules: &DirectionalRules,
    mask_byte: u8,
) -> (Vec<u8>, u64) {
    let seg_start = seq;
    let seg_end = seq
        .checked_add(payload.len() as u32)
        .unwrap_or(u32::max_value());
    let span = (seg_end - seg_start) as usize;

    let mut out = vec![mask_byte; payload.len()];
    let mut locked = vec![false; span];

    for &range in intervals::overlapping(&rules.header_only, seg_start, seg_end) {
        if let Some((start, end)) = intervals::clamp(range, seg_start, seg_end) {
            let a = (start - seg_start) as usize;
            let b = (end - seg_start) as usize;
            out[a..b].copy_from_slice(&payload[a..b]);
            for flag in &mut locked[a..b] {
                *flag = true;
            }
        }
    }
    for &range in intervals::overlapping(&rules.full_preserve, seg_start, seg_end) {
        if let Some((start, end)) = intervals::clamp(range, seg_start, seg_end) {
            let a = (start - seg_start) as usize;
            let b = (end - seg_start) as usize;
            for i in a..b {
                if !locked[i] {
                    out[i] = payload[i];
                    locked[i] = true;
                }
            }
        }
    }

    let preserved = locked.iter().filter(|&&l| l).count() as u64;
    (out, preserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rules(header_only: Vec<(u32, u32)>, full_preserve: Vec<(u32, u32)>) -> DirectionalRules {
        DirectionalRules {
            header_only: intervals::merge_intervals(header_only),
            full_preserve: intervals::merge_intervals(full_preserve),
        }
    }

    #[test]
    fn unruled_payload_is_fully_masked() {
        let (out, preserved) = mask_payload(b"secret", 1000, &DirectionalRules::default(), 0x00);
        assert_eq!(out, vec![0u8; 6]);
        assert_eq!(preserved, 0);
    }

    #[test]
    fn tls_app_data_record_keeps_its_header() {
        // 17 03 03 00 05 "Hi!!!" with a header-only rule over the first 5.
        let payload = b"\x17\x03\x03\x00\x05Hi!!!";
        let (out, preserved) =
            mask_payload(payload, 1000, &rules(vec![(1000, 1005)], vec![]), 0x00);
        assert_eq!(out, b"\x17\x03\x03\x00\x05\x00\x00\x00\x00\x00");
        assert_eq!(preserved, 5);
    }

    #[test]
    fn cross_segment_header_suffix_is_preserved() {
        // Second segment of a record split 3+8: bytes 4-5 of the header
        // land at the segment start.
        let payload = b"\x00\x08Hello!";
        let (out, _) = mask_payload(payload, 1003, &rules(vec![(1000, 1005)], vec![]), 0x00);
        assert_eq!(out, b"\x00\x08\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn overlapping_strategies_preserve_the_union() {
        let payload = b"ABCDEFGHIJ";
        let (out, preserved) = mask_payload(
            payload,
            0,
            &rules(vec![(2, 5)], vec![(4, 8)]),
            b'.',
        );
        assert_eq!(out, b"..CDEFGH..");
        assert_eq!(preserved, 6);
    }

    #[test]
    fn mask_byte_is_configurable() {
        let (out, _) = mask_payload(b"xyz", 0, &DirectionalRules::default(), 0xff);
        assert_eq!(out, vec![0xff, 0xff, 0xff]);
    }

    #[test]
    fn masking_is_idempotent() {
        let payload = b"\x16\x03\x03\x00\x02AB\x17\x03\x03\x00\x03123";
        let r = rules(vec![(0, 5), (7, 12)], vec![(5, 7)]);
        let (once, _) = mask_payload(payload, 0, &r, 0x00);
        let (twice, _) = mask_payload(&once, 0, &r, 0x00);
        assert_eq!(once, twice);
    }
}
