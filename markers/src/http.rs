//! HTTP marker: keep request/status lines and header blocks, mask bodies.
//!
//! Best-effort by design. The capture may start mid-message, segmentation
//! may split a header block anywhere, and recaptured traffic drifts; the
//! marker tolerates all of that by scanning for start lines anywhere in a
//! segment and resetting its per-flow state on sequence gaps. A flow it
//! cannot make sense of simply gets no rules and is masked in full.

use keep_rules::{
    intervals, Direction, Endpoint, FlowKey, KeepRule, KeepRuleSet, PreserveStrategy, RuleType,
    StreamIdAllocator,
};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use pcap_parser::{data::PacketData, PcapCapture};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs,
    net::IpAddr,
    path::Path,
};

/// Methods recognized as the start of a request line, trailing space
/// included.
const HTTP_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"TRACE ",
    b"CONNECT ",
];

/// Status lines and absolute-form request targets both carry this.
const HTTP_VERSION: &[u8] = b"HTTP/1.";

static DEFAULT_SENSITIVE_HEADERS: Lazy<HashSet<String>> = Lazy::new(|| {
    ["cookie", "authorization", "referer"]
        .iter()
        .map(|s| s.to_string())
        .collect()
});

fn default_ports() -> HashSet<u16> {
    [80, 8080, 8000, 8888].iter().copied().collect()
}

/// HTTP marker configuration.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Ports that make a flow an HTTP candidate regardless of content.
    pub ports: HashSet<u16>,
    /// Header names (case-insensitive) whose values are masked.
    pub sensitive_headers: HashSet<String>,
    /// Accumulation cap per message while searching for the header
    /// terminator.
    pub max_scan_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            ports: default_ports(),
            sensitive_headers: DEFAULT_SENSITIVE_HEADERS.clone(),
            max_scan_bytes: 16 * 1024,
        }
    }
}

impl HttpConfig {
    fn is_sensitive(&self, name: &[u8]) -> bool {
        let name = String::from_utf8_lossy(name).trim().to_ascii_lowercase();
        self.sensitive_headers.contains(&name)
    }
}

#[derive(Eq, PartialEq, Debug)]
enum ScanState {
    Idle,
    Collecting,
}

/// Per-(flow, direction) scan state.
struct FlowScan {
    state: ScanState,
    /// Unconsumed bytes from the current message, starting at the start
    /// line.
    buf: Vec<u8>,
    /// Absolute sequence number of `buf[0]`.
    buf_seq: u32,
    /// Expected sequence number of the next contiguous segment.
    next_seq: Option<u32>,
}

impl FlowScan {
    fn new() -> Self {
        FlowScan {
            state: ScanState::Idle,
            buf: Vec::new(),
            buf_seq: 0,
            next_seq: None,
        }
    }

    fn reset(&mut self) {
        self.state = ScanState::Idle;
        self.buf.clear();
    }
}

/// Streaming HTTP analyzer.
pub struct HttpMarker {
    config: HttpConfig,
}

impl HttpMarker {
    pub fn new(config: HttpConfig) -> Self {
        HttpMarker { config }
    }

    /// Analyze a capture. Unreadable inputs fail closed; per-packet
    /// problems are recorded and skipped without affecting other flows.
    pub fn analyze(&self, pcap: &Path) -> KeepRuleSet {
        let pcap_name = pcap.to_string_lossy().into_owned();
        let file_content = match fs::read(pcap) {
            Ok(content) => content,
            Err(err) => {
                warn!("HTTP analysis failed reading {}: {}", pcap.display(), err);
                return KeepRuleSet::failed("http", pcap_name, err.to_string());
            }
        };
        let capture = match PcapCapture::from_file(&file_content) {
            Ok(capture) => capture,
            Err(err) => {
                warn!("HTTP analysis failed parsing {}: {:?}", pcap.display(), err);
                return KeepRuleSet::failed("http", pcap_name, format!("{:?}", err));
            }
        };
        let datalink_type = capture.header.network;

        let mut rules = KeepRuleSet::new("http", pcap_name);
        let mut streams = StreamIdAllocator::new();
        let mut scans: HashMap<(String, Direction), FlowScan> = HashMap::new();

        for (id, pkt) in capture.blocks.iter().enumerate() {
            let packet_id = id as u32 + 1;
            if let Err(err) = self.process_packet(
                pkt.data,
                pkt.caplen,
                pkt.origlen,
                datalink_type,
                &mut rules,
                &mut streams,
                &mut scans,
            ) {
                trace!("({:>2}) skipped: {}", packet_id, err);
                rules
                    .metadata
                    .errors
                    .push(format!("packet {}: {}", packet_id, err));
            }
        }
        debug!(
            "HTTP marker: {} rules from {} header blocks over {} flows",
            rules.len(),
            rules.metadata.record_count,
            streams.len()
        );
        rules
    }

    #[allow(clippy::too_many_arguments)]
    fn process_packet(
        &self,
        data: &[u8],
        caplen: u32,
        origlen: u32,
        datalink_type: pcap_parser::Linktype,
        rules: &mut KeepRuleSet,
        streams: &mut StreamIdAllocator,
        scans: &mut HashMap<(String, Direction), FlowScan>,
    ) -> Result<(), String> {
        if caplen != origlen {
            return Err("truncated frame".to_string());
        }

        let parsed_packet = match pcap_parser::data::get_packetdata(data, datalink_type, caplen as usize)
        {
            None => return Err("unparseable packet data".to_string()),
            Some(PacketData::L2(l2)) => {
                SlicedPacket::from_ethernet(l2).map_err(|err| format!("{:?}", err))?
            }
            Some(PacketData::L3(_, l3)) => {
                SlicedPacket::from_ip(l3).map_err(|err| format!("{:?}", err))?
            }
            Some(_) => return Err("unsupported link type".to_string()),
        };

        let ipv4 = match &parsed_packet.ip {
            Some(InternetSlice::Ipv4(inner)) => inner,
            // The masker decapsulates both address families; header marking
            // over IPv6 falls back to full masking.
            _ => return Ok(()),
        };
        let tcp = match &parsed_packet.transport {
            Some(TransportSlice::Tcp(inner)) => inner,
            _ => return Ok(()),
        };

        // Slicing can hand back ethernet trailer padding as payload; cut to
        // the length the IP header declares.
        let header_bytes = (usize::from(ipv4.ihl()) + usize::from(tcp.data_offset())) * 4;
        let payload_len = (ipv4.total_len() as usize).saturating_sub(header_bytes);
        let payload = &parsed_packet.payload[..payload_len.min(parsed_packet.payload.len())];
        if payload.is_empty() {
            return Ok(());
        }

        let src = Endpoint::new(IpAddr::V4(ipv4.source_addr()), tcp.source_port());
        let dst = Endpoint::new(IpAddr::V4(ipv4.destination_addr()), tcp.destination_port());
        let flow = FlowKey::from_endpoints(src, dst);
        let direction = flow.direction_of(src);
        let seq = tcp.sequence_number();

        let key = (flow.tuple_key(), direction);
        let mid_message = scans
            .get(&key)
            .map(|scan| scan.state == ScanState::Collecting)
            .unwrap_or(false);
        if !mid_message && !self.is_likely_http(tcp.source_port(), tcp.destination_port(), payload) {
            return Ok(());
        }

        let stream_id = streams.id_for(&flow);
        let scan = scans.entry(key).or_insert_with(FlowScan::new);

        match scan.state {
            ScanState::Collecting if scan.next_seq == Some(seq) => {
                scan.buf.extend_from_slice(payload);
            }
            ScanState::Collecting => {
                trace!(
                    "Sequence gap in {} {} (expected {:?}, got {}), restarting scan",
                    flow,
                    direction,
                    scan.next_seq,
                    seq
                );
                scan.reset();
                self.start_scan(scan, payload, seq);
            }
            ScanState::Idle => {
                self.start_scan(scan, payload, seq);
            }
        }
        scan.next_seq = Some(seq.wrapping_add(payload.len() as u32));

        self.drain_messages(scan, stream_id, &flow, direction, rules);
        Ok(())
    }

    /// Look for a start line anywhere in the segment and begin collecting
    /// at it.
    fn start_scan(&self, scan: &mut FlowScan, payload: &[u8], seq: u32) {
        if let Some(at) = find_start_line(payload) {
            scan.state = ScanState::Collecting;
            scan.buf = payload[at..].to_vec();
            scan.buf_seq = seq.wrapping_add(at as u32);
        }
    }

    /// Emit rules for every complete header block in the buffer, honoring
    /// the accumulation cap.
    fn drain_messages(
        &self,
        scan: &mut FlowScan,
        stream_id: u64,
        flow: &FlowKey,
        direction: Direction,
        rules: &mut KeepRuleSet,
    ) {
        while scan.state == ScanState::Collecting {
            match find_subsequence(&scan.buf, b"\r\n\r\n") {
                Some(at) => {
                    let block_len = at + 4;
                    let ranges = header_keep_ranges(&scan.buf[..block_len], &self.config);
                    self.emit(ranges, scan.buf_seq, stream_id, flow, direction, rules);
                    rules.metadata.record_count += 1;

                    // The rest of the segment may already hold the next
                    // message.
                    match find_start_line(&scan.buf[block_len..]) {
                        Some(next) => {
                            let consumed = block_len + next;
                            scan.buf.drain(..consumed);
                            scan.buf_seq = scan.buf_seq.wrapping_add(consumed as u32);
                        }
                        None => scan.reset(),
                    }
                }
                None if scan.buf.len() > self.config.max_scan_bytes => {
                    // No terminator within the cap: salvage the start line.
                    if let Some(eol) = find_subsequence(&scan.buf, b"\r\n") {
                        let ranges = vec![(0, eol + 2)];
                        self.emit(ranges, scan.buf_seq, stream_id, flow, direction, rules);
                        rules.metadata.record_count += 1;
                    }
                    scan.reset();
                }
                None => break,
            }
        }
    }

    fn emit(
        &self,
        ranges: Vec<(usize, usize)>,
        buf_seq: u32,
        stream_id: u64,
        flow: &FlowKey,
        direction: Direction,
        rules: &mut KeepRuleSet,
    ) {
        let absolute: Vec<(u32, u32)> = ranges
            .into_iter()
            .filter_map(|(start, end)| {
                let abs_start = buf_seq.checked_add(start as u32)?;
                let abs_end = buf_seq.checked_add(end as u32)?;
                Some((abs_start, abs_end))
            })
            .collect();
        for (seq_start, seq_end) in intervals::merge_intervals(absolute) {
            rules.push(KeepRule {
                stream_id,
                tuple_key: flow.tuple_key(),
                direction,
                seq_start,
                seq_end,
                rule_type: RuleType::HttpHeader,
                preserve_strategy: PreserveStrategy::FullPreserve,
            });
        }
    }

    fn is_likely_http(&self, src_port: u16, dst_port: u16, payload: &[u8]) -> bool {
        if self.config.ports.contains(&src_port) || self.config.ports.contains(&dst_port) {
            return true;
        }
        find_start_line(payload).is_some()
    }
}

/// Earliest offset where a request or status line begins.
fn find_start_line(payload: &[u8]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for pattern in HTTP_METHODS.iter().chain(std::iter::once(&HTTP_VERSION)) {
        if let Some(at) = find_subsequence(payload, pattern) {
            best = Some(best.map_or(at, |b: usize| b.min(at)));
        }
    }
    best
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Byte ranges of a complete header block (start line through the blank
/// line) that must be preserved.
///
/// Values of sensitive headers are excluded: for those, the keep range runs
/// from the line start through the first non-whitespace after the colon,
/// plus the line's CRLF. Continuation lines inherit the sensitivity of the
/// header they continue.
fn header_keep_ranges(block: &[u8], config: &HttpConfig) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut line_start = 0;
    let mut first_line = true;
    let mut prev_sensitive = false;

    while line_start < block.len() {
        let line_end = find_subsequence(&block[line_start..], b"\r\n")
            .map(|at| line_start + at + 2)
            .unwrap_or_else(|| block.len());
        let line = &block[line_start..line_end];

        if first_line {
            first_line = false;
            ranges.push((line_start, line_end));
        } else if line == b"\r\n" {
            // Terminator of the header block.
            ranges.push((line_start, line_end));
        } else if line[0] == b' ' || line[0] == b'\t' {
            // Continuation line: all value bytes, sensitivity inherited.
            if prev_sensitive {
                ranges.push((line_end.saturating_sub(2), line_end));
            } else {
                ranges.push((line_start, line_end));
            }
        } else if let Some(colon) = line.iter().position(|&b| b == b':') {
            if config.is_sensitive(&line[..colon]) {
                let value_limit = line.len().saturating_sub(2);
                let mut keep_end = colon + 1;
                while keep_end < value_limit && (line[keep_end] == b' ' || line[keep_end] == b'\t')
                {
                    keep_end += 1;
                }
                ranges.push((line_start, line_start + keep_end));
                ranges.push((line_end.saturating_sub(2), line_end));
                prev_sensitive = true;
            } else {
                ranges.push((line_start, line_end));
                prev_sensitive = false;
            }
        } else {
            // No colon: not a well-formed header, keep it visible.
            ranges.push((line_start, line_end));
            prev_sensitive = false;
        }

        line_start = line_end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn merged(block: &[u8]) -> Vec<(usize, usize)> {
        let config = HttpConfig::default();
        let ranges = header_keep_ranges(block, &config)
            .into_iter()
            .map(|(s, e)| (s as u32, e as u32))
            .collect();
        intervals::merge_intervals(ranges)
            .into_iter()
            .map(|(s, e)| (s as usize, e as usize))
            .collect()
    }

    #[test]
    fn sensitive_header_value_is_dropped() {
        let block = b"GET /x HTTP/1.1\r\nHost: a\r\nCookie: s=abc\r\n\r\n";
        // Start line + Host line + "Cookie: " survive; the cookie value does
        // not; both CRLFs at the end do.
        assert_eq!(merged(block), vec![(0, 34), (39, 43)]);
    }

    #[test]
    fn non_sensitive_headers_are_kept_whole() {
        let block = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n";
        assert_eq!(merged(block), vec![(0, block.len())]);
    }

    #[test]
    fn sensitive_matching_is_case_insensitive() {
        let block = b"GET / HTTP/1.1\r\nAUTHORIZATION: Bearer xyz\r\n\r\n";
        // "AUTHORIZATION: " = 15 bytes after the 16-byte start line.
        assert_eq!(merged(block), vec![(0, 31), (41, 45)]);
    }

    #[test]
    fn continuation_inherits_sensitivity() {
        let block = b"GET / HTTP/1.1\r\nCookie: a\r\n b\r\nHost: h\r\n\r\n";
        // Start line (0..16), "Cookie: " (16..24), CRLF (25..27), the
        // continuation's CRLF only (29..31), then Host + blank line.
        assert_eq!(merged(block), vec![(0, 24), (25, 27), (29, 42)]);
    }

    #[test]
    fn headerless_line_is_kept() {
        let block = b"GET / HTTP/1.1\r\ngarbage without colon\r\n\r\n";
        assert_eq!(merged(block), vec![(0, block.len())]);
    }

    #[test]
    fn start_line_found_mid_segment() {
        assert_eq!(find_start_line(b"...junkGET /x HTTP/1.1\r\n"), Some(7));
        assert_eq!(find_start_line(b"HTTP/1.1 200 OK\r\n"), Some(0));
        assert_eq!(find_start_line(b"no protocol here"), None);
    }
}
