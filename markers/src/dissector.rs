//! External protocol dissector behind a narrow trait.
//!
//! The TLS marker does not reassemble TCP itself; it consumes the dissector's
//! per-segment view of TLS record framing. Keeping the subprocess behind
//! [`RecordSource`] lets tests substitute a canned segment list.

use crate::tls::MessageType;
use anyhow::{bail, Context as _, Error};
use keep_rules::Endpoint;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use wait_timeout::ChildExt;

/// One TLS record begun or continued in a TCP segment.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RecordDescriptor {
    pub content_type: MessageType,
    /// Declared body length from the 5-byte record header.
    pub length: u32,
    /// Absolute TCP sequence number of the record's first header byte.
    pub seq_offset: u32,
}

/// The dissector's view of one TCP segment carrying TLS.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SegmentRecords {
    pub frame: u32,
    /// Dissector-assigned TCP stream id, in flow encounter order.
    pub stream: u64,
    pub src: Endpoint,
    pub dst: Endpoint,
    /// Absolute sequence number of the segment's first payload byte.
    pub seq: u32,
    pub seg_len: u32,
    pub records: Vec<RecordDescriptor>,
}

/// Source of per-segment TLS record descriptors.
pub trait RecordSource {
    fn segments(&self, pcap: &Path) -> Result<Vec<SegmentRecords>, Error>;
}

/// Configuration of the external dissector subprocess.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DissectorConfig {
    /// Explicit path to the tshark executable. When unset, `PATH` and a few
    /// well-known install locations are probed.
    pub executable_path: Option<PathBuf>,
    /// Wall-clock limit for one dissector invocation; the child is killed
    /// when it is exceeded.
    pub timeout_seconds: u64,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        DissectorConfig {
            executable_path: None,
            timeout_seconds: 300,
        }
    }
}

/// Well-known tshark locations probed after `PATH`.
const TSHARK_CANDIDATES: &[&str] = &[
    "/usr/bin/tshark",
    "/usr/local/bin/tshark",
    "/opt/wireshark/bin/tshark",
    "/opt/homebrew/bin/tshark",
    "/Applications/Wireshark.app/Contents/MacOS/tshark",
];

/// Fields requested from tshark, one `-e` each.
const TSHARK_FIELDS: &[&str] = &[
    "frame.number",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "tcp.srcport",
    "tcp.dstport",
    "tcp.stream",
    "tcp.seq",
    "tcp.len",
    "tls.record.content_type",
    "tls.record.opaque_type",
    "tls.record.length",
];

/// Protocol preferences. Relative sequence numbers are disabled because
/// keep rules live on the absolute sequence axis the rewriter sees on the
/// wire.
const TSHARK_PREFS: &[&str] = &[
    "tcp.desegment_tcp_streams:TRUE",
    "tls.desegment_ssl_records:TRUE",
    "tcp.relative_sequence_numbers:FALSE",
];

/// Invokes tshark in field-export mode and reconstructs per-record absolute
/// sequence offsets from its output.
pub struct TsharkSource {
    config: DissectorConfig,
}

impl TsharkSource {
    pub fn new(config: DissectorConfig) -> Self {
        TsharkSource { config }
    }

    fn resolve_executable(&self) -> Result<PathBuf, Error> {
        if let Some(path) = &self.config.executable_path {
            if path.exists() {
                return Ok(path.clone());
            }
            bail!("configured dissector executable {} does not exist", path.display());
        }
        if let Some(paths) = env::var_os("PATH") {
            for dir in env::split_paths(&paths) {
                let candidate = dir.join("tshark");
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        for candidate in TSHARK_CANDIDATES {
            let candidate = Path::new(candidate);
            if candidate.is_file() {
                return Ok(candidate.to_path_buf());
            }
        }
        bail!("no tshark executable found in PATH or well-known locations")
    }

    fn run_tshark(&self, tshark: &Path, pcap: &Path) -> Result<String, Error> {
        let stdout = tempfile::NamedTempFile::new().context("Could not create dissector output file")?;
        let mut cmd = Command::new(tshark);
        cmd.arg("-r").arg(pcap).args(&["-T", "json"]);
        for field in TSHARK_FIELDS {
            cmd.args(&["-e", field]);
        }
        cmd.args(&["-E", "occurrence=a"]);
        for pref in TSHARK_PREFS {
            cmd.args(&["-o", pref]);
        }
        cmd.args(&["-Y", "tls", "-q"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.reopen()?))
            .stderr(Stdio::null());
        trace!("Execute dissector: {:?}", cmd);

        let mut child = cmd.spawn().context("Could not start dissector")?;
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("dissector exceeded the {}s timeout", self.config.timeout_seconds);
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.try_wait();
                return Err(err.into());
            }
        };
        if !status.success() {
            bail!("dissector exited with {}", status);
        }
        let output = fs::read_to_string(stdout.path())?;
        if output.trim().is_empty() {
            debug!("Dissector produced no output, capture carries no TLS");
            return Ok("[]".to_string());
        }
        Ok(output)
    }
}

impl RecordSource for TsharkSource {
    fn segments(&self, pcap: &Path) -> Result<Vec<SegmentRecords>, Error> {
        let tshark = self.resolve_executable()?;
        let output = self.run_tshark(&tshark, pcap)?;
        let mut segments = parse_tshark_output(&output)?;
        assign_record_offsets(&mut segments);
        Ok(segments)
    }
}

/// Parse the `-T json` field export into segments. Record `seq_offset`s are
/// left at zero; [`assign_record_offsets`] fills them in afterwards.
fn parse_tshark_output(json: &str) -> Result<Vec<SegmentRecords>, Error> {
    let packets: Value = serde_json::from_str(json).context("dissector output is not valid JSON")?;
    let packets = match packets.as_array() {
        Some(arr) => arr,
        None => bail!("dissector output is not a JSON array"),
    };

    let mut segments = Vec::with_capacity(packets.len());
    for packet in packets {
        let layers = &packet["_source"]["layers"];
        if layers.is_null() {
            continue;
        }
        let segment = match parse_packet(layers) {
            Some(segment) => segment,
            None => {
                trace!("Skipping dissector frame without usable TCP fields");
                continue;
            }
        };
        segments.push(segment);
    }
    Ok(segments)
}

fn parse_packet(layers: &Value) -> Option<SegmentRecords> {
    let frame = field_num(layers, "frame.number")? as u32;
    let stream = field_num(layers, "tcp.stream")?;
    let seq = field_num(layers, "tcp.seq")? as u32;
    let seg_len = field_num(layers, "tcp.len").unwrap_or(0) as u32;

    let src_ip = field_str(layers, "ip.src").or_else(|| field_str(layers, "ipv6.src"))?;
    let dst_ip = field_str(layers, "ip.dst").or_else(|| field_str(layers, "ipv6.dst"))?;
    let src = Endpoint::new(
        src_ip.parse().ok()?,
        field_num(layers, "tcp.srcport")? as u16,
    );
    let dst = Endpoint::new(
        dst_ip.parse().ok()?,
        field_num(layers, "tcp.dstport")? as u16,
    );

    // Plaintext records report a content type; TLS 1.3 encrypted records
    // surface only the outer opaque type. tshark emits each list in record
    // order, plaintext records ahead of encrypted ones within a frame.
    let mut types: Vec<u64> = field_nums(layers, "tls.record.content_type");
    types.extend(field_nums(layers, "tls.record.opaque_type"));
    let lengths = field_nums(layers, "tls.record.length");

    let records = types
        .into_iter()
        .zip(lengths.into_iter())
        .map(|(typ, length)| RecordDescriptor {
            content_type: MessageType::from(typ as u8),
            length: length as u32,
            seq_offset: 0,
        })
        .collect();

    Some(SegmentRecords {
        frame,
        stream,
        src,
        dst,
        seq,
        seg_len,
        records,
    })
}

fn field_values<'a>(layers: &'a Value, name: &str) -> impl Iterator<Item = &'a str> {
    layers[name]
        .as_array()
        .map(|arr| arr.as_slice())
        .unwrap_or(&[])
        .iter()
        .filter_map(Value::as_str)
}

fn field_str(layers: &Value, name: &str) -> Option<String> {
    field_values(layers, name).next().map(str::to_string)
}

fn field_num(layers: &Value, name: &str) -> Option<u64> {
    field_values(layers, name).next().and_then(parse_num)
}

fn field_nums(layers: &Value, name: &str) -> Vec<u64> {
    field_values(layers, name).filter_map(parse_num).collect()
}

/// tshark renders most numerics decimal but some fields hexadecimal.
fn parse_num(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Reconstruct each record's absolute start offset.
///
/// The dissector attributes a desegmented record to the frame where it
/// completes, so a per-(stream, sender) cursor tracks where the next record
/// must begin: the first TLS segment of a direction starts a record at its
/// own `seq`, and every record advances the cursor by header plus declared
/// body length. A record always completes inside the frame that reports it;
/// a cursor whose record would end at or before the current segment start is
/// stale (capture gap) and snaps forward to the segment start.
pub fn assign_record_offsets(segments: &mut [SegmentRecords]) {
    let mut cursors: HashMap<(u64, Endpoint), u32> = HashMap::new();

    for seg in segments.iter_mut() {
        let cursor = cursors.entry((seg.stream, seg.src)).or_insert(seg.seq);
        for record in seg.records.iter_mut() {
            let end = cursor.wrapping_add(5 + record.length);
            if end <= seg.seq {
                warn!(
                    "Record cursor {} is stale for frame {} (seq {}), resyncing",
                    cursor, seg.frame, seg.seq
                );
                *cursor = seg.seq;
            }
            record.seq_offset = *cursor;
            *cursor = cursor.wrapping_add(5 + record.length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(last: u8, port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn seg(frame: u32, seq: u32, seg_len: u32, records: Vec<(MessageType, u32)>) -> SegmentRecords {
        SegmentRecords {
            frame,
            stream: 0,
            src: ep(1, 443),
            dst: ep(2, 52000),
            seq,
            seg_len,
            records: records
                .into_iter()
                .map(|(content_type, length)| RecordDescriptor {
                    content_type,
                    length,
                    seq_offset: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn record_spanning_two_segments_starts_in_the_first() {
        // 3 header bytes in the first segment, the rest of the record in the
        // second; the dissector reports the record at the completing frame.
        let mut segments = vec![
            seg(1, 1000, 3, vec![]),
            seg(2, 1003, 8, vec![(MessageType::ApplicationData, 8)]),
        ];
        assign_record_offsets(&mut segments);
        assert_eq!(segments[1].records[0].seq_offset, 1000);
    }

    #[test]
    fn multiple_records_in_one_segment_chain() {
        let mut segments = vec![seg(
            1,
            2000,
            15,
            vec![(MessageType::Handshake, 2), (MessageType::ApplicationData, 3)],
        )];
        assign_record_offsets(&mut segments);
        assert_eq!(segments[0].records[0].seq_offset, 2000);
        assert_eq!(segments[0].records[1].seq_offset, 2007);
    }

    #[test]
    fn directions_keep_independent_cursors() {
        let mut rev = seg(2, 9000, 10, vec![(MessageType::Handshake, 5)]);
        rev.src = ep(2, 52000);
        rev.dst = ep(1, 443);
        let mut segments = vec![seg(1, 1000, 10, vec![(MessageType::Handshake, 5)]), rev];
        assign_record_offsets(&mut segments);
        assert_eq!(segments[0].records[0].seq_offset, 1000);
        assert_eq!(segments[1].records[0].seq_offset, 9000);
    }

    #[test]
    fn stale_cursor_snaps_to_segment_start() {
        // A gap in the capture: the cursor left at 1010 cannot describe a
        // record completing in a segment starting at 5000.
        let mut segments = vec![
            seg(1, 1000, 10, vec![(MessageType::Handshake, 5)]),
            seg(2, 5000, 10, vec![(MessageType::ApplicationData, 100)]),
        ];
        assign_record_offsets(&mut segments);
        assert_eq!(segments[1].records[0].seq_offset, 5000);
    }

    #[test]
    fn parses_tshark_field_export() {
        let json = r#"[
          {"_source": {"layers": {
            "frame.number": ["4"],
            "ip.src": ["10.0.0.1"], "ip.dst": ["10.0.0.2"],
            "tcp.srcport": ["443"], "tcp.dstport": ["52000"],
            "tcp.stream": ["0"], "tcp.seq": ["1000"], "tcp.len": ["15"],
            "tls.record.content_type": ["22"],
            "tls.record.opaque_type": ["23"],
            "tls.record.length": ["2", "3"]
          }}},
          {"_source": {"layers": {
            "frame.number": ["5"]
          }}}
        ]"#;
        let segments = parse_tshark_output(json).unwrap();
        assert_eq!(segments.len(), 1);
        let seg = &segments[0];
        assert_eq!(seg.frame, 4);
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.records.len(), 2);
        assert_eq!(seg.records[0].content_type, MessageType::Handshake);
        assert_eq!(seg.records[0].length, 2);
        assert_eq!(seg.records[1].content_type, MessageType::ApplicationData);
        assert_eq!(seg.records[1].length, 3);
    }
}
