//! Whole-pipeline runs: marker analysis feeding the masker.

use markers::Protocol;
use payload_mask::{process_file, Config};
use pretty_assertions::assert_eq;
use std::{io::Write, path::PathBuf};
use tempfile::{NamedTempFile, TempDir};

const PAYLOAD_OFFSET: usize = 14 + 20 + 20;

fn write_pcap(frames: &[Vec<u8>]) -> NamedTempFile {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for (i, frame) in frames.iter().enumerate() {
        out.extend_from_slice(&(i as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&out).unwrap();
    file.flush().unwrap();
    file
}

fn tcp_frame(
    src_ip: [u8; 4],
    src_port: u16,
    dst_ip: [u8; 4],
    dst_port: u16,
    seq: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PAYLOAD_OFFSET + payload.len());
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&((20 + 20 + payload.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.push(64);
    frame.push(6);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&src_ip);
    frame.extend_from_slice(&dst_ip);
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.push(0x50);
    frame.push(0x18);
    frame.extend_from_slice(&0xffffu16.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

fn output_payloads(path: &PathBuf) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    masker::pcap::stream_packets(path, |frame| {
        payloads.push(frame.data[PAYLOAD_OFFSET..].to_vec());
        Ok(())
    })
    .unwrap();
    payloads
}

#[test]
fn http_pipeline_masks_body_and_sensitive_values() {
    let payload = b"GET /x HTTP/1.1\r\nHost: a\r\nCookie: s=abc\r\n\r\nBODYBYTES";
    let input = write_pcap(&[tcp_frame(
        [10, 0, 0, 2],
        52000,
        [10, 0, 0, 1],
        80,
        1000,
        payload,
    )]);
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.pcap");

    let mut config = Config::default();
    config.protocol = Protocol::Http;
    let report = process_file(input.path(), &output, &config).unwrap();

    assert!(!report.rules.metadata.analysis_failed);
    assert!(report.stats.validation_passed);
    assert_eq!(report.stats.packets_processed, 1);

    let expected =
        b"GET /x HTTP/1.1\r\nHost: a\r\nCookie: \x00\x00\x00\x00\x00\r\n\r\n\x00\x00\x00\x00\x00\x00\x00\x00\x00";
    assert_eq!(output_payloads(&output)[0], expected.to_vec());
}

#[test]
fn tls_pipeline_fails_closed_without_a_dissector() {
    // A handshake record which would normally be preserved in full; with
    // the dissector unavailable, everything must be masked.
    let input = write_pcap(&[tcp_frame(
        [10, 0, 0, 1],
        443,
        [10, 0, 0, 2],
        52000,
        1000,
        b"\x16\x03\x03\x00\x04\xde\xad\xbe\xef",
    )]);
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.pcap");

    let mut config = Config::default();
    config.protocol = Protocol::Tls;
    config.dissector.executable_path = Some(PathBuf::from("/nonexistent/tshark"));
    let report = process_file(input.path(), &output, &config).unwrap();

    assert!(report.rules.metadata.analysis_failed);
    assert!(report.rules.is_empty());
    assert_eq!(output_payloads(&output)[0], vec![0u8; 9]);
}

#[test]
fn mask_byte_override_reaches_the_masker() {
    let input = write_pcap(&[tcp_frame(
        [10, 0, 0, 2],
        52000,
        [10, 0, 0, 1],
        80,
        1,
        b"not http at all....",
    )]);
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.pcap");

    let mut config = Config::default();
    config.protocol = Protocol::Http;
    config.masker.mask_byte = b'#';
    let report = process_file(input.path(), &output, &config).unwrap();

    // Port 80 makes this a candidate, but no start line is found, so no
    // rules exist and the payload is blanked with the configured byte.
    assert_eq!(report.rules.len(), 0);
    assert_eq!(output_payloads(&output)[0], vec![b'#'; 19]);
}

#[test]
fn rule_dump_serializes_the_contract() {
    let payload = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
    let input = write_pcap(&[tcp_frame(
        [10, 0, 0, 2],
        52000,
        [10, 0, 0, 1],
        80,
        4000,
        payload,
    )]);
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.pcap");

    let mut config = Config::default();
    config.protocol = Protocol::Http;
    let report = process_file(input.path(), &output, &config).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&report.rules.to_json().unwrap()).unwrap();
    assert_eq!(json["metadata"]["analyzer"], "http");
    let rules = json["rules"].as_array().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0]["seq_start"], 4000);
    assert_eq!(rules[0]["seq_end"], 4000 + payload.len() as u64);
    assert_eq!(rules[0]["preserve_strategy"], "full_preserve");
    assert_eq!(rules[0]["tuple_key"], "10.0.0.1:80-10.0.0.2:52000");
}
