//! Streaming capture input and buffered legacy pcap output.
//!
//! Input may be legacy pcap or pcapng; only one packet is held in memory at
//! a time. Output is always legacy microsecond pcap, so pcapng inputs are
//! converted on the way through (per-interface link type honored, first
//! interface wins for the file header).

use anyhow::{bail, Context as _, Error};
use byteorder::{LittleEndian, WriteBytesExt};
use log::trace;
use pcap_parser::{
    traits::PcapReaderIterator, Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader,
};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_BE: u32 = 0xd4c3_b2a1;
const PCAP_NSEC_MAGIC: u32 = 0xa1b2_3c4d;
const PCAP_NSEC_MAGIC_BE: u32 = 0x4d3c_b2a1;
const PCAPNG_MAGIC: u32 = 0x0a0d_0d0a;

const READER_BUFFER: usize = 0x1_0000;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

/// Identify the container by its magic number.
pub fn detect_format(path: &Path) -> Result<CaptureFormat, Error> {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .with_context(|| format!("Could not read capture header of {}", path.display()))?;
    match u32::from_le_bytes(magic) {
        PCAP_MAGIC | PCAP_MAGIC_BE | PCAP_NSEC_MAGIC | PCAP_NSEC_MAGIC_BE => Ok(CaptureFormat::Pcap),
        PCAPNG_MAGIC => Ok(CaptureFormat::PcapNg),
        other => bail!(
            "{} is not a capture file (magic {:#010x})",
            path.display(),
            other
        ),
    }
}

/// One packet block handed to the streaming callback.
pub struct Frame<'a> {
    pub linktype: i32,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub origlen: u32,
    pub data: &'a [u8],
}

/// Stream every packet of a capture in wire order. Returns the packet
/// count. The callback's error aborts the stream and propagates.
pub fn stream_packets<F>(path: &Path, on_packet: F) -> Result<u64, Error>
where
    F: FnMut(Frame) -> Result<(), Error>,
{
    let format = detect_format(path)?;
    let file =
        File::open(path).with_context(|| format!("Could not open capture {}", path.display()))?;
    match format {
        CaptureFormat::Pcap => stream_legacy(file, on_packet),
        CaptureFormat::PcapNg => stream_pcapng(file, on_packet),
    }
}

fn stream_legacy<F>(file: File, mut on_packet: F) -> Result<u64, Error>
where
    F: FnMut(Frame) -> Result<(), Error>,
{
    let mut reader =
        LegacyPcapReader::new(READER_BUFFER, file).map_err(|e| reader_error("pcap", &e))?;
    let mut linktype = 1i32;
    // Nanosecond captures carry the fraction in nanoseconds; the output is
    // always microseconds.
    let mut frac_divisor = 1u32;
    let mut count = 0u64;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        linktype = header.network.0;
                        if header.magic_number == PCAP_NSEC_MAGIC
                            || header.magic_number == PCAP_NSEC_MAGIC_BE
                        {
                            frac_divisor = 1000;
                        }
                    }
                    PcapBlockOwned::Legacy(packet) => {
                        count += 1;
                        on_packet(Frame {
                            linktype,
                            ts_sec: packet.ts_sec,
                            ts_usec: packet.ts_usec / frac_divisor,
                            origlen: packet.origlen,
                            data: packet.data,
                        })?;
                    }
                    PcapBlockOwned::NG(_) => unreachable!("NG block in legacy pcap"),
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete) => {
                reader
                    .refill()
                    .map_err(|e| reader_error("pcap", &e))?;
            }
            Err(e) => return Err(reader_error("pcap", &e)),
        }
    }
    Ok(count)
}

fn stream_pcapng<F>(file: File, mut on_packet: F) -> Result<u64, Error>
where
    F: FnMut(Frame) -> Result<(), Error>,
{
    let mut reader =
        PcapNGReader::new(READER_BUFFER, file).map_err(|e| reader_error("pcapng", &e))?;
    let mut if_linktypes: Vec<i32> = Vec::new();
    let mut count = 0u64;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        if_linktypes.clear();
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        if_linktypes.push(idb.linktype.0);
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let linktype = if_linktypes
                            .get(epb.if_id as usize)
                            .copied()
                            .unwrap_or(1);
                        // Microsecond resolution, the pcapng default.
                        let ts = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                        let caplen = (epb.caplen as usize).min(epb.data.len());
                        count += 1;
                        on_packet(Frame {
                            linktype,
                            ts_sec: (ts / 1_000_000) as u32,
                            ts_usec: (ts % 1_000_000) as u32,
                            origlen: epb.origlen,
                            data: &epb.data[..caplen],
                        })?;
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        let linktype = if_linktypes.get(0).copied().unwrap_or(1);
                        let caplen = (spb.origlen as usize).min(spb.data.len());
                        count += 1;
                        on_packet(Frame {
                            linktype,
                            ts_sec: 0,
                            ts_usec: 0,
                            origlen: spb.origlen,
                            data: &spb.data[..caplen],
                        })?;
                    }
                    PcapBlockOwned::NG(_) => {
                        trace!("Skipping pcapng metadata block");
                    }
                    _ => {}
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete) => {
                reader
                    .refill()
                    .map_err(|e| reader_error("pcapng", &e))?;
            }
            Err(e) => return Err(reader_error("pcapng", &e)),
        }
    }
    Ok(count)
}

/// Link type of the capture without streaming its packets: the legacy file
/// header, or the first interface description of a pcapng section.
pub fn capture_linktype(path: &Path) -> Result<i32, Error> {
    match detect_format(path)? {
        CaptureFormat::Pcap => {
            let mut header = [0u8; 24];
            File::open(path)?.read_exact(&mut header)?;
            let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let raw = [header[20], header[21], header[22], header[23]];
            let network = if magic == PCAP_MAGIC_BE || magic == PCAP_NSEC_MAGIC_BE {
                i32::from_be_bytes(raw)
            } else {
                i32::from_le_bytes(raw)
            };
            Ok(network)
        }
        CaptureFormat::PcapNg => {
            let file = File::open(path)?;
            let mut reader =
                PcapNGReader::new(READER_BUFFER, file).map_err(|e| reader_error("pcapng", &e))?;
            loop {
                match reader.next() {
                    Ok((offset, block)) => {
                        if let PcapBlockOwned::NG(Block::InterfaceDescription(idb)) = block {
                            return Ok(idb.linktype.0);
                        }
                        reader.consume(offset);
                    }
                    Err(PcapError::Eof) => return Ok(1),
                    Err(PcapError::Incomplete) => {
                        reader.refill().map_err(|e| reader_error("pcapng", &e))?;
                    }
                    Err(e) => return Err(reader_error("pcapng", &e)),
                }
            }
        }
    }
}

fn reader_error(kind: &str, err: &PcapError) -> Error {
    anyhow::anyhow!("failed reading {} capture: {:?}", kind, err)
}

/// Buffered legacy pcap writer.
pub struct PcapSink {
    writer: BufWriter<File>,
}

impl PcapSink {
    pub fn create(path: &Path, linktype: i32, snaplen: u32) -> Result<Self, Error> {
        let file = File::create(path)
            .with_context(|| format!("Could not create output capture {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<LittleEndian>(PCAP_MAGIC)?;
        writer.write_u16::<LittleEndian>(2)?;
        writer.write_u16::<LittleEndian>(4)?;
        writer.write_i32::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(snaplen)?;
        writer.write_u32::<LittleEndian>(linktype as u32)?;
        Ok(PcapSink { writer })
    }

    pub fn write_packet(
        &mut self,
        ts_sec: u32,
        ts_usec: u32,
        origlen: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        self.writer.write_u32::<LittleEndian>(ts_sec)?;
        self.writer.write_u32::<LittleEndian>(ts_usec)?;
        self.writer.write_u32::<LittleEndian>(data.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(origlen)?;
        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_packets_through_sink_and_reader() {
        let out = NamedTempFile::new().unwrap();
        let mut sink = PcapSink::create(out.path(), 1, 65535).unwrap();
        sink.write_packet(10, 20, 4, &[1, 2, 3, 4]).unwrap();
        sink.write_packet(11, 21, 9, &[5, 6, 7]).unwrap(); // truncated frame
        sink.finish().unwrap();

        let mut seen = Vec::new();
        let count = stream_packets(out.path(), |frame| {
            seen.push((
                frame.ts_sec,
                frame.ts_usec,
                frame.origlen,
                frame.data.to_vec(),
            ));
            assert_eq!(frame.linktype, 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            seen,
            vec![
                (10, 20, 4, vec![1, 2, 3, 4]),
                (11, 21, 9, vec![5, 6, 7]),
            ]
        );
    }

    #[test]
    fn empty_file_is_rejected() {
        let out = NamedTempFile::new().unwrap();
        assert!(detect_format(out.path()).is_err());
    }

    #[test]
    fn linktype_is_read_from_the_header() {
        let out = NamedTempFile::new().unwrap();
        let sink = PcapSink::create(out.path(), 113, 65535).unwrap();
        sink.finish().unwrap();
        assert_eq!(capture_linktype(out.path()).unwrap(), 113);
        assert_eq!(detect_format(out.path()).unwrap(), CaptureFormat::Pcap);
    }
}
