//! Capture container loading.
//!
//! Drives an incremental pcap/pcapng reader over the upload, so resource
//! ceilings are enforced while bytes stream in rather than after a full
//! materialization, and reduces each frame to a [PacketRecord]. Frames stay
//! in on-disk order throughout.

use super::containers::{LayerSet, PacketRecord, TcpFlags};
use super::core::{CancelToken, Limits};
use super::errors::{AnalysisError, Result};
use etherparse::{EtherType, LinkSlice, NetSlice, SlicedPacket, TransportSlice};
use md5::{Digest, Md5};
use pcap_parser::pcapng::Block;
use pcap_parser::{create_reader, Linktype, PcapBlockOwned, PcapError};
use std::io::Read;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Sliding read-buffer size. Frames larger than this cannot be parsed.
const READER_CAPACITY: usize = 1 << 20;

/// Magic numbers marking a legacy capture with nanosecond timestamps.
const NSEC_MAGIC: u32 = 0xa1b2_3c4d;
const NSEC_MAGIC_SWAPPED: u32 = 0x4d3c_b2a1;

/// A fully loaded capture: the ordered records plus what the bounded read
/// learned about the raw upload.
#[derive(Debug)]
pub struct Loaded {
    pub records: Vec<PacketRecord>,
    /// MD5 fingerprint of the raw upload bytes.
    pub md5: String,
    /// Container bytes consumed from the source.
    pub bytes_read: u64,
}

/// Running state folded over every byte pulled from the source.
struct Tap {
    hasher: Md5,
    bytes: u64,
}

/// Wraps the upload source so fingerprinting and byte accounting happen
/// during the parse pass itself.
struct TapReader<R: Read> {
    inner: R,
    tap: Arc<Mutex<Tap>>,
}

impl<R: Read> Read for TapReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut tap = locked(&self.tap);
        tap.hasher.update(&buf[..n]);
        tap.bytes += n as u64;
        Ok(n)
    }
}

fn locked(tap: &Mutex<Tap>) -> std::sync::MutexGuard<'_, Tap> {
    tap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Timestamp handling for one pcapng interface.
struct NgInterface {
    linktype: Linktype,
    units_per_sec: u64,
    ts_offset: i64,
}

/// Parses a pcap or pcapng byte stream into ordered packet records.
///
/// The declared frame order is trusted as-is; records are never re-sorted by
/// timestamp. Fails with `CaptureFormat` when the container is not
/// recognizable and `CaptureTruncated` when a declared frame length exceeds
/// the bytes remaining in the stream.
pub fn load_records<R: Read + Send>(reader: R, limits: &Limits, cancel: &CancelToken) -> Result<Loaded> {
    log::info!("Loading capture stream.");

    let tap = Arc::new(Mutex::new(Tap {
        hasher: Md5::new(),
        bytes: 0,
    }));
    let tap_reader = TapReader {
        inner: reader,
        tap: Arc::clone(&tap),
    };

    let mut pcap = create_reader(READER_CAPACITY, tap_reader)
        .map_err(|err| AnalysisError::CaptureFormat(format!("{err:?}")))?;

    let mut records: Vec<PacketRecord> = Vec::new();
    // Legacy captures: one link type and tick resolution for the whole file.
    let mut legacy_linktype = Linktype::ETHERNET;
    let mut legacy_divisor = 1_000_000.0;
    // pcapng captures: per-interface link type and tick resolution.
    let mut interfaces: Vec<NgInterface> = Vec::new();

    loop {
        match pcap.next() {
            Ok((offset, block)) => {
                if cancel.is_cancelled() {
                    log::warn!("Analysis cancelled mid-parse after {} records.", records.len());
                    return Err(AnalysisError::Cancelled);
                }

                match block {
                    PcapBlockOwned::LegacyHeader(hdr) => {
                        legacy_linktype = hdr.network;
                        legacy_divisor = if hdr.magic_number == NSEC_MAGIC
                            || hdr.magic_number == NSEC_MAGIC_SWAPPED
                        {
                            1_000_000_000.0
                        } else {
                            1_000_000.0
                        };
                    }
                    PcapBlockOwned::Legacy(frame) => {
                        let ts = f64::from(frame.ts_sec) + f64::from(frame.ts_usec) / legacy_divisor;
                        records.push(decode_frame(legacy_linktype, ts, frame.data));
                    }
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(NgInterface {
                            linktype: idb.linktype,
                            units_per_sec: units_per_second(idb.if_tsresol),
                            ts_offset: idb.if_tsoffset,
                        });
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let (linktype, units, ts_offset) = match interfaces.get(epb.if_id as usize)
                        {
                            Some(iface) => (iface.linktype, iface.units_per_sec, iface.ts_offset),
                            None => (Linktype::ETHERNET, 1_000_000, 0),
                        };
                        let ticks = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                        let ts = ts_offset as f64
                            + (ticks / units) as f64
                            + (ticks % units) as f64 / units as f64;
                        records.push(decode_frame(linktype, ts, epb.data));
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        // Simple packet blocks carry no timestamp.
                        let linktype = interfaces
                            .first()
                            .map(|iface| iface.linktype)
                            .unwrap_or(Linktype::ETHERNET);
                        records.push(decode_frame(linktype, 0.0, spb.data));
                    }
                    PcapBlockOwned::NG(_) => {}
                }
                pcap.consume(offset);

                if records.len() > limits.max_packets {
                    return Err(AnalysisError::InvalidInput(format!(
                        "capture exceeds the ceiling of {} packets",
                        limits.max_packets
                    )));
                }
                if locked(&tap).bytes > limits.max_bytes {
                    return Err(AnalysisError::InvalidInput(format!(
                        "capture exceeds the ceiling of {} bytes",
                        limits.max_bytes
                    )));
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                let before = locked(&tap).bytes;
                if let Err(err) = pcap.refill() {
                    return Err(refill_error(err));
                }
                // A refill that pulls nothing new means the container
                // declared more frame bytes than the stream holds.
                if locked(&tap).bytes == before {
                    return Err(AnalysisError::CaptureTruncated(
                        "a declared frame length exceeds the remaining bytes".to_string(),
                    ));
                }
            }
            Err(PcapError::UnexpectedEof) => {
                return Err(AnalysisError::CaptureTruncated(
                    "stream ended inside a declared frame".to_string(),
                ));
            }
            Err(PcapError::BufferTooSmall) => {
                return Err(AnalysisError::CaptureFormat(format!(
                    "frame larger than the {READER_CAPACITY} byte read buffer"
                )));
            }
            Err(err) => {
                return Err(AnalysisError::CaptureFormat(format!("{err:?}")));
            }
        }
    }

    let tap = locked(&tap);
    let md5 = hex::encode(tap.hasher.clone().finalize());
    log::info!("Loaded {} packet records from {} bytes.", records.len(), tap.bytes);

    Ok(Loaded {
        records,
        md5,
        bytes_read: tap.bytes,
    })
}

fn refill_error<I: std::fmt::Debug>(err: PcapError<I>) -> AnalysisError {
    match err {
        PcapError::UnexpectedEof | PcapError::Incomplete(_) => AnalysisError::CaptureTruncated(
            "stream ended inside a declared frame".to_string(),
        ),
        other => AnalysisError::CaptureFormat(format!("{other:?}")),
    }
}

/// Ticks per second for a pcapng `if_tsresol` value. The high bit selects a
/// base-2 resolution; otherwise the value is a base-10 exponent.
fn units_per_second(if_tsresol: u8) -> u64 {
    let exponent = u32::from(if_tsresol & 0x7f);
    let units = if if_tsresol & 0x80 == 0 {
        10u64.checked_pow(exponent)
    } else {
        1u64.checked_shl(exponent)
    };
    units.unwrap_or(1_000_000)
}

/// Reduces one captured frame to a [PacketRecord].
///
/// Frames that do not decode (unknown link layer, mangled headers) keep an
/// empty layer set and classify as Other, like the rest of the pipeline
/// expects; a mangled frame is not a loader failure.
fn decode_frame(linktype: Linktype, timestamp: f64, data: &[u8]) -> PacketRecord {
    let mut record = PacketRecord {
        timestamp,
        wire_len: data.len() as u32,
        layers: LayerSet::default(),
        src_ip: None,
        dst_ip: None,
        src_port: None,
        dst_port: None,
        tcp_flags: None,
    };

    let sliced = if linktype == Linktype::ETHERNET {
        SlicedPacket::from_ethernet(data).ok()
    } else if linktype == Linktype::RAW {
        SlicedPacket::from_ip(data).ok()
    } else {
        None
    };

    if let Some(sliced) = sliced {
        fill_layers(&mut record, &sliced);
    }
    record
}

fn fill_layers(record: &mut PacketRecord, sliced: &SlicedPacket) {
    match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            record.layers.ip = true;
            record.src_ip = Some(IpAddr::from(header.source_addr()));
            record.dst_ip = Some(IpAddr::from(header.destination_addr()));
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            record.layers.ip = true;
            record.src_ip = Some(IpAddr::from(header.source_addr()));
            record.dst_ip = Some(IpAddr::from(header.destination_addr()));
        }
        None => {
            if let Some(LinkSlice::Ethernet2(eth)) = &sliced.link {
                if eth.ether_type() == EtherType::ARP {
                    record.layers.arp = true;
                }
            }
        }
    }

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            record.layers.tcp = true;
            record.src_port = Some(tcp.source_port());
            record.dst_port = Some(tcp.destination_port());
            record.tcp_flags = Some(TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            });
        }
        Some(TransportSlice::Udp(udp)) => {
            record.layers.udp = true;
            record.src_port = Some(udp.source_port());
            record.dst_port = Some(udp.destination_port());
        }
        Some(TransportSlice::Icmpv4(_)) => {
            record.layers.icmp = true;
        }
        // ICMPv6 is deliberately not folded into the ICMP bucket.
        _ => {}
    }

    // Port 53 on either side marks the DNS layer. The tally still buckets
    // such packets under their transport.
    if (record.layers.tcp || record.layers.udp) && record.port_in_use(53) {
        record.layers.dns = true;
    }
}
