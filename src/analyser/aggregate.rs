//! Single-pass traffic aggregation.
//!
//! One walk over the record sequence produces the capture summary, the
//! protocol tally, the top talkers and the bounded packet preview. Every
//! invocation allocates its own state, so concurrent analyses never share
//! anything.

use super::classify;
use super::containers::{
    round2, round3, CaptureSummary, PacketPreview, PacketRecord, ProtocolTally, TopTalker,
};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// How many sources the talker ranking keeps.
pub const TOP_TALKER_COUNT: usize = 5;

/// How many packets the preview shows at most.
pub const PREVIEW_COUNT: usize = 10;

/// Output of one aggregation pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregate {
    pub summary: CaptureSummary,
    pub protocol_stats: ProtocolTally,
    pub top_talkers: Vec<TopTalker>,
    pub packet_details: Vec<PacketPreview>,
}

/// Aggregates a packet sequence in a single pass.
///
/// An empty capture is a valid input and yields the all-zero summary with
/// empty tally, talkers and preview.
pub fn aggregate(records: &[PacketRecord]) -> Aggregate {
    if records.is_empty() {
        return Aggregate::default();
    }

    log::info!("Aggregating {} packet records.", records.len());

    let start_time = records[0].timestamp;
    let end_time = records[records.len() - 1].timestamp;
    let duration = if records.len() < 2 {
        0.0
    } else {
        round2(end_time - start_time)
    };

    let mut total_bytes: u64 = 0;
    let mut tally = ProtocolTally::new();
    let mut source_counts: HashMap<IpAddr, u64> = HashMap::new();
    // Position of each source's first packet; breaks ranking ties.
    let mut first_seen: HashMap<IpAddr, usize> = HashMap::new();
    let mut dest_counts: HashMap<IpAddr, u64> = HashMap::new();
    let mut endpoints: HashSet<IpAddr> = HashSet::new();

    for (index, record) in records.iter().enumerate() {
        total_bytes += u64::from(record.wire_len);
        *tally
            .entry(classify::tally_label(record).to_string())
            .or_insert(0) += 1;

        if let Some(src) = record.src_ip {
            *source_counts.entry(src).or_insert(0) += 1;
            first_seen.entry(src).or_insert(index);
            endpoints.insert(src);
        }
        if let Some(dst) = record.dst_ip {
            *dest_counts.entry(dst).or_insert(0) += 1;
            endpoints.insert(dst);
        }
    }

    let mut ranked: Vec<(IpAddr, u64, usize)> = source_counts
        .iter()
        .map(|(ip, count)| (*ip, *count, first_seen[ip]))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.truncate(TOP_TALKER_COUNT);

    let top_talkers = ranked
        .into_iter()
        .map(|(ip, count, _)| TopTalker {
            endpoint: ip.to_string(),
            count,
        })
        .collect();

    let packet_details = records
        .iter()
        .take(PREVIEW_COUNT)
        .map(|record| PacketPreview {
            relative_time: round3(record.timestamp - start_time),
            source: endpoint_label(record.src_ip),
            destination: endpoint_label(record.dst_ip),
            protocol: classify::display_label(record),
            size_bytes: record.wire_len,
        })
        .collect();

    Aggregate {
        summary: CaptureSummary {
            total_packets: records.len() as u64,
            duration,
            unique_ips: endpoints.len(),
            total_bytes,
        },
        protocol_stats: tally,
        top_talkers,
        packet_details,
    }
}

fn endpoint_label(ip: Option<IpAddr>) -> String {
    match ip {
        Some(ip) => ip.to_string(),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::LayerSet;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn tcp_record(src: u8, dst: u8, timestamp: f64, wire_len: u32) -> PacketRecord {
        PacketRecord {
            timestamp,
            wire_len,
            layers: LayerSet {
                ip: true,
                tcp: true,
                ..LayerSet::default()
            },
            src_ip: Some(ip(src)),
            dst_ip: Some(ip(dst)),
            src_port: Some(40000),
            dst_port: Some(8080),
            tcp_flags: None,
        }
    }

    #[test]
    fn empty_capture_is_a_valid_result() {
        let agg = aggregate(&[]);
        assert_eq!(agg.summary, CaptureSummary::default());
        assert!(agg.protocol_stats.is_empty());
        assert!(agg.top_talkers.is_empty());
        assert!(agg.packet_details.is_empty());
    }

    #[test]
    fn tally_values_sum_to_total_packets() {
        let mut records = vec![
            tcp_record(1, 2, 100.0, 60),
            tcp_record(1, 2, 100.5, 60),
            tcp_record(2, 1, 101.0, 60),
        ];
        records.push(PacketRecord {
            timestamp: 101.5,
            wire_len: 90,
            layers: LayerSet {
                ip: true,
                udp: true,
                dns: true,
                ..LayerSet::default()
            },
            src_ip: Some(ip(3)),
            dst_ip: Some(ip(1)),
            src_port: Some(40001),
            dst_port: Some(53),
            tcp_flags: None,
        });
        records.push(PacketRecord {
            timestamp: 102.0,
            wire_len: 42,
            layers: LayerSet {
                arp: true,
                ..LayerSet::default()
            },
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
        });

        let agg = aggregate(&records);
        assert_eq!(agg.summary.total_packets, records.len() as u64);
        let tallied: u64 = agg.protocol_stats.values().sum();
        assert_eq!(tallied, agg.summary.total_packets);
        assert_eq!(agg.protocol_stats["TCP"], 3);
        assert_eq!(agg.protocol_stats["UDP"], 1);
        assert_eq!(agg.protocol_stats["ARP"], 1);
        assert_eq!(agg.summary.total_bytes, 60 * 3 + 90 + 42);
        assert_eq!(agg.summary.duration, 2.0);
        assert_eq!(agg.summary.unique_ips, 3);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let records = vec![
            tcp_record(1, 2, 10.0, 60),
            tcp_record(2, 1, 10.2, 64),
            tcp_record(1, 3, 10.4, 70),
        ];
        assert_eq!(aggregate(&records), aggregate(&records));
    }

    #[test]
    fn talker_ties_break_by_first_seen_order() {
        // .2 and .1 both send twice; .2 appears first in the capture.
        let records = vec![
            tcp_record(2, 9, 0.0, 60),
            tcp_record(1, 9, 0.1, 60),
            tcp_record(1, 9, 0.2, 60),
            tcp_record(2, 9, 0.3, 60),
            tcp_record(3, 9, 0.4, 60),
        ];

        let agg = aggregate(&records);
        assert_eq!(agg.top_talkers.len(), 3);
        assert_eq!(agg.top_talkers[0].endpoint, "10.0.0.2");
        assert_eq!(agg.top_talkers[0].count, 2);
        assert_eq!(agg.top_talkers[1].endpoint, "10.0.0.1");
        assert_eq!(agg.top_talkers[2].endpoint, "10.0.0.3");
    }

    #[test]
    fn talker_ranking_truncates_to_five() {
        let mut records = Vec::new();
        for src in 1..=7u8 {
            for _ in 0..src {
                records.push(tcp_record(src, 99, 0.0, 60));
            }
        }

        let agg = aggregate(&records);
        assert_eq!(agg.top_talkers.len(), TOP_TALKER_COUNT);
        assert_eq!(agg.top_talkers[0].endpoint, "10.0.0.7");
        assert_eq!(agg.top_talkers[4].endpoint, "10.0.0.3");
    }

    #[test]
    fn preview_is_bounded_and_uses_display_labels() {
        let mut records = Vec::new();
        records.push(PacketRecord {
            timestamp: 50.0,
            wire_len: 80,
            layers: LayerSet {
                ip: true,
                udp: true,
                dns: true,
                ..LayerSet::default()
            },
            src_ip: Some(ip(1)),
            dst_ip: Some(ip(2)),
            src_port: Some(40001),
            dst_port: Some(53),
            tcp_flags: None,
        });
        for index in 0..12 {
            records.push(tcp_record(1, 2, 50.0 + f64::from(index) * 0.25, 60));
        }

        let agg = aggregate(&records);
        assert_eq!(agg.packet_details.len(), PREVIEW_COUNT);
        // DNS in the preview even though the tally bucket is UDP.
        assert_eq!(agg.packet_details[0].protocol, "DNS");
        assert_eq!(agg.packet_details[0].relative_time, 0.0);
        assert_eq!(agg.packet_details[2].relative_time, 0.25);
        assert_eq!(agg.protocol_stats["UDP"], 1);
    }

    #[test]
    fn preview_marks_missing_endpoints() {
        let records = vec![PacketRecord {
            timestamp: 1.0,
            wire_len: 42,
            layers: LayerSet {
                arp: true,
                ..LayerSet::default()
            },
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
        }];

        let agg = aggregate(&records);
        assert_eq!(agg.packet_details[0].source, "N/A");
        assert_eq!(agg.packet_details[0].destination, "N/A");
        assert_eq!(agg.packet_details[0].protocol, "ARP");
    }

    #[test]
    fn single_packet_duration_clamps_to_zero() {
        let agg = aggregate(&[tcp_record(1, 2, 123.456, 60)]);
        assert_eq!(agg.summary.duration, 0.0);
        assert_eq!(agg.summary.total_packets, 1);
    }
}
