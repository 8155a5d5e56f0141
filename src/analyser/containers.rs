use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Which protocol layers were found in a frame.
///
/// A packet can carry several of these at once (a DNS query also has its UDP
/// and IP layers set); the tally and display label functions decide which one
/// a packet counts as.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerSet {
    pub ip: bool,
    pub tcp: bool,
    pub udp: bool,
    pub icmp: bool,
    pub arp: bool,
    pub dns: bool,
}

/// TCP control bits of a single segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    /// SYN set with ACK clear; a connection-opening probe.
    pub fn is_bare_syn(&self) -> bool {
        self.syn && !self.ack
    }

    /// Exactly SYN|ACK and nothing else. A segment with, say, SYN|ACK|PSH
    /// does not qualify.
    pub fn is_syn_ack(&self) -> bool {
        self.syn
            && self.ack
            && !self.fin
            && !self.rst
            && !self.psh
            && !self.urg
            && !self.ece
            && !self.cwr
    }
}

/// One frame of a loaded capture, reduced to the fields the analysis reads.
///
/// Records are immutable after the loader emits them and stay in on-disk
/// order; the engine never re-sorts by timestamp.
#[derive(Clone, Debug)]
pub struct PacketRecord {
    /// Capture timestamp in seconds since the epoch. Capture order, not
    /// guaranteed monotonic.
    pub timestamp: f64,
    /// Captured length of the frame in bytes.
    pub wire_len: u32,
    pub layers: LayerSet,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<TcpFlags>,
}

impl PacketRecord {
    /// True when either end of the conversation uses the given port.
    pub fn port_in_use(&self, port: u16) -> bool {
        self.src_port == Some(port) || self.dst_port == Some(port)
    }
}

/// Aggregate counts over a whole capture.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub total_packets: u64,
    /// Seconds between the first and last frame, rounded to two decimals.
    /// 0.0 for captures of zero or one packets.
    pub duration: f64,
    pub unique_ips: usize,
    pub total_bytes: u64,
}

/// Tally-label to packet-count map. Every packet is counted exactly once.
pub type ProtocolTally = BTreeMap<String, u64>;

/// A source endpoint ranked by the packets it originated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TopTalker {
    pub endpoint: String,
    pub count: u64,
}

/// A single row of the bounded packet preview.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PacketPreview {
    /// Seconds since the first packet of the capture, rounded to three
    /// decimals.
    pub relative_time: f64,
    pub source: String,
    pub destination: String,
    /// Display label, which may differ from the tally label (a DNS query
    /// tallies as UDP but previews as DNS).
    pub protocol: &'static str,
    pub size_bytes: u32,
}

/// Ordinal alert classification for downstream triage ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Capitalised form used by the threats document's overall level.
    pub fn level_name(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        write!(f, "{name}")
    }
}

/// Evidence payload attached to an [Alert], one shape per detector.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Evidence {
    SynFlood {
        syn_count: u64,
        syn_ack_count: u64,
        ack_ratio: f64,
        unique_targets: usize,
    },
    PortScan {
        distinct_ports: usize,
        distinct_hosts: usize,
    },
    VolumeAnomaly {
        target: String,
        packets: u64,
        bytes: u64,
    },
    Reputation {
        abuse_confidence: u8,
        total_reports: u32,
    },
}

/// A single detector finding about one source.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub detector: &'static str,
    pub source: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub evidence: Evidence,
}

/// Metadata about the analysed upload.
///
/// `size_bytes` is the sum of captured frame lengths, not the raw container
/// size, so it always agrees with [CaptureSummary] `total_bytes`.
#[derive(Clone, Debug, Serialize)]
pub struct FileMeta {
    pub name: String,
    pub size_bytes: u64,
    /// MD5 fingerprint of the raw upload bytes.
    pub md5: String,
}

/// Everything one analysis run produces. Built once, never mutated, never
/// shared across runs.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisResult {
    pub file: FileMeta,
    pub basic_stats: CaptureSummary,
    pub protocol_stats: ProtocolTally,
    pub top_talkers: Vec<TopTalker>,
    pub packet_details: Vec<PacketPreview>,
    pub alerts: Vec<Alert>,
}

/// Document shape the persistence collaborator stores in its analyses
/// collection.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisDocument {
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub basic_stats: CaptureSummary,
    pub protocol_stats: ProtocolTally,
    pub top_talkers: Vec<TopTalker>,
    pub packet_details: Vec<PacketPreview>,
}

impl AnalysisDocument {
    pub fn new(result: &AnalysisResult, timestamp: DateTime<Utc>) -> Self {
        Self {
            filename: result.file.name.clone(),
            timestamp,
            basic_stats: result.basic_stats.clone(),
            protocol_stats: result.protocol_stats.clone(),
            top_talkers: result.top_talkers.clone(),
            packet_details: result.packet_details.clone(),
        }
    }
}

/// Rolled-up alert counts carried at the head of the threats document.
#[derive(Clone, Debug, Serialize)]
pub struct ThreatSummary {
    pub total_alerts: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Highest severity present, or "None" for a clean capture.
    pub overall_threat_level: &'static str,
}

/// Document shape the persistence collaborator stores in its threats
/// collection.
#[derive(Clone, Debug, Serialize)]
pub struct ThreatsDocument {
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub threat_summary: ThreatSummary,
    pub syn_flood_detection: Vec<Value>,
    pub port_scan_detection: Vec<Value>,
    pub volume_anomaly_detection: Vec<Value>,
    pub abuseipdb_results: Vec<Value>,
}

impl ThreatsDocument {
    pub fn new(result: &AnalysisResult, timestamp: DateTime<Utc>) -> Self {
        let mut high = 0;
        let mut medium = 0;
        let mut low = 0;
        let mut syn_flood = Vec::new();
        let mut port_scan = Vec::new();
        let mut volume = Vec::new();
        let mut reputation = Vec::new();

        for alert in &result.alerts {
            match alert.severity {
                Severity::High => high += 1,
                Severity::Medium => medium += 1,
                Severity::Low => low += 1,
            }
            let doc = alert_document(alert);
            match alert.detector {
                "syn_flood" => syn_flood.push(doc),
                "port_scan" => port_scan.push(doc),
                "volume_anomaly" => volume.push(doc),
                "abuseipdb" => reputation.push(doc),
                other => log::warn!("Alert from unmapped detector {other} left out of threats document"),
            }
        }

        let overall = if high > 0 {
            Severity::High.level_name()
        } else if medium > 0 {
            Severity::Medium.level_name()
        } else if low > 0 {
            Severity::Low.level_name()
        } else {
            "None"
        };

        Self {
            filename: result.file.name.clone(),
            timestamp,
            threat_summary: ThreatSummary {
                total_alerts: result.alerts.len(),
                high,
                medium,
                low,
                overall_threat_level: overall,
            },
            syn_flood_detection: syn_flood,
            port_scan_detection: port_scan,
            volume_anomaly_detection: volume,
            abuseipdb_results: reputation,
        }
    }
}

/// Flattens an alert into the per-detector document rows: the evidence
/// fields alongside `source_ip` and `severity`.
fn alert_document(alert: &Alert) -> Value {
    let mut doc = match serde_json::to_value(&alert.evidence) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    doc.insert("source_ip".to_string(), Value::String(alert.source.clone()));
    doc.insert("severity".to_string(), json!(alert.severity));
    Value::Object(doc)
}

/// Round to two decimal places. Summary durations and alert ratios report at
/// this precision.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to three decimal places, the precision of preview relative times.
pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_ack_must_be_exact() {
        let mut flags = TcpFlags {
            syn: true,
            ack: true,
            ..TcpFlags::default()
        };
        assert!(flags.is_syn_ack());
        assert!(!flags.is_bare_syn());

        flags.psh = true;
        assert!(!flags.is_syn_ack());
    }

    #[test]
    fn bare_syn_requires_ack_clear() {
        let flags = TcpFlags {
            syn: true,
            ..TcpFlags::default()
        };
        assert!(flags.is_bare_syn());

        let flags = TcpFlags {
            syn: true,
            ack: true,
            ..TcpFlags::default()
        };
        assert!(!flags.is_bare_syn());
    }

    #[test]
    fn severity_orders_for_triage() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::High.to_string(), "high");
        assert_eq!(Severity::High.level_name(), "High");
    }

    #[test]
    fn alert_serializes_with_flattened_evidence() {
        let alert = Alert {
            detector: "syn_flood",
            source: "10.0.0.9".to_string(),
            severity: Severity::Medium,
            evidence: Evidence::SynFlood {
                syn_count: 12,
                syn_ack_count: 0,
                ack_ratio: 0.0,
                unique_targets: 12,
            },
        };

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["detector"], "syn_flood");
        assert_eq!(value["source"], "10.0.0.9");
        assert_eq!(value["severity"], "medium");
        assert_eq!(value["syn_count"], 12);
        assert_eq!(value["unique_targets"], 12);
    }

    #[test]
    fn analysis_document_carries_the_collection_keys() {
        let result = AnalysisResult {
            file: FileMeta {
                name: "trace.pcap".to_string(),
                size_bytes: 120,
                md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            },
            basic_stats: CaptureSummary {
                total_packets: 2,
                duration: 0.5,
                unique_ips: 2,
                total_bytes: 120,
            },
            protocol_stats: ProtocolTally::from([("TCP".to_string(), 2)]),
            top_talkers: vec![TopTalker {
                endpoint: "10.0.0.1".to_string(),
                count: 2,
            }],
            packet_details: Vec::new(),
            alerts: Vec::new(),
        };

        let value = serde_json::to_value(AnalysisDocument::new(&result, Utc::now())).unwrap();
        assert_eq!(value["filename"], "trace.pcap");
        assert_eq!(value["basic_stats"]["total_packets"], 2);
        assert_eq!(value["protocol_stats"]["TCP"], 2);
        assert_eq!(value["top_talkers"][0]["endpoint"], "10.0.0.1");
        assert!(value["packet_details"].is_array());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn threats_document_partitions_by_detector() {
        let result = AnalysisResult {
            file: FileMeta {
                name: "flood.pcap".to_string(),
                size_bytes: 720,
                md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            },
            basic_stats: CaptureSummary {
                total_packets: 12,
                duration: 1.1,
                unique_ips: 13,
                total_bytes: 720,
            },
            protocol_stats: ProtocolTally::new(),
            top_talkers: Vec::new(),
            packet_details: Vec::new(),
            alerts: vec![Alert {
                detector: "syn_flood",
                source: "10.0.0.9".to_string(),
                severity: Severity::High,
                evidence: Evidence::SynFlood {
                    syn_count: 60,
                    syn_ack_count: 1,
                    ack_ratio: 0.02,
                    unique_targets: 60,
                },
            }],
        };

        let doc = ThreatsDocument::new(&result, Utc::now());
        assert_eq!(doc.filename, "flood.pcap");
        assert_eq!(doc.threat_summary.total_alerts, 1);
        assert_eq!(doc.threat_summary.high, 1);
        assert_eq!(doc.threat_summary.overall_threat_level, "High");
        assert_eq!(doc.syn_flood_detection.len(), 1);
        assert!(doc.port_scan_detection.is_empty());
        assert_eq!(doc.syn_flood_detection[0]["source_ip"], "10.0.0.9");
        assert_eq!(doc.syn_flood_detection[0]["syn_count"], 60);
        assert_eq!(doc.syn_flood_detection[0]["severity"], "high");
    }
}
