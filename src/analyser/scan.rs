//! Threat detection heuristics.
//!
//! Each detector walks the loaded packet sequence independently and emits
//! zero or more alerts. Detectors are isolated from one another: a failing
//! detector is logged and skipped, it never takes down the aggregation or a
//! sibling detector.

use super::containers::{round2, Alert, Evidence, PacketRecord, Severity};
use super::errors::DetectorError;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

/// A heuristic consuming the packet sequence and producing alerts.
pub trait Detector {
    fn name(&self) -> &'static str;
    fn detect(&self, records: &[PacketRecord]) -> Result<Vec<Alert>, DetectorError>;
}

/// One connection-opening probe observed from a source.
#[derive(Clone, Debug, PartialEq)]
pub struct SynProbe {
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub timestamp: f64,
}

/// SYN activity collected in one pass over the capture.
#[derive(Debug, Default)]
pub struct SynActivity {
    /// Bare-SYN probes grouped by source address.
    pub syn_by_source: HashMap<IpAddr, Vec<SynProbe>>,
    /// How many exact SYN|ACK segments each address received as a
    /// destination.
    pub syn_ack_by_dest: HashMap<IpAddr, u64>,
    /// Sources in order of their first bare SYN, so alert output is
    /// deterministic.
    source_order: Vec<IpAddr>,
}

impl SynActivity {
    /// Collects bare SYNs and exact SYN|ACKs from every packet carrying both
    /// an IP and a TCP layer.
    pub fn collect(records: &[PacketRecord]) -> Self {
        let mut activity = SynActivity::default();

        for record in records {
            if !(record.layers.ip && record.layers.tcp) {
                continue;
            }
            let (Some(src), Some(dst), Some(flags)) =
                (record.src_ip, record.dst_ip, record.tcp_flags)
            else {
                continue;
            };

            if flags.is_bare_syn() {
                if !activity.syn_by_source.contains_key(&src) {
                    activity.source_order.push(src);
                }
                activity.syn_by_source.entry(src).or_default().push(SynProbe {
                    dst_ip: dst,
                    dst_port: record.dst_port.unwrap_or(0),
                    timestamp: record.timestamp,
                });
            } else if flags.is_syn_ack() {
                *activity.syn_ack_by_dest.entry(dst).or_insert(0) += 1;
            }
        }

        activity
    }

    /// Sources in first-seen order.
    pub fn sources(&self) -> &[IpAddr] {
        &self.source_order
    }
}

/// How a source's bare-SYN volume is compared against SYN-ACK volume.
///
/// The shipped strategy is [CrossRole]; swapping in a conversation-matched
/// baseline is an open question for the system owner, not something this
/// module decides.
pub trait AckBaseline {
    fn name(&self) -> &'static str;
    fn syn_ack_count(&self, source: &IpAddr, activity: &SynActivity) -> u64;
}

/// Compares a source's outgoing SYN volume against the SYN-ACK volume that
/// same address received *as a destination* elsewhere in the capture. This is
/// a cross-role comparison, not same-conversation matching.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossRole;

impl AckBaseline for CrossRole {
    fn name(&self) -> &'static str {
        "cross_role"
    }

    fn syn_ack_count(&self, source: &IpAddr, activity: &SynActivity) -> u64 {
        activity.syn_ack_by_dest.get(source).copied().unwrap_or(0)
    }
}

/// Flags sources sending many connection-opening probes that see almost no
/// SYN-ACK traffic under the configured baseline.
pub struct SynFloodDetector {
    baseline: Box<dyn AckBaseline + Send + Sync>,
}

impl SynFloodDetector {
    /// Minimum bare-SYN count before a source is considered at all.
    pub const SYN_COUNT_FLOOR: u64 = 10;
    /// A source alerts only while its ack ratio stays below this.
    pub const ACK_RATIO_CEILING: f64 = 0.2;
    /// Above this SYN count an alert escalates from medium to high.
    pub const HIGH_SEVERITY_FLOOR: u64 = 50;

    pub fn new() -> Self {
        Self {
            baseline: Box::new(CrossRole),
        }
    }

    pub fn with_baseline(baseline: Box<dyn AckBaseline + Send + Sync>) -> Self {
        Self { baseline }
    }
}

impl Default for SynFloodDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for SynFloodDetector {
    fn name(&self) -> &'static str {
        "syn_flood"
    }

    fn detect(&self, records: &[PacketRecord]) -> Result<Vec<Alert>, DetectorError> {
        let activity = SynActivity::collect(records);
        log::debug!(
            "SYN-flood scan: {} sources with bare SYNs, baseline {}.",
            activity.syn_by_source.len(),
            self.baseline.name()
        );

        let mut alerts = Vec::new();
        for source in activity.sources() {
            let probes = &activity.syn_by_source[source];
            let syn_count = probes.len() as u64;
            if syn_count == 0 {
                continue;
            }

            let syn_ack_count = self.baseline.syn_ack_count(source, &activity);
            let ack_ratio = syn_ack_count as f64 / syn_count as f64;
            if syn_count < Self::SYN_COUNT_FLOOR || ack_ratio >= Self::ACK_RATIO_CEILING {
                continue;
            }

            let unique_targets: HashSet<(IpAddr, u16)> = probes
                .iter()
                .map(|probe| (probe.dst_ip, probe.dst_port))
                .collect();
            let severity = if syn_count > Self::HIGH_SEVERITY_FLOOR {
                Severity::High
            } else {
                Severity::Medium
            };

            log::debug!("SYN flood from {source}: {syn_count} SYNs, ratio {ack_ratio:.2}.");
            alerts.push(Alert {
                detector: self.name(),
                source: source.to_string(),
                severity,
                evidence: Evidence::SynFlood {
                    syn_count,
                    syn_ack_count,
                    ack_ratio: round2(ack_ratio),
                    unique_targets: unique_targets.len(),
                },
            });
        }

        Ok(alerts)
    }
}

/// Contract stage for port-scan detection: a source touching an unusually
/// large number of distinct destination ports across few destination hosts.
pub struct PortScanDetector;

impl Detector for PortScanDetector {
    fn name(&self) -> &'static str {
        "port_scan"
    }

    fn detect(&self, _records: &[PacketRecord]) -> Result<Vec<Alert>, DetectorError> {
        // The many-ports/few-hosts thresholds are still being tuned against
        // labelled captures; until they land this stage reports nothing.
        Ok(Vec::new())
    }
}

/// Contract stage for volume anomalies: destination endpoints whose byte or
/// packet volume is an outlier against the capture's own baseline.
pub struct VolumeAnomalyDetector;

impl Detector for VolumeAnomalyDetector {
    fn name(&self) -> &'static str {
        "volume_anomaly"
    }

    fn detect(&self, _records: &[PacketRecord]) -> Result<Vec<Alert>, DetectorError> {
        // Outlier cutoffs are still being tuned against labelled captures;
        // until they land this stage reports nothing.
        Ok(Vec::new())
    }
}

/// What the reputation collaborator knows about an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReputationRecord {
    pub abuse_confidence: u8,
    pub total_reports: u32,
}

/// External reputation collaborator seam.
pub trait ReputationClient {
    fn lookup(&self, ip: &IpAddr) -> Result<Option<ReputationRecord>, DetectorError>;
}

/// Client used when no collaborator is configured; knows nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReputationClient;

impl ReputationClient for NullReputationClient {
    fn lookup(&self, _ip: &IpAddr) -> Result<Option<ReputationRecord>, DetectorError> {
        Ok(None)
    }
}

/// Enriches already-flagged sources with collaborator reputation data.
///
/// Fails open: an unreachable collaborator degrades to no enrichment and
/// never aborts the analysis.
pub struct ReputationDetector {
    client: Box<dyn ReputationClient + Send + Sync>,
}

impl ReputationDetector {
    /// Confidence at or above which an enrichment alert goes out as high.
    pub const HIGH_CONFIDENCE_FLOOR: u8 = 75;
    /// Confidence at or above which an enrichment alert goes out as medium.
    pub const MEDIUM_CONFIDENCE_FLOOR: u8 = 25;

    pub fn new(client: Box<dyn ReputationClient + Send + Sync>) -> Self {
        Self { client }
    }

    pub fn name(&self) -> &'static str {
        "abuseipdb"
    }

    /// Looks up each distinct flagged source once, in alert order.
    pub fn enrich(&self, alerts: &[Alert]) -> Vec<Alert> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut enrichment = Vec::new();

        for alert in alerts {
            if !seen.insert(alert.source.as_str()) {
                continue;
            }
            let Ok(ip) = alert.source.parse::<IpAddr>() else {
                continue;
            };

            match self.client.lookup(&ip) {
                Ok(Some(record)) => {
                    let severity = if record.abuse_confidence >= Self::HIGH_CONFIDENCE_FLOOR {
                        Severity::High
                    } else if record.abuse_confidence >= Self::MEDIUM_CONFIDENCE_FLOOR {
                        Severity::Medium
                    } else {
                        Severity::Low
                    };
                    enrichment.push(Alert {
                        detector: self.name(),
                        source: alert.source.clone(),
                        severity,
                        evidence: Evidence::Reputation {
                            abuse_confidence: record.abuse_confidence,
                            total_reports: record.total_reports,
                        },
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Reputation lookup for {ip} failed: {err}; continuing without enrichment.");
                }
            }
        }

        enrichment
    }
}
