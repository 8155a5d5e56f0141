//! Engine entry points and result assembly.
//!
//! An [Analyser] is an explicitly constructed context: resource ceilings,
//! the detector roster, the reputation collaborator and the one-time
//! capture-capability probe. Every analysis invocation is synchronous and
//! self-contained; nothing is shared between runs.

use super::aggregate;
use super::containers::{AnalysisResult, FileMeta, PacketRecord};
use super::errors::{AnalysisError, Result};
use super::scan::{
    Detector, NullReputationClient, PortScanDetector, ReputationClient, ReputationDetector,
    SynFloodDetector, VolumeAnomalyDetector,
};
#[cfg(feature = "capture")]
use super::utils;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hard ceilings applied to an upload before it is fully materialized.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Most container bytes an analysis will read.
    pub max_bytes: u64,
    /// Most packet records an analysis will hold.
    pub max_packets: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_packets: 1_000_000,
        }
    }
}

/// Cooperative cancellation flag checked at packet-record granularity.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Whether this build can parse capture containers at all.
///
/// Probed once at construction and reported as explicit state, so a missing
/// backend degrades the readiness probe instead of failing mid-request.
#[derive(Clone, Debug, Serialize)]
pub struct Capability {
    pub available: bool,
    pub detail: &'static str,
}

pub fn probe_capability() -> Capability {
    #[cfg(feature = "capture")]
    {
        Capability {
            available: true,
            detail: "pcap/pcapng parsing compiled in",
        }
    }
    #[cfg(not(feature = "capture"))]
    {
        Capability {
            available: false,
            detail: "built without the capture feature",
        }
    }
}

/// Pre-parse validation applied at the upload boundary.
///
/// Pass `None` as the size when it is not yet known.
pub fn validate_upload(filename: &str, size: Option<u64>) -> Result<()> {
    let lower = filename.to_ascii_lowercase();
    if !(lower.ends_with(".pcap") || lower.ends_with(".pcapng")) {
        return Err(AnalysisError::InvalidInput(
            "expected a .pcap or .pcapng upload".to_string(),
        ));
    }
    if size == Some(0) {
        return Err(AnalysisError::InvalidInput("empty capture upload".to_string()));
    }
    Ok(())
}

/// One analysis engine instance.
pub struct Analyser {
    limits: Limits,
    capability: Capability,
    detectors: Vec<Box<dyn Detector + Send + Sync>>,
    reputation: ReputationDetector,
}

impl Analyser {
    /// Builds an engine with the default detector roster.
    pub fn new(limits: Limits) -> Self {
        let capability = probe_capability();
        if !capability.available {
            log::warn!("Capture parsing unavailable: {}", capability.detail);
        }
        Self {
            limits,
            capability,
            detectors: vec![
                Box::new(SynFloodDetector::new()),
                Box::new(PortScanDetector),
                Box::new(VolumeAnomalyDetector),
            ],
            reputation: ReputationDetector::new(Box::new(NullReputationClient)),
        }
    }

    /// Swaps in a reputation collaborator.
    pub fn with_reputation(mut self, client: Box<dyn ReputationClient + Send + Sync>) -> Self {
        self.reputation = ReputationDetector::new(client);
        self
    }

    /// Replaces the detector roster.
    pub fn with_detectors(mut self, detectors: Vec<Box<dyn Detector + Send + Sync>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Validates and analyses a capture file on disk.
    pub fn analyse_file(&self, path: &Path) -> Result<AnalysisResult> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        validate_upload(&name, None)?;
        let metadata = std::fs::metadata(path)?;
        validate_upload(&name, Some(metadata.len()))?;

        log::info!("Analysing capture file {name}.");
        let file = File::open(path)?;
        self.analyse_reader(&name, BufReader::new(file), &CancelToken::default())
    }

    /// Analyses a capture byte stream, e.g. an upload body at the boundary.
    ///
    /// A loader failure aborts the run; no partial result is ever returned
    /// for a corrupt capture.
    pub fn analyse_reader<R: Read + Send>(
        &self,
        name: &str,
        reader: R,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult> {
        if !self.capability.available {
            return Err(AnalysisError::DependencyUnavailable(
                self.capability.detail.to_string(),
            ));
        }

        #[cfg(feature = "capture")]
        {
            let loaded = utils::load_records(reader, &self.limits, cancel)?;
            Ok(self.analyse_records(name, &loaded.records, loaded.md5))
        }
        #[cfg(not(feature = "capture"))]
        {
            let _ = (name, reader, cancel);
            Err(AnalysisError::DependencyUnavailable(
                self.capability.detail.to_string(),
            ))
        }
    }

    /// Aggregates and runs every detector over already-loaded records, then
    /// assembles the immutable result.
    ///
    /// A detector failure is isolated: it is logged, contributes no alerts
    /// and aborts nothing else.
    pub fn analyse_records(&self, name: &str, records: &[PacketRecord], md5: String) -> AnalysisResult {
        let aggregate = aggregate::aggregate(records);

        let mut alerts = Vec::new();
        for detector in &self.detectors {
            match detector.detect(records) {
                Ok(mut found) => {
                    log::debug!("Detector {} produced {} alert(s).", detector.name(), found.len());
                    alerts.append(&mut found);
                }
                Err(err) => {
                    log::warn!(
                        "Detector {} failed: {err}; it contributes no alerts.",
                        detector.name()
                    );
                }
            }
        }
        let mut enrichment = self.reputation.enrich(&alerts);
        alerts.append(&mut enrichment);

        // File size reports the summed frame bytes, so the file metadata and
        // the summary can never disagree.
        let file = FileMeta {
            name: name.to_string(),
            size_bytes: aggregate.summary.total_bytes,
            md5,
        };

        AnalysisResult {
            file,
            basic_stats: aggregate.summary,
            protocol_stats: aggregate.protocol_stats,
            top_talkers: aggregate.top_talkers,
            packet_details: aggregate.packet_details,
            alerts,
        }
    }
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}
