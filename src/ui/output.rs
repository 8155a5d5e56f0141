use crate::analyser::containers::{AnalysisDocument, AnalysisResult, Severity, ThreatsDocument};
use ansi_term::Colour;
use chrono::Utc;
use std::fs;
use std::path::Path;

pub fn print_results(result: &AnalysisResult) {
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Results");
    print_summary(result);
    print_protocols(result);
    print_talkers(result);
    print_alerts(result);
}

pub fn print_summary(result: &AnalysisResult) {
    println!("\u{2503}");
    println!("\u{2503} File             : {}", Colour::Red.paint(&result.file.name));
    println!("\u{2503} MD5              : {}", Colour::Fixed(226).paint(&result.file.md5));
    println!("\u{2503} Packets          : {}", Colour::Fixed(226).paint(result.basic_stats.total_packets.to_string()));
    println!("\u{2503} Duration         : {}s", Colour::Fixed(226).paint(result.basic_stats.duration.to_string()));
    println!("\u{2503} Unique IPs       : {}", Colour::Fixed(226).paint(result.basic_stats.unique_ips.to_string()));
    println!("\u{2503} Total bytes      : {}", Colour::Fixed(226).paint(result.basic_stats.total_bytes.to_string()));
    println!("\u{2503} ");
}

pub fn print_protocols(result: &AnalysisResult) {
    for (label, count) in &result.protocol_stats {
        println!("\u{2503} {label:<16} : {count}");
    }
    println!("\u{2503} ");
}

pub fn print_talkers(result: &AnalysisResult) {
    for talker in &result.top_talkers {
        println!("\u{2503} {:<16} : {} packets", talker.endpoint, talker.count);
    }
    println!("\u{2503} ");
}

pub fn print_alerts(result: &AnalysisResult) {
    if result.alerts.is_empty() {
        println!("\u{2503} No alerts.");
        return;
    }
    for alert in &result.alerts {
        println!(
            "\u{2503} [{}] {} from {}",
            severity_colour(alert.severity).paint(alert.severity.to_string()),
            alert.detector,
            alert.source,
        );
    }
}

fn severity_colour(severity: Severity) -> Colour {
    match severity {
        Severity::High => Colour::Red,
        Severity::Medium => Colour::Fixed(226),
        Severity::Low => Colour::Green,
    }
}

pub fn data_as_json(result: &AnalysisResult) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(result)
}

pub fn data_to_file(json: String, path: &Path) -> std::io::Result<()> {
    fs::write(path, json)
}

/// Writes the two persistence document shapes next to each other in `dir`:
/// `analysis.json` for the analyses collection and `threats.json` for the
/// threats collection.
pub fn save_documents(result: &AnalysisResult, dir: &Path) -> std::io::Result<()> {
    let now = Utc::now();
    let analysis = AnalysisDocument::new(result, now);
    let threats = ThreatsDocument::new(result, now);

    fs::write(dir.join("analysis.json"), serde_json::to_string_pretty(&analysis)?)?;
    fs::write(dir.join("threats.json"), serde_json::to_string_pretty(&threats)?)?;
    Ok(())
}
