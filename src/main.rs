use capsift::analyser::core::{Analyser, Limits};
use capsift::ui::output;
use clap::{ArgAction, Parser};
use std::fs;
use std::path::Path;

/// capsift is a packet-capture forensics tool for traffic statistics and attack signatures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// pcap/pcapng file to analyze
    #[arg(short = 'f', long, value_parser)]
    file: String,

    /// Display output as formatted JSON
    #[arg(short = 'j', long, action = ArgAction::SetTrue)]
    json: bool,

    /// Directory to output the analysis and threats documents
    #[arg(short = 'o', long, value_parser)]
    output_dir: Option<String>,

    /// Packet-count ceiling applied before a capture is fully loaded
    #[arg(long, default_value_t = Limits::default().max_packets, value_parser)]
    max_packets: usize,

    /// Byte ceiling applied before a capture is fully loaded
    #[arg(long, default_value_t = Limits::default().max_bytes, value_parser)]
    max_bytes: u64,
}

fn main() {
    simple_logger::init_with_env().unwrap();

    let args = Args::parse();
    let out;

    if let Some(out_dir) = args.output_dir.as_deref() {
        log::info!("Output directory {out_dir}");
        let _ = fs::create_dir_all(out_dir);
        out = Some(out_dir);
    } else {
        out = None;
    }

    let analyser = Analyser::new(Limits {
        max_bytes: args.max_bytes,
        max_packets: args.max_packets,
    });
    if !analyser.capability().available {
        log::warn!("Capture parsing unavailable: {}", analyser.capability().detail);
    }

    let result = match analyser.analyse_file(Path::new(&args.file)) {
        Ok(result) => result,
        Err(err) => {
            log::error!("Analysis failed: {err}");
            std::process::exit(1);
        }
    };

    // ---- Output ----
    if args.json {
        let json = output::data_as_json(&result);
        if let Some(out_dir) = out {
            let _ = output::data_to_file(json.unwrap(), Path::new(&format!("{out_dir}/analysis_result.json")));
        } else {
            println!("{}", json.unwrap());
        }
    } else {
        output::print_results(&result);
    }

    if let Some(out_dir) = out {
        if let Err(err) = output::save_documents(&result, Path::new(out_dir)) {
            log::error!("Failed writing documents: {err}");
        }
    }
}
