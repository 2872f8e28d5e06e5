/// Concord Gate - Score text for context failure modes
///
/// Usage: concord-gate [--mitigate] [file]
///
/// Reads the file (or stdin when no file is given), prints the validation
/// report as JSON and, with `--mitigate`, the locally mitigated content.

use concord_agents::{init_tracing, TelemetryConfig};
use concord_core::{MitigateResponse, QualityConfig, ValidateResponse};
use concord_quality::QualityGate;
use serde_json::json;
use std::io::Read;

const USAGE: &str = "Usage: concord-gate [--mitigate] [file]";

fn main() {
    if let Err(e) = init_tracing(&TelemetryConfig::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let mut mitigate = false;
    let mut path: Option<String> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--mitigate" | "-m" => mitigate = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                return;
            }
            flag if flag.starts_with('-') => {
                eprintln!("Unknown option: {}", flag);
                eprintln!("{}", USAGE);
                std::process::exit(2);
            }
            file if path.is_none() => path = Some(file.to_string()),
            extra => {
                eprintln!("Unexpected argument: {}", extra);
                eprintln!("{}", USAGE);
                std::process::exit(2);
            }
        }
    }

    let content = match read_input(path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.as_deref().unwrap_or("stdin"), e);
            std::process::exit(1);
        }
    };

    let gate = QualityGate::new(QualityConfig::from_env());
    let analysis = gate.analyze(&content);
    let mitigation = mitigate.then(|| gate.mitigate_local(&content, &analysis.detections));

    let output = match mitigation {
        Some(report) => json!({
            "validation": ValidateResponse::from(analysis),
            "mitigation": MitigateResponse::from(report),
        }),
        None => json!(ValidateResponse::from(analysis)),
    };

    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("Failed to encode report: {}", e);
            std::process::exit(1);
        }
    }
}

fn read_input(path: Option<&str>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}
