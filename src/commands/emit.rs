//! Emit a single PoE record from the command line

use colored::*;
use eyre::Result;
use serde_json::Value;
use std::sync::mpsc;
use std::time::Duration;

use poe::{Config, Emitter, Outcome};

pub fn run(req_id: &str, input: &str, output: &str, url: Option<String>, mut config: Config) -> Result<()> {
    if let Some(url) = url {
        config.sidecar.url = url;
    }

    let input = parse_value(input);
    let output = parse_value(output);

    let (tx, rx) = mpsc::channel();
    let emitter = Emitter::from_config(&config).with_observer(move |_, outcome| {
        let _ = tx.send(outcome.clone());
    });

    println!("{} Emitting PoE for reqId {} to {}", "→".blue(), req_id.cyan(), emitter.url());
    emitter.emit(req_id, &input, &output);

    // The process is about to exit, so give the background send a bounded chance to finish
    let drained = emitter.drain(drain_limit(&config));

    for outcome in rx.try_iter() {
        print_outcome(&outcome);
    }

    if !drained {
        println!("{} Send still in flight, exiting without waiting for it", "⚠".yellow());
    }

    Ok(())
}

/// Parse as JSON, falling back to a JSON string for plain text
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn drain_limit(config: &Config) -> Duration {
    let sidecar = &config.sidecar;
    sidecar.connect_timeout() + sidecar.release_timeout().unwrap_or_else(|| sidecar.deadline()) + Duration::from_millis(500)
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Sent { status } if (200..300).contains(status) => {
            println!("  {} Sidecar accepted the record (status {})", "✓".green(), status);
        }
        Outcome::Sent { status } => {
            println!("  {} Sidecar answered status {}", "⚠".yellow(), status);
        }
        Outcome::TimedOutObserved { deadline } => {
            println!("  {} Still sending after {:?}", "⚠".yellow(), deadline);
        }
        Outcome::ConnectFailed { error } | Outcome::SerializeFailed { error } | Outcome::Unexpected { error } => {
            println!("  {} {}", "✗".red(), error);
        }
    }
}
