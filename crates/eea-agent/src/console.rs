//! Interactive console producer.
//!
//! Accepts `info`, `direct <id> <json>` and `exit` on stdin.

use eea_core::{InboundEvent, Router};
use std::io::BufRead;
use tracing::{info, warn};

const PROMPT: &str = "(info, direct, exit) >";

/// Parse one console line into the event it requests.
pub fn parse_command(line: &str) -> Option<InboundEvent> {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "info" => Some(InboundEvent::StatusRequested),
        "exit" => Some(InboundEvent::Shutdown),
        "direct" => {
            let (trigger_id, payload) = rest.split_once(char::is_whitespace)?;
            Some(InboundEvent::DirectTrigger {
                trigger_id: trigger_id.to_string(),
                payload: payload.trim().to_string(),
            })
        }
        _ => None,
    }
}

/// Read commands from `input` until EOF or `exit`.
pub fn run(input: impl BufRead, router: Router) {
    println!("{}", PROMPT);

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Some(event) => {
                let stop = event == InboundEvent::Shutdown;
                router.notify(event);
                if stop {
                    break;
                }
            }
            None if line.trim_start().starts_with("direct") => {
                warn!("Invalid direct command, expected: direct <direct_id> <json_payload>")
            }
            None => warn!("Unknown command: {}", line.trim()),
        }
        println!("{}", PROMPT);
    }
    info!("Console closed");
}
