//! Colored terminal output for the demo binary.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;
use serde_json::Value;

use crate::endpoint::{ChannelError, PeerStatus};
use crate::envelope::ReplyEnvelope;
use crate::transport::Link;

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

const DEFAULT_MAX_LEN: usize = 80;

/// Truncate a string to a maximum length, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

/// Render a payload as `key=value` pairs.
#[must_use]
pub fn format_payload(value: &Value) -> String {
    match value {
        Value::Object(map) if map.is_empty() => "{}".to_string(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => truncate(s, 50),
                    other => truncate(&other.to_string(), 50),
                };
                format!("{k}={rendered}")
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => truncate(&other.to_string(), DEFAULT_MAX_LEN),
    }
}

/// Render the responder fields of a reply, without `id` and `success`.
#[must_use]
pub fn format_reply(reply: &ReplyEnvelope) -> String {
    format_payload(&Value::Object(reply.fields().clone()))
}

/// Print that an endpoint is serving.
pub fn print_started(name: &str) {
    println!(
        "{} {} serving as {}",
        timestamp().dimmed(),
        "[START]".blue().bold(),
        name.cyan()
    );
    let _ = io::stdout().flush();
}

/// Print that an endpoint was destroyed.
pub fn print_stopped(name: &str) {
    println!(
        "{} {} {} destroyed",
        timestamp().dimmed(),
        "[STOP]".blue().bold(),
        name.cyan()
    );
    let _ = io::stdout().flush();
}

/// Print an outgoing request.
pub fn print_request(from: &str, to: &str, payload: &Value) {
    println!(
        "{} {} {} -> {} ({})",
        timestamp().dimmed(),
        "[SEND]".cyan().bold(),
        from,
        to.bold(),
        format_payload(payload).dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print a request as seen by its receiver.
pub fn print_inbound(id: &str, sent_by: &str, payload: &Value) {
    println!(
        "{} {} {} from {} ({})",
        timestamp().dimmed(),
        "[RECV]".yellow().bold(),
        truncate(id, 32).dimmed(),
        sent_by.bold(),
        format_payload(payload).dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print a successful reply.
pub fn print_reply(reply: &ReplyEnvelope) {
    println!(
        "{} {} {} {}",
        timestamp().dimmed(),
        "[REPLY]".green().bold(),
        truncate(reply.id(), 32).dimmed(),
        format_reply(reply)
    );
    let _ = io::stdout().flush();
}

/// Print a failed request.
pub fn print_failure(error: &ChannelError) {
    let ts = timestamp();
    match error.reply() {
        Some(reply) if reply.shutdown_reason().is_some() => println!(
            "{} {} {} {}",
            ts.dimmed(),
            "[SHUTDOWN]".magenta().bold(),
            truncate(reply.id(), 32).dimmed(),
            reply.shutdown_reason().unwrap_or_default()
        ),
        Some(reply) => println!(
            "{} {} {} {}",
            ts.dimmed(),
            "[REJECT]".red().bold(),
            truncate(reply.id(), 32).dimmed(),
            format_reply(reply)
        ),
        None => println!("{} {} {}", ts.dimmed(), "[ERROR]".red().bold(), error),
    }
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "[ERROR]".red().bold(), message);
    let _ = io::stdout().flush();
}

/// Print a link state change.
pub fn print_peer(status: PeerStatus, link: &Link) {
    let label = match status {
        PeerStatus::Connected => "[LINK UP]".green().bold().to_string(),
        PeerStatus::Disconnected => "[LINK DOWN]".yellow().bold().to_string(),
        PeerStatus::Destroyed => "[LINK GONE]".red().bold().to_string(),
    };
    println!("{} {} {}", timestamp().dimmed(), label, link);
    let _ = io::stdout().flush();
}
