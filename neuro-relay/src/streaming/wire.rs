//! Line protocol parsing and formatting
//!
//! # Protocol Specification
//!
//! Every message in either direction is one ASCII line terminated by CRLF.
//! Receivers also accept a bare LF.
//!
//! ## Commands (client → broker)
//!
//! | Line | Meaning |
//! |------|---------|
//! | `eeg` | Declare the connection a source |
//! | `display` | Declare the connection a subscriber |
//! | `role` | Ask for the current role |
//! | `status` | List connected clients |
//! | `getheader <id>` | Fetch the header of source `<id>` |
//! | `setheader <text>` | Set own header (rest of the line, verbatim) |
//! | `watch <id>` | Subscribe to source `<id>` |
//! | `unwatch <id>` | Unsubscribe from source `<id>` |
//! | `! <seq> <n> <v1> … <vn>` | One tick of `n` channels from a source |
//!
//! ## Responses (broker → client)
//!
//! ```text
//! 200 OK\r\n                                  success
//! 200 OK\r\n<header>\r\n                      getheader
//! 200 OK\r\n<N> clients connected\r\n<id>:<role>\r\n...   status
//! 400 BAD REQUEST\r\n                         failure
//! <role>\r\n                                  role
//! ```
//!
//! ## Sample broadcast (broker → subscriber)
//!
//! ```text
//! ! <sourceId> <seq> <n> <v1> … <vn>\r\n
//! ```
//!
//! Values are written with Rust's shortest round-trip float formatting, so
//! parsing a formatted line yields bit-identical values.

use crate::core::types::{ClientId, Role, SampleBatch};
use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Line terminator used for everything the relay writes
pub const LINE_END: &str = "\r\n";

/// Success status line
pub const OK: &str = "200 OK";

/// Failure status line
pub const BAD_REQUEST: &str = "400 BAD REQUEST";

/// Marker that starts every sample line
pub const SAMPLE_MARKER: &str = "!";

/// A parsed client → broker command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `eeg`
    Eeg,
    /// `display`
    Display,
    /// `role`
    Role,
    /// `status`
    Status,
    /// `getheader <id>`
    GetHeader(ClientId),
    /// `setheader <text>`
    SetHeader(String),
    /// `watch <id>`
    Watch(ClientId),
    /// `unwatch <id>`
    Unwatch(ClientId),
    /// `! <seq> <n> <v1> … <vn>` (source id not yet known)
    Sample(SampleBatch),
}

impl Command {
    /// Parse one line (without its terminator)
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();

        if let Some(rest) = line.strip_prefix("setheader") {
            // Header is everything after the single separating whitespace
            let mut chars = rest.chars();
            return match chars.next() {
                Some(c) if c.is_whitespace() => Ok(Command::SetHeader(chars.as_str().to_string())),
                _ => Err(Error::Protocol(format!("malformed setheader: {:?}", line))),
            };
        }

        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else {
            return Err(Error::Protocol("empty line".to_string()));
        };

        let command = match keyword {
            "eeg" => Command::Eeg,
            "display" => Command::Display,
            "role" => Command::Role,
            "status" => Command::Status,
            "getheader" => Command::GetHeader(parse_id(tokens.next(), line)?),
            "watch" => Command::Watch(parse_id(tokens.next(), line)?),
            "unwatch" => Command::Unwatch(parse_id(tokens.next(), line)?),
            SAMPLE_MARKER => {
                let tokens: Vec<&str> = tokens.collect();
                let (sequence, values) = parse_tick(&tokens)?;
                return Ok(Command::Sample(SampleBatch::new(sequence, values)));
            }
            _ => return Err(Error::Protocol(format!("unrecognized command: {:?}", line))),
        };

        if tokens.next().is_some() {
            return Err(Error::Protocol(format!("trailing arguments: {:?}", line)));
        }
        Ok(command)
    }

    /// Format the command as it is sent on the wire (with terminator)
    pub fn to_line(&self) -> String {
        match self {
            Command::Eeg => format!("eeg{LINE_END}"),
            Command::Display => format!("display{LINE_END}"),
            Command::Role => format!("role{LINE_END}"),
            Command::Status => format!("status{LINE_END}"),
            Command::GetHeader(id) => format!("getheader {id}{LINE_END}"),
            Command::SetHeader(text) => format!("setheader {text}{LINE_END}"),
            Command::Watch(id) => format!("watch {id}{LINE_END}"),
            Command::Unwatch(id) => format!("unwatch {id}{LINE_END}"),
            Command::Sample(batch) => format_source_line(batch),
        }
    }
}

fn parse_id(token: Option<&str>, line: &str) -> Result<ClientId> {
    token
        .and_then(|t| t.parse::<ClientId>().ok())
        .ok_or_else(|| Error::Protocol(format!("missing or invalid client id: {:?}", line)))
}

/// Parse `<seq> <n> <v1> … <vn>`
fn parse_tick(tokens: &[&str]) -> Result<(u64, Vec<f64>)> {
    let [seq, count, values @ ..] = tokens else {
        return Err(Error::Protocol("sample line too short".to_string()));
    };
    let sequence: u64 = seq
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid sequence number: {:?}", seq)))?;
    let count: usize = count
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid channel count: {:?}", count)))?;
    if count == 0 {
        return Err(Error::Protocol("channel count must be at least 1".to_string()));
    }
    if values.len() != count {
        return Err(Error::Protocol(format!(
            "sample line announces {} channels but carries {} values",
            count,
            values.len()
        )));
    }
    let values = values
        .iter()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| Error::Protocol(format!("invalid sample value: {:?}", v)))
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok((sequence, values))
}

fn push_values(out: &mut String, values: &[f64]) {
    for value in values {
        // Writing to a String cannot fail
        let _ = write!(out, " {}", value);
    }
}

/// Format a tick as a source sends it: `! <seq> <n> <v1> … <vn>\r\n`
pub fn format_source_line(batch: &SampleBatch) -> String {
    let mut out = String::with_capacity(16 + batch.values.len() * 8);
    let _ = write!(
        out,
        "{} {} {}",
        SAMPLE_MARKER,
        batch.sequence,
        batch.channel_count()
    );
    push_values(&mut out, &batch.values);
    out.push_str(LINE_END);
    out
}

/// Format a tick as the broker broadcasts it: `! <id> <seq> <n> <v1> … <vn>\r\n`
pub fn format_broadcast_line(batch: &SampleBatch) -> String {
    let mut out = String::with_capacity(24 + batch.values.len() * 8);
    let _ = write!(
        out,
        "{} {} {} {}",
        SAMPLE_MARKER,
        batch.source_id,
        batch.sequence,
        batch.channel_count()
    );
    push_values(&mut out, &batch.values);
    out.push_str(LINE_END);
    out
}

/// True if the line looks like a sample line (`!` followed by whitespace)
#[inline]
pub fn is_sample_line(line: &str) -> bool {
    line.split_whitespace().next() == Some(SAMPLE_MARKER)
}

/// Parse a broadcast line back into a stamped batch
pub fn parse_broadcast_line(line: &str) -> Result<SampleBatch> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some(SAMPLE_MARKER) {
        return Err(Error::Protocol(format!("not a sample line: {:?}", line)));
    }
    let source = tokens
        .next()
        .ok_or_else(|| Error::Protocol("sample line too short".to_string()))?;
    let source_id: ClientId = source
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid source id: {:?}", source)))?;
    let rest: Vec<&str> = tokens.collect();
    let (sequence, values) = parse_tick(&rest)?;
    Ok(SampleBatch {
        source_id,
        sequence,
        values,
    })
}

/// Build a reply from its lines, terminating each with CRLF
pub fn reply<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push_str(LINE_END);
    }
    out
}

/// `status` reply body: count line followed by one `id:role` line per client
pub fn format_status(entries: &[(ClientId, Role)]) -> String {
    let mut lines = Vec::with_capacity(entries.len() + 2);
    lines.push(OK.to_string());
    lines.push(format!("{} clients connected", entries.len()));
    lines.extend(entries.iter().map(|(id, role)| format!("{}:{}", id, role)));
    reply(lines)
}

/// Parse the `<N> clients connected` line of a status reply
pub fn parse_status_count(line: &str) -> Result<usize> {
    line.trim()
        .strip_suffix("clients connected")
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| Error::BadResponse(format!("expected client count, got {:?}", line)))
}

/// Parse one `<id>:<role>` entry of a status reply
pub fn parse_status_entry(line: &str) -> Result<(ClientId, Role)> {
    let (id, role) = line
        .trim()
        .split_once(':')
        .ok_or_else(|| Error::BadResponse(format!("expected id:role, got {:?}", line)))?;
    let id = id
        .parse()
        .map_err(|_| Error::BadResponse(format!("invalid client id in {:?}", line)))?;
    let role =
        Role::parse(role).ok_or_else(|| Error::BadResponse(format!("unknown role in {:?}", line)))?;
    Ok((id, role))
}

/// Check that a status line is `200 OK`
pub fn expect_ok(line: &str) -> Result<()> {
    if line.trim_end() == OK {
        Ok(())
    } else {
        Err(Error::BadResponse(line.to_string()))
    }
}
