use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::config::EngineOutput;
use crate::types::Discovery;

/// Turns one line of engine stdout into a discovery, if it reports one.
///
/// Lines that do not describe an open port are not errors; they return `None`.
pub trait OutputParser: Send + Sync + std::fmt::Debug {
    fn parse_line(&self, line: &str) -> Option<Discovery>;
}

pub fn parser_for(format: EngineOutput) -> Arc<dyn OutputParser> {
    match format {
        EngineOutput::Text => Arc::new(MasscanTextParser),
        EngineOutput::Ndjson => Arc::new(NdjsonParser),
    }
}

pub const DISCOVERY_MARKER: &str = "Discovered open port";

/// Masscan's console format: `Discovered open port 80/tcp on 10.0.0.1`.
///
/// Tokens are taken by position: the fourth is `port/proto`, the sixth is the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasscanTextParser;

impl OutputParser for MasscanTextParser {
    fn parse_line(&self, line: &str) -> Option<Discovery> {
        let line = line.trim();
        if !line.contains(DISCOVERY_MARKER) {
            return None;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let parsed = parts.get(3).zip(parts.get(5)).and_then(|(port, ip)| {
            let port = port.split('/').next()?.parse::<u16>().ok()?;
            let ip = ip.parse::<IpAddr>().ok()?;
            Some(Discovery { ip, port })
        });
        if parsed.is_none() {
            debug!(line, "marker line with unexpected tokens ignored");
        }
        parsed
    }
}

#[derive(Debug, Deserialize)]
struct NdjsonRecord {
    ip: IpAddr,
    port: u16,
    #[serde(default)]
    data: Option<NdjsonData>,
}

#[derive(Debug, Deserialize)]
struct NdjsonData {
    #[serde(default)]
    status: Option<String>,
}

/// One JSON object per line, as masscan writes with `-oD`.
///
/// Records carrying a `data.status` other than `open` (banners, closed ports) are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NdjsonParser;

impl OutputParser for NdjsonParser {
    fn parse_line(&self, line: &str) -> Option<Discovery> {
        let line = line.trim().trim_end_matches(',');
        if !line.starts_with('{') {
            return None;
        }
        let record: NdjsonRecord = serde_json::from_str(line).ok()?;
        let open = record
            .data
            .and_then(|d| d.status)
            .map_or(true, |status| status == "open");
        open.then_some(Discovery {
            ip: record.ip,
            port: record.port,
        })
    }
}
