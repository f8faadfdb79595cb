use std::collections::BTreeSet;

use crate::error::ScanError;

/// Parse an operator port spec into a set of TCP ports (1..=65535).
///
/// Supported segments, separated by commas:
/// - single port number: `80`
/// - inclusive range: `8000-8010` (start must not exceed end)
///
/// Whitespace around segments is ignored. Any bad segment rejects the whole spec.
pub fn parse_port_spec(spec: &str) -> Result<BTreeSet<u16>, ScanError> {
    let mut out = BTreeSet::new();

    for raw in spec.split(',') {
        let segment = raw.trim();
        let reject = || ScanError::InvalidPortFormat(segment.to_string());

        if let Some((a, b)) = segment.split_once('-') {
            let start = parse_port_str(a.trim()).ok_or_else(reject)?;
            let end = parse_port_str(b.trim()).ok_or_else(reject)?;
            if start > end {
                return Err(reject());
            }
            out.extend(start..=end);
            continue;
        }

        out.insert(parse_port_str(segment).ok_or_else(reject)?);
    }

    Ok(out)
}

/// `22, 80, 443` for messages shown to the operator.
pub fn display_ports(ports: &BTreeSet<u16>) -> String {
    join_ports(ports, ", ")
}

/// `22,80,443` for the engine's `-p` argument and the progress text.
pub fn engine_ports(ports: &BTreeSet<u16>) -> String {
    join_ports(ports, ",")
}

fn join_ports(ports: &BTreeSet<u16>, sep: &str) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

fn parse_port_str(s: &str) -> Option<u16> {
    let val: u32 = s.parse().ok()?;
    if val == 0 || val > 65535 {
        return None;
    }
    Some(val as u16)
}
