use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

use crate::error::ScanError;

/// One validated line of an uploaded range list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeEntry {
    /// `10.0.0.0/8`. Host bits are allowed and kept.
    Cidr(IpNet),
    /// `10.0.0.1-10.0.0.9`. Ordering of the two ends is not checked.
    Span(IpAddr, IpAddr),
    Single(IpAddr),
}

impl fmt::Display for RangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeEntry::Cidr(net) => write!(f, "{net}"),
            RangeEntry::Span(start, end) => write!(f, "{start}-{end}"),
            RangeEntry::Single(ip) => write!(f, "{ip}"),
        }
    }
}

/// Validate a single range expression: CIDR, dashed address pair, or a bare address.
pub fn validate_range_line(text: &str) -> Result<RangeEntry, ScanError> {
    let line = text.trim();
    let reject = || ScanError::InvalidRangeFormat(line.to_string());

    if line.contains('/') {
        return line.parse::<IpNet>().map(RangeEntry::Cidr).map_err(|_| reject());
    }

    if let Some((a, b)) = line.split_once('-') {
        let start: IpAddr = a.trim().parse().map_err(|_| reject())?;
        let end: IpAddr = b.trim().parse().map_err(|_| reject())?;
        if start.is_ipv4() != end.is_ipv4() {
            return Err(reject());
        }
        return Ok(RangeEntry::Span(start, end));
    }

    line.parse::<IpAddr>().map(RangeEntry::Single).map_err(|_| reject())
}

/// Validate a whole uploaded list, preserving file order.
///
/// Blank lines are skipped. A list without any entry is `EmptyFile`; the first
/// invalid line rejects the whole list.
pub fn parse_range_list(content: &str) -> Result<Vec<RangeEntry>, ScanError> {
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(validate_range_line(line)?);
    }
    if entries.is_empty() {
        return Err(ScanError::EmptyFile);
    }
    Ok(entries)
}
