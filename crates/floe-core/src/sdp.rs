//! SDP inspection: remote-address extraction and local-candidate stripping.
//!
//! Both operations are line-oriented over the SDP text. Extraction prefers
//! ICE candidate attributes (RFC 5245 §15.1) and falls back to the
//! connection-data line (RFC 4566 §5.7) matched by two permissive regexes.
//! The regexes are part of the wire contract with peers that emit
//! non-canonical SDP and must not be altered.

use std::net::{IpAddr, Ipv6Addr};

use once_cell::sync::Lazy;
use regex::Regex;

static REMOTE_IP_PATTERNS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        /* IPv4 */
        Regex::new(r"(?m)^c=IN IP4 ([\d.]+)(?:(?:\/\d+)?\/\d+)?(:? |\r?\n)").unwrap(),
        /* IPv6 */
        Regex::new(r"(?m)^c=IN IP6 ([0-9A-Fa-f:.]+)(?:\/\d+)?(:? |\r?\n)").unwrap(),
    ]
});

/// Whether an address belongs to the host's local networks: RFC 1918 and
/// link-local IPv4 ranges, or unique-local / link-local IPv6 ranges.
pub fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => is_unique_local_v6(v6) || is_link_local_v6(v6),
    }
}

// fc00::/7
fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xfe00 == 0xfc00
}

// fe80::/10
fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// Whether an address is usable as the client's remote address.
pub fn is_remote_address(ip: IpAddr) -> bool {
    !(is_local(ip) || ip.is_unspecified() || ip.is_loopback())
}

/// Connection address of an `a=candidate` attribute line, if this is one.
///
/// `a=candidate:<foundation> <component> <transport> <priority> <addr> <port> typ ...`
fn candidate_address(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix("a=candidate:")?;
    rest.split_whitespace().nth(4)
}

/// Extract the client's remote IP from an SDP document.
///
/// Candidate attributes win; the `c=` line is consulted only when no
/// candidate yields a remote address.
pub fn remote_ip_from_sdp(sdp: &str) -> Option<IpAddr> {
    for line in sdp.lines() {
        if let Some(addr) = candidate_address(line) {
            if let Ok(ip) = addr.parse::<IpAddr>() {
                if is_remote_address(ip) {
                    return Some(ip);
                }
            }
        }
    }
    for pattern in REMOTE_IP_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(sdp) {
            // Ignore parse failures, the next pattern may still match.
            if let Ok(ip) = caps[1].parse::<IpAddr>() {
                if is_remote_address(ip) {
                    return Some(ip);
                }
            }
        }
    }
    None
}

/// Remove candidate lines that advertise local addresses, producing an SDP
/// safe to publish. Non-candidate lines and the media/session layout pass
/// through untouched, line terminators included.
pub fn strip_local_addresses(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for segment in sdp.split_inclusive('\n') {
        if let Some(addr) = candidate_address(segment) {
            if let Ok(ip) = addr.parse::<IpAddr>() {
                if is_local(ip) {
                    continue;
                }
            }
        }
        out.push_str(segment);
    }
    out
}
