//! NAT typing and the startup STUN probe.
//!
//! The probe runs once before the first broker poll and classifies the
//! host's NAT by its filtering behavior (RFC 5780 §4.4): a plain binding
//! round-trip establishes reachability, then a binding request carrying a
//! CHANGE-REQUEST attribute asks the server to reply from its alternate
//! address and port. Hearing that reply means filtering is
//! endpoint-independent; silence means the NAT is restricted.

use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_SUCCESS: u16 = 0x0101;
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const STUN_ATTR_CHANGE_REQUEST: u16 = 0x0003;
// Change both IP and port.
const CHANGE_REQUEST_FLAGS: u32 = 0x0000_0006;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// NAT classification, in the form the rendezvous protocol expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    Unknown,
    Restricted,
    Unrestricted,
}

impl NatType {
    pub fn as_str(self) -> &'static str {
        match self {
            NatType::Unknown => "unknown",
            NatType::Restricted => "restricted",
            NatType::Unrestricted => "unrestricted",
        }
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("cannot resolve STUN server {0}")]
    Unresolvable(String),
    #[error("no response from STUN server")]
    NoResponse,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn build_binding_request(transaction_id: &[u8; 12], change_request: bool) -> Vec<u8> {
    let attr_len: u16 = if change_request { 8 } else { 0 };
    let mut msg = Vec::with_capacity(20 + attr_len as usize);
    msg.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&attr_len.to_be_bytes());
    msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    if change_request {
        msg.extend_from_slice(&STUN_ATTR_CHANGE_REQUEST.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&CHANGE_REQUEST_FLAGS.to_be_bytes());
    }
    msg
}

fn is_binding_success(packet: &[u8], transaction_id: &[u8; 12]) -> bool {
    packet.len() >= 20
        && u16::from_be_bytes([packet[0], packet[1]]) == STUN_BINDING_SUCCESS
        && u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]) == STUN_MAGIC_COOKIE
        && &packet[8..20] == transaction_id
}

/// Probe the given STUN server (`host:port`) and report whether the host
/// sits behind a NAT with address/port-dependent filtering.
pub async fn check_if_restricted_nat(addr: &str) -> Result<bool, NatError> {
    let server = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| NatError::Unresolvable(addr.to_string()))?;

    // Unconnected socket: the change-request reply arrives from the
    // server's alternate address and a connected socket would drop it.
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut buf = [0u8; 1500];

    // Plain binding round-trip first, to know the server is there at all.
    let mut txid = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut txid);
    socket
        .send_to(&build_binding_request(&txid, false), server)
        .await?;
    loop {
        let (len, _) = timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NatError::NoResponse)??;
        if is_binding_success(&buf[..len], &txid) {
            break;
        }
    }

    // Filtering test: ask for a reply from the alternate address and port.
    let mut txid = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut txid);
    socket
        .send_to(&build_binding_request(&txid, true), server)
        .await?;
    loop {
        match timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(result) => {
                let (len, _) = result?;
                if is_binding_success(&buf[..len], &txid) {
                    return Ok(false);
                }
            }
            // Silence from the alternate address: filtering is restricted.
            Err(_) => return Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings() {
        assert_eq!(NatType::Unknown.as_str(), "unknown");
        assert_eq!(NatType::Restricted.as_str(), "restricted");
        assert_eq!(NatType::Unrestricted.as_str(), "unrestricted");
        assert_eq!(serde_json::to_string(&NatType::Restricted).unwrap(), "\"restricted\"");
    }

    #[test]
    fn binding_request_layout() {
        let txid = [7u8; 12];
        let plain = build_binding_request(&txid, false);
        assert_eq!(plain.len(), 20);
        assert_eq!(u16::from_be_bytes([plain[0], plain[1]]), STUN_BINDING_REQUEST);
        assert_eq!(u16::from_be_bytes([plain[2], plain[3]]), 0);
        assert_eq!(&plain[8..20], &txid);

        let change = build_binding_request(&txid, true);
        assert_eq!(change.len(), 28);
        assert_eq!(u16::from_be_bytes([change[2], change[3]]), 8);
        assert_eq!(u16::from_be_bytes([change[20], change[21]]), STUN_ATTR_CHANGE_REQUEST);
        assert_eq!(
            u32::from_be_bytes([change[24], change[25], change[26], change[27]]),
            CHANGE_REQUEST_FLAGS
        );
    }

    #[test]
    fn response_matching() {
        let txid = [9u8; 12];
        let mut resp = Vec::new();
        resp.extend_from_slice(&STUN_BINDING_SUCCESS.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&txid);
        assert!(is_binding_success(&resp, &txid));
        assert!(!is_binding_success(&resp, &[0u8; 12]));
        assert!(!is_binding_success(&resp[..10], &txid));
    }
}
