//! Keyed probabilistic IP set.
//!
//! A HyperLogLog-style register sketch: each address is hashed with a
//! BLAKE3 key shared across the whole cluster, so dumps from different
//! sinks are comparable while the addresses themselves never reach disk.
//! The dump is the raw register array; consumers merge and estimate
//! offline.

/// log2 of the register count.
const PRECISION: u32 = 12;
const REGISTER_COUNT: usize = 1 << PRECISION;

pub struct IpSetSink {
    key: [u8; 32],
    registers: Vec<u8>,
}

impl IpSetSink {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            key: *key,
            registers: vec![0u8; REGISTER_COUNT],
        }
    }

    /// Record one observed address. Textual form, since that is what the
    /// SDP inspector hands out and normalization is not this layer's job.
    pub fn add_ip(&mut self, ip: &str) {
        let digest = blake3::keyed_hash(&self.key, ip.as_bytes());
        let h = u64::from_be_bytes(digest.as_bytes()[..8].try_into().unwrap());
        let index = (h >> (64 - PRECISION)) as usize;
        let remainder = h << PRECISION;
        let rank = (remainder.leading_zeros() + 1).min(64 - PRECISION + 1) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Serialized form of the current window: the register bytes.
    pub fn dump(&self) -> Vec<u8> {
        self.registers.clone()
    }

    /// Clear the window.
    pub fn reset(&mut self) {
        self.registers.iter_mut().for_each(|r| *r = 0);
    }
}
