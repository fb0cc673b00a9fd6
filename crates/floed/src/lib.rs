//! floed — the volunteer proxy daemon's session engine.
//!
//! The supervisor acquires a capacity token, polls the rendezvous broker
//! for a client offer, negotiates a WebRTC session, and bridges the data
//! channel to the relay WebSocket until either side goes away.

pub mod bridge;
pub mod broker;
pub mod peer;
pub mod relay;
pub mod supervisor;
