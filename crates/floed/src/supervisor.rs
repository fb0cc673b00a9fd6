//! Supervisor: ties the token pool, broker, peer sessions, and bridge
//! together. One token, one session id, one rendezvous at a time; accepted
//! sessions run in their own tasks while the loop goes back to polling.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use floe_core::messages::{SdpKind, SessionDescription};
use floe_core::nat::NatType;
use floe_core::util::gen_session_id;
use floe_sink::ClusterWriter;

use crate::bridge::copy_loop;
use crate::broker::Broker;
use crate::peer::{close_quietly, make_peer_connection, IncomingChannel, PeerConn};
use crate::relay::dial_relay;

/// Deadline from answer sent to data channel open.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(20);

/// Sink name client sightings are recorded under.
pub const CLIENT_SINK: &str = "client-addresses";

/// Everything a session needs, threaded explicitly instead of sitting in
/// module-level globals.
pub struct ProxyContext {
    pub broker: Arc<Broker>,
    pub relay: Url,
    pub stun: String,
    pub nat_type: NatType,
    pub tokens: Arc<Semaphore>,
    pub sightings: Option<Arc<ClusterWriter>>,
    pub unsafe_logging: bool,
}

impl ProxyContext {
    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun.clone()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// Main loop. Session failures never escape; the loop ends only if the
/// token pool itself is torn down.
pub async fn run(ctx: Arc<ProxyContext>) -> Result<()> {
    loop {
        let permit = ctx
            .tokens
            .clone()
            .acquire_owned()
            .await
            .context("token pool closed")?;
        let sid = gen_session_id();
        run_session(Arc::clone(&ctx), permit, sid).await;
    }
}

/// Drive one rendezvous: poll, negotiate, answer, wait for the channel.
///
/// The capacity token travels as an owned permit: failure paths return and
/// drop it here; the success path moves it into the handler task, which
/// holds it until the session ends. Either way it is released exactly once.
pub async fn run_session(ctx: Arc<ProxyContext>, permit: OwnedSemaphorePermit, sid: String) {
    let Some(offer) = ctx.broker.poll_offer(&sid, ctx.nat_type).await else {
        tracing::warn!("bad offer from broker");
        return;
    };

    let (pc, mut incoming) = match make_peer_connection(ctx.rtc_config(), &offer).await {
        Ok(built) => built,
        Err(e) => {
            tracing::warn!(error = %e, "error making WebRTC connection");
            return;
        }
    };

    let local = match pc.local_description().await {
        Some(desc) => SessionDescription {
            kind: SdpKind::Answer,
            sdp: desc.sdp,
        },
        None => {
            tracing::warn!("no local description after ICE gathering");
            close_quietly(&pc).await;
            return;
        }
    };
    if let Err(e) = ctx.broker.send_answer(&sid, &local).await {
        tracing::warn!(error = %e, "error sending answer to client through broker");
        close_quietly(&pc).await;
        return;
    }

    match tokio::time::timeout(DATA_CHANNEL_TIMEOUT, incoming.recv()).await {
        Ok(Some(IncomingChannel { conn, remote_ip })) => {
            tracing::info!("connection successful");
            tokio::spawn(handle_data_channel(ctx, conn, remote_ip, permit));
        }
        Ok(None) | Err(_) => {
            tracing::info!("timed out waiting for client to open data channel");
            close_quietly(&pc).await;
        }
    }
}

/// Run an accepted session: record the sighting, dial the relay, pump
/// bytes until either side goes away.
async fn handle_data_channel(
    ctx: Arc<ProxyContext>,
    conn: PeerConn,
    remote_ip: Option<IpAddr>,
    permit: OwnedSemaphorePermit,
) {
    // Held for the life of the session; the drop frees the slot.
    let _permit = permit;

    match remote_ip {
        Some(ip) => {
            if let Some(sightings) = &ctx.sightings {
                sightings.add_ip_to_set(CLIENT_SINK, &ip.to_string());
            }
            if ctx.unsafe_logging {
                tracing::info!(client_ip = %ip, "client connection");
            }
        }
        None => tracing::info!("no remote address found in offer"),
    }

    let relay = match dial_relay(&ctx.relay, remote_ip).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(error = %e, "error dialing relay");
            conn.closer().close().await;
            return;
        }
    };
    tracing::info!("connected to relay");

    let closer = conn.closer();
    copy_loop(conn, relay).await;
    closer.close().await;
    tracing::debug!("session ended");
}
