//! Rendezvous broker client.
//!
//! Stateless wrapper around the broker's HTTP endpoints. The HTTP client
//! is injected at construction so a fingerprint-imitating transport can be
//! swapped in by the front end.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::{sleep, Instant};
use url::Url;

use floe_core::messages::{self, SessionDescription, CLIENT_TYPE_STANDALONE};
use floe_core::nat::NatType;
use floe_core::sdp;

/// Scheduling interval between poll starts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling on broker response bodies.
pub const READ_LIMIT: usize = 100_000;

/// Bound on the whole broker round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker returned {0}")]
    Status(StatusCode),
    #[error("broker returned client timeout")]
    ClientTimeout,
    #[error("response body exceeds {READ_LIMIT} bytes")]
    BodyTooLarge,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Message(#[from] messages::MessageError),
}

pub struct Broker {
    proxy_endpoint: Url,
    answer_endpoint: Url,
    client: reqwest::Client,
    keep_local_addresses: bool,
}

impl Broker {
    /// Fails only on a base URL that cannot carry the endpoint paths; the
    /// front end treats that as a configuration error and exits.
    pub fn new(
        base: &Url,
        client: reqwest::Client,
        keep_local_addresses: bool,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            proxy_endpoint: base.join("proxy")?,
            answer_endpoint: base.join("answer")?,
            client,
            keep_local_addresses,
        })
    }

    /// The transport used when the front end injects nothing special.
    pub fn default_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
    }

    /// Poll the broker until it hands us a client offer.
    ///
    /// Polls are scheduled `POLL_INTERVAL` after the previous poll *start*;
    /// a round-trip slower than the interval is followed immediately by the
    /// next one. Transport errors, non-200 statuses, oversized bodies, and
    /// empty offers all log and poll again. Returns `None` only when a
    /// response decodes to garbage or an offer fails to deserialize.
    pub async fn poll_offer(&self, sid: &str, nat_type: NatType) -> Option<SessionDescription> {
        let mut time_of_next_poll = Instant::now();
        loop {
            // Sleep until we're scheduled to poll again, then move the
            // schedule forward relative to the scheduled start, not the
            // actual one.
            let now = Instant::now();
            if time_of_next_poll > now {
                sleep(time_of_next_poll - now).await;
            }
            time_of_next_poll += POLL_INTERVAL;
            if time_of_next_poll < now {
                time_of_next_poll = now;
            }

            let body = match messages::encode_poll_request(sid, CLIENT_TYPE_STANDALONE, nat_type) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(error = %e, "error encoding poll message");
                    return None;
                }
            };

            let resp = match self
                .client
                .post(self.proxy_endpoint.clone())
                .body(body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, "error polling broker");
                    continue;
                }
            };
            if resp.status() != StatusCode::OK {
                tracing::warn!(status = %resp.status(), "broker returned non-200");
                continue;
            }
            let body = match read_limited(resp).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading broker response");
                    continue;
                }
            };

            let offer = match messages::decode_poll_response(&body) {
                Ok(offer) => offer,
                Err(e) => {
                    tracing::warn!(error = %e, "error decoding broker response");
                    return None;
                }
            };
            if offer.is_empty() {
                continue;
            }
            match SessionDescription::deserialize(&offer) {
                Ok(desc) => return Some(desc),
                Err(e) => {
                    tracing::warn!(error = %e, "error processing session description");
                    return None;
                }
            }
        }
    }

    /// Deliver our answer for the session the broker is holding open.
    /// Host-local candidates are stripped before publishing unless the
    /// operator opted out.
    pub async fn send_answer(
        &self,
        sid: &str,
        local: &SessionDescription,
    ) -> Result<(), BrokerError> {
        let desc = if self.keep_local_addresses {
            local.clone()
        } else {
            SessionDescription {
                kind: local.kind,
                sdp: sdp::strip_local_addresses(&local.sdp),
            }
        };
        let answer = desc.serialize()?;
        let body = messages::encode_answer_request(&answer, sid)?;

        let resp = self
            .client
            .post(self.answer_endpoint.clone())
            .body(body)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(BrokerError::Status(resp.status()));
        }
        let body = read_limited(resp).await?;
        if messages::decode_answer_response(&body)? {
            Ok(())
        } else {
            Err(BrokerError::ClientTimeout)
        }
    }
}

/// Accumulate a response body, refusing to buffer more than `READ_LIMIT`.
async fn read_limited(mut resp: reqwest::Response) -> Result<Vec<u8>, BrokerError> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > READ_LIMIT {
            return Err(BrokerError::BodyTooLarge);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
