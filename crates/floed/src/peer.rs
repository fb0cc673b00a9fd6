//! Peer session: one WebRTC connection, its data channel, and the plumbing
//! that turns the callback-driven API into a byte stream the bridge can
//! pump.
//!
//! Inbound channel messages land in a simplex pipe read by the bridge.
//! Outbound writes go to the data channel, blocking on a send-more gate
//! when the channel's buffered amount crosses the high-water mark. A
//! watchdog closes the session after 30 seconds without an outbound write.
//!
//! The channel callbacks capture only the slots they touch, and the
//! connection handle enters its own callback as a weak reference; the data
//! channel slot is cleared on close. Otherwise the callbacks would pin the
//! connection in a reference cycle it can never leave.

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream, WriteHalf,
};
use tokio::sync::{mpsc, Mutex, Notify};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use floe_core::messages::SessionDescription;
use floe_core::sdp;

/// Data channel high-water mark; writes block past this.
pub const MAX_BUFFERED_AMOUNT: usize = 512 * 1024;
/// Buffered amount at which the channel asks for more.
const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 256 * 1024;
/// Close the session after this long without an outbound write.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
/// Watchdog nudge queue; saturation drops the nudge rather than blocking.
const ACTIVITY_QUEUE: usize = 100;
/// Buffer between the message callback and the bridge's read side.
const PIPE_BUFFER: usize = 64 * 1024;

type DcSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;
type PipeWriterSlot = Arc<Mutex<Option<WriteHalf<SimplexStream>>>>;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid session description: {0}")]
    Description(webrtc::Error),
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
}

/// A data channel that arrived on a peer connection, plus the client
/// address pulled out of the remote description at arrival time. Parsing
/// the address here, inside the callback, avoids touching the remote
/// description from the handler task later.
pub struct IncomingChannel {
    pub conn: PeerConn,
    pub remote_ip: Option<IpAddr>,
}

pub(crate) fn build_api() -> Result<webrtc::api::API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Build a peer connection answering the given offer.
///
/// The returned receiver fires when the client opens its data channel;
/// the supervisor gives up on it after the data-channel deadline. When
/// this returns, ICE gathering has finished and the local description is
/// final, ready to send back through the broker.
pub async fn make_peer_connection(
    config: RTCConfiguration,
    offer: &SessionDescription,
) -> Result<(Arc<RTCPeerConnection>, mpsc::Receiver<IncomingChannel>), PeerError> {
    let api = build_api()?;
    let pc = Arc::new(api.new_peer_connection(config).await?);

    let (conn_tx, conn_rx) = mpsc::channel(1);
    let weak_pc = Arc::downgrade(&pc);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let conn_tx = conn_tx.clone();
        let weak_pc = weak_pc.clone();
        Box::pin(async move {
            let Some(pc) = weak_pc.upgrade() else {
                return;
            };
            tracing::debug!(label = %dc.label(), "data channel arrived");
            let conn = PeerConn::new(Arc::clone(&pc), dc).await;
            let remote_ip = match pc.remote_description().await {
                Some(desc) => sdp::remote_ip_from_sdp(&desc.sdp),
                None => None,
            };
            // The send is the open sentinel the supervisor waits on. A
            // second channel on the same connection has nowhere to go and
            // is dropped.
            let _ = conn_tx.try_send(IncomingChannel { conn, remote_ip });
        })
    }));

    let remote = RTCSessionDescription::offer(offer.sdp.clone()).map_err(PeerError::Description)?;
    if let Err(e) = pc.set_remote_description(remote).await {
        close_quietly(&pc).await;
        return Err(PeerError::Rtc(e));
    }

    let answer = match pc.create_answer(None).await {
        Ok(answer) => answer,
        Err(e) => {
            close_quietly(&pc).await;
            return Err(PeerError::Rtc(e));
        }
    };
    // Wait out ICE gathering so the answer we publish carries its
    // candidates; the broker has no way to trickle them afterwards.
    let mut gather_complete = pc.gathering_complete_promise().await;
    if let Err(e) = pc.set_local_description(answer).await {
        close_quietly(&pc).await;
        return Err(PeerError::Rtc(e));
    }
    let _ = gather_complete.recv().await;

    Ok((pc, conn_rx))
}

pub(crate) async fn close_quietly(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        tracing::warn!(error = %e, "error closing peer connection");
    }
}

struct Shared {
    pc: Arc<RTCPeerConnection>,
    /// Cleared by the channel's close callback; writes afterwards are
    /// silently discarded so the bridge unwinds through its read side.
    dc: DcSlot,
    pipe_writer: PipeWriterSlot,
    activity_tx: mpsc::Sender<()>,
    send_more_rx: Mutex<mpsc::Receiver<()>>,
    cancel_watchdog: Notify,
    closed: AtomicBool,
}

impl Shared {
    /// Idempotent teardown: cancel the watchdog, EOF the pipe, close the
    /// peer connection. Errors are logged, never raised.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_watchdog.notify_one();
        self.dc.lock().await.take();
        self.pipe_writer.lock().await.take();
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "error closing peer connection");
        }
    }

    async fn send(&self, data: Bytes) -> io::Result<usize> {
        // Nudge the watchdog; a full queue just drops the nudge.
        let _ = self.activity_tx.try_send(());
        let len = data.len();
        let dc = self.dc.lock().await.clone();
        if let Some(dc) = dc {
            if let Err(e) = dc.send(&data).await {
                tracing::debug!(error = %e, "data channel send failed");
            }
            if dc.buffered_amount().await >= MAX_BUFFERED_AMOUNT {
                let mut send_more = self.send_more_rx.lock().await;
                let _ = send_more.recv().await;
            }
        }
        // With or without a data channel the write reports the full
        // length; the session ends through the read side, not here.
        Ok(len)
    }
}

async fn watchdog(shared: Arc<Shared>, mut activity_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(INACTIVITY_TIMEOUT) => {
                shared.close().await;
                tracing::info!("closed connection due to inactivity");
                return;
            }
            _ = shared.cancel_watchdog.notified() => return,
            nudge = activity_rx.recv() => {
                // Each nudge re-arms the timer by looping; a closed
                // channel means the conn is gone.
                if nudge.is_none() {
                    return;
                }
            }
        }
    }
}

/// The byte-stream face of one peer session.
pub struct PeerConn {
    shared: Arc<Shared>,
    reader: ReadHalf<SimplexStream>,
    write_fut: Option<Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>>,
    shutdown_fut: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl PeerConn {
    async fn new(pc: Arc<RTCPeerConnection>, dc: Arc<RTCDataChannel>) -> Self {
        let (reader, writer) = tokio::io::simplex(PIPE_BUFFER);
        let (activity_tx, activity_rx) = mpsc::channel(ACTIVITY_QUEUE);
        let (send_more_tx, send_more_rx) = mpsc::channel(1);

        let dc_slot: DcSlot = Arc::new(Mutex::new(Some(Arc::clone(&dc))));
        let pipe_writer: PipeWriterSlot = Arc::new(Mutex::new(Some(writer)));

        let shared = Arc::new(Shared {
            pc,
            dc: Arc::clone(&dc_slot),
            pipe_writer: Arc::clone(&pipe_writer),
            activity_tx,
            send_more_rx: Mutex::new(send_more_rx),
            cancel_watchdog: Notify::new(),
            closed: AtomicBool::new(false),
        });

        dc.on_open(Box::new(|| {
            tracing::debug!("data channel open");
            Box::pin(async {})
        }));

        let msg_writer = Arc::clone(&pipe_writer);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let pipe_writer = Arc::clone(&msg_writer);
            Box::pin(async move {
                let mut writer = pipe_writer.lock().await;
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.write_all(&msg.data).await {
                        // A failed pipe write poisons only this session:
                        // dropping the writer EOFs the bridge's read side.
                        tracing::warn!(error = %e, "failed to pipe data channel message");
                        writer.take();
                    }
                }
            })
        }));

        let close_dc_slot = Arc::clone(&dc_slot);
        let close_writer = Arc::clone(&pipe_writer);
        dc.on_close(Box::new(move || {
            let dc_slot = Arc::clone(&close_dc_slot);
            let pipe_writer = Arc::clone(&close_writer);
            Box::pin(async move {
                tracing::debug!("data channel closed");
                if let Some(dc) = dc_slot.lock().await.take() {
                    if let Err(e) = dc.close().await {
                        tracing::debug!(error = %e, "error closing data channel");
                    }
                }
                pipe_writer.lock().await.take();
            })
        }));

        dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;
        dc.on_buffered_amount_low(Box::new(move || {
            let send_more_tx = send_more_tx.clone();
            Box::pin(async move {
                // Gate has capacity one; a second signal is redundant.
                let _ = send_more_tx.try_send(());
            })
        }))
        .await;

        tokio::spawn(watchdog(Arc::clone(&shared), activity_rx));

        Self {
            shared,
            reader,
            write_fut: None,
            shutdown_fut: None,
        }
    }

    /// Client address from the current remote description, if one is set
    /// and it names a non-local peer.
    pub async fn remote_ip(&self) -> Option<IpAddr> {
        let desc = self.shared.pc.remote_description().await?;
        sdp::remote_ip_from_sdp(&desc.sdp)
    }

    /// Handle for closing the session from outside the bridge.
    pub fn closer(&self) -> PeerConnCloser {
        PeerConnCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Idempotent close of the whole session.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

#[derive(Clone)]
pub struct PeerConnCloser {
    shared: Arc<Shared>,
}

impl PeerConnCloser {
    pub async fn close(&self) {
        self.shared.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl AsyncRead for PeerConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fut.is_none() {
            let shared = Arc::clone(&this.shared);
            let data = Bytes::copy_from_slice(buf);
            this.write_fut = Some(Box::pin(async move { shared.send(data).await }));
        }
        let fut = this.write_fut.as_mut().expect("write future just set");
        let result = ready!(fut.as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown_fut.is_none() {
            let shared = Arc::clone(&this.shared);
            this.shutdown_fut = Some(Box::pin(async move { shared.close().await }));
        }
        let fut = this.shutdown_fut.as_mut().expect("shutdown future just set");
        ready!(fut.as_mut().poll(cx));
        this.shutdown_fut = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn test_conn() -> PeerConn {
        let api = build_api().expect("api");
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("peer connection"),
        );
        let dc = pc
            .create_data_channel("test", None)
            .await
            .expect("data channel");
        PeerConn::new(pc, dc).await
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_after_inactivity() {
        let conn = test_conn().await;
        assert!(!conn.is_closed());
        tokio::time::sleep(INACTIVITY_TIMEOUT + Duration::from_secs(1)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn write_defers_the_watchdog() {
        let mut conn = test_conn().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(conn.write(b"ping").await.expect("write"), 4);
        // Old deadline passes without firing...
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!conn.is_closed());
        // ...the fresh one does.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = test_conn().await;
        conn.close().await;
        assert!(conn.is_closed());
        conn.close().await;
        conn.closer().close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn write_after_channel_loss_reports_full_length() {
        let mut conn = test_conn().await;
        conn.shared.dc.lock().await.take();
        assert_eq!(conn.write(b"dropped on the floor").await.expect("write"), 20);
    }

    #[tokio::test]
    async fn close_ends_the_read_side() {
        let mut conn = test_conn().await;
        conn.close().await;
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.expect("read"), 0);
    }

    #[tokio::test]
    async fn pipe_carries_message_bytes() {
        let mut conn = test_conn().await;
        {
            let mut writer = conn.shared.pipe_writer.lock().await;
            writer
                .as_mut()
                .expect("pipe writer present")
                .write_all(b"hello")
                .await
                .expect("pipe write");
        }
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");
    }
}
