//! Relay WebSocket adapter.
//!
//! The relay speaks binary WebSocket messages; the bridge speaks bytes.
//! `WsConn` flattens the message stream into an `AsyncRead + AsyncWrite`
//! duplex, carrying leftover message bytes across short reads. Shutdown
//! maps to a WebSocket Close, so the bridge's symmetric teardown reaches
//! the relay as a proper close frame.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Dial the relay, tagging the URL with the client address when we have
/// one so the relay can attribute the flow.
pub async fn dial_relay(relay: &Url, client_ip: Option<IpAddr>) -> Result<WsConn, WsError> {
    let mut url = relay.clone();
    if let Some(ip) = client_ip {
        url.query_pairs_mut()
            .append_pair("client_ip", &ip.to_string());
    }
    let (inner, _response) = connect_async(url.as_str()).await?;
    Ok(WsConn {
        inner,
        read_buf: Bytes::new(),
    })
}

pub struct WsConn {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    read_buf: Bytes,
}

fn to_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl AsyncRead for WsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                None => return Poll::Ready(Ok(())),
                Some(Err(WsError::ConnectionClosed)) => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(to_io(e))),
                Some(Ok(Message::Binary(data))) => this.read_buf = Bytes::from(data),
                Some(Ok(Message::Text(text))) => this.read_buf = Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(_))) => return Poll::Ready(Ok(())),
                // Pings and pongs are the library's business.
                Some(Ok(_)) => {}
            }
        }
    }
}

impl AsyncWrite for WsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            return Poll::Ready(Err(to_io(e)));
        }
        if let Err(e) = Pin::new(&mut this.inner).start_send(Message::Binary(buf.to_vec())) {
            return Poll::Ready(Err(to_io(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(to_io(e))),
        }
    }
}
