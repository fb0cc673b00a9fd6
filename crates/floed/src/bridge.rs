//! Full-duplex byte pump between the peer session and the relay.
//!
//! Two copies run concurrently; whichever direction ends first shuts down
//! its destination, which collapses the opposite direction through its
//! read side. The call returns only when both directions are done.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub async fn copy_loop<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let a_to_b = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut read_a, &mut write_b).await {
            tracing::debug!(error = %e, "copy loop ended with error");
        }
        let _ = write_b.shutdown().await;
    });
    let b_to_a = tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut read_b, &mut write_a).await {
            tracing::debug!(error = %e, "copy loop ended with error");
        }
        let _ = write_a.shutdown().await;
    });

    let _ = a_to_b.await;
    let _ = b_to_a.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pumps_both_directions() {
        let (mut client, bridge_a) = tokio::io::duplex(4096);
        let (mut relay, bridge_b) = tokio::io::duplex(4096);
        let bridge = tokio::spawn(copy_loop(bridge_a, bridge_b));

        let payload = vec![0xAB; 64 * 1024];
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.expect("client write");
            let mut echo = vec![0u8; 5];
            client.read_exact(&mut echo).await.expect("client read");
            assert_eq!(&echo, b"reply");
            client
        });

        let mut received = vec![0u8; expected.len()];
        relay.read_exact(&mut received).await.expect("relay read");
        assert_eq!(received, expected);
        relay.write_all(b"reply").await.expect("relay write");

        let client = writer.await.expect("writer task");

        // One side hanging up collapses the whole bridge.
        drop(client);
        let mut buf = [0u8; 1];
        assert_eq!(relay.read(&mut buf).await.expect("relay eof"), 0);
        drop(relay);
        bridge.await.expect("bridge task");
    }

    #[tokio::test]
    async fn eof_propagates_from_either_side() {
        let (client, bridge_a) = tokio::io::duplex(1024);
        let (mut relay, bridge_b) = tokio::io::duplex(1024);
        let bridge = tokio::spawn(copy_loop(bridge_a, bridge_b));

        relay.write_all(b"x").await.expect("seed write");
        drop(relay);

        let mut sink = Vec::new();
        let mut client = client;
        client.read_to_end(&mut sink).await.expect("drain");
        assert_eq!(sink, b"x");
        drop(client);
        bridge.await.expect("bridge task");
    }
}
