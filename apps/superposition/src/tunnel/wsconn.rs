//! Adapts a message-oriented WebSocket into a byte-oriented reliable stream
//! so a stream multiplexer can run on top of it.
//!
//! Reads return bytes from the current inbound message, buffering any
//! remainder for the next call. Each write becomes exactly one binary
//! message; a single pump task serialises them onto the socket. Shutdown
//! drops the outbound channel, which closes the underlying transport.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub struct WsConn {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    leftover: Vec<u8>,
}

impl WsConn {
    fn new(
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            inbound,
            outbound: Some(outbound),
            leftover: Vec::new(),
        }
    }

    /// Wrap an outbound tokio-tungstenite connection (tunnel client side).
    pub fn from_client_stream(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (mut sink, mut stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Binary(bytes)) => {
                        if inbound_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx.send(text.into_bytes()).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Self::new(inbound_rx, outbound_tx)
    }

    /// Wrap an accepted axum socket (gateway side of the tunnel).
    pub fn from_axum_socket(ws: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message as AxumMessage;

        let (mut sink, mut stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(AxumMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(AxumMessage::Binary(bytes)) => {
                        if inbound_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Ok(AxumMessage::Text(text)) => {
                        if inbound_tx.send(text.into_bytes()).is_err() {
                            break;
                        }
                    }
                    Ok(AxumMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Self::new(inbound_rx, outbound_tx)
    }
}

impl AsyncRead for WsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.drain(..n);
            return Poll::Ready(Ok(()));
        }

        match this.inbound.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                let n = message.len().min(buf.remaining());
                buf.put_slice(&message[..n]);
                if n < message.len() {
                    this.leftover = message[n..].to_vec();
                }
                Poll::Ready(Ok(()))
            }
            // Channel closed: end of stream.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for WsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(tx) = &this.outbound else {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        };
        match tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound.take();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (
        WsConn,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (WsConn::new(inbound_rx, outbound_tx), inbound_tx, outbound_rx)
    }

    #[tokio::test]
    async fn each_write_is_one_message() {
        let (mut conn, _inbound, mut outbound) = pair();
        conn.write_all(b"hello").await.unwrap();
        conn.write_all(b"world").await.unwrap();
        assert_eq!(outbound.recv().await.unwrap(), b"hello");
        assert_eq!(outbound.recv().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn short_reads_buffer_the_remainder() {
        let (mut conn, inbound, _outbound) = pair();
        inbound.send(b"abcdef".to_vec()).unwrap();

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        let mut rest = [0u8; 2];
        conn.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }

    #[tokio::test]
    async fn closed_inbound_is_end_of_stream() {
        let (mut conn, inbound, _outbound) = pair();
        inbound.send(b"tail".to_vec()).unwrap();
        drop(inbound);

        let mut all = Vec::new();
        conn.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"tail");
    }

    #[tokio::test]
    async fn shutdown_closes_the_outbound_side() {
        let (mut conn, _inbound, mut outbound) = pair();
        conn.shutdown().await.unwrap();
        assert!(outbound.recv().await.is_none());
        assert!(conn.write_all(b"late").await.is_err());
    }
}
