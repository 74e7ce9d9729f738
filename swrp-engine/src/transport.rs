//! Transport contract (C9): an ordered, reliable, message-framed byte
//! channel between the two endpoints, plus a linked mock pair for tests.
//!
//! The concrete USB-bulk realization (outside this crate's scope) offers a
//! single pair of bulk endpoints and a 64 KiB transfer buffer; any type that
//! satisfies this trait — USB, the mock below, or a future TCP/yamux
//! transport the way the teacher's `client`/`server` binaries dial out — can
//! drive the pipelines in this crate.

use crate::error::{Error, Result};
use tokio::sync::mpsc;

/// An ordered, reliable, message-framed byte channel.
///
/// `send` completes when the peer will observe the bytes as one or more
/// SWRP packets in order. `receive` yields at least one whole packet;
/// implementations may return more than one packet's worth of bytes in a
/// single chunk, since [`swrp_wire::Packet::parse`] tolerates and reports
/// trailing bytes via `bytes_consumed`.
#[allow(async_fn_in_trait)]
pub trait Transport: Send {
    /// Sends `bytes` to the peer. Fails with [`Error::Disconnected`] if the
    /// channel has been closed on either end.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Waits for and returns the next chunk of inbound bytes (at least one
    /// whole packet). Fails with [`Error::Disconnected`] once the peer has
    /// closed and no more data is buffered.
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Drains and tears the channel down. Subsequent `send`s fail with
    /// [`Error::Disconnected`].
    async fn close(&mut self);
}

/// One half of an in-memory, linked mock transport pair, for tests and for
/// driving the pipelines without real USB hardware.
pub struct MockTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: bool,
}

impl MockTransport {
    /// Creates two `MockTransport`s, each feeding the other: bytes sent on
    /// one arrive, in order, on `receive()` of the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            Self {
                tx: tx_a,
                rx: rx_a,
                closed: false,
            },
            Self {
                tx: tx_b,
                rx: rx_b,
                closed: false,
            },
        )
    }
}

impl Transport for MockTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        self.tx.send(bytes).map_err(|_| Error::Disconnected)
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or(Error::Disconnected)
    }

    async fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}

/// Size of the read buffer per `receive()` call, matching the 64 KiB bulk
/// transfer buffer of the real USB realization (§6 "Transport").
const READ_CHUNK: usize = 64 * 1024;

/// A TCP-backed [`Transport`], standing in for the USB bulk link this crate
/// does not own. Ordered and reliable the same way a bulk endpoint pair is;
/// the packet layer above tolerates a `receive()` chunk holding several
/// packets, one, or a partial one, exactly as it must for real USB transfers.
pub struct TcpTransport {
    stream: tokio::net::TcpStream,
}

impl TcpTransport {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self { stream }
    }
}

impl Transport for TcpTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|_| Error::Disconnected)
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(|_| Error::Disconnected)?;
        if n == 0 {
            return Err(Error::Disconnected);
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_pair_delivers_in_order() {
        let (mut a, mut b) = MockTransport::pair();
        a.send(vec![1, 2, 3]).await.unwrap();
        a.send(vec![4, 5]).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(b.receive().await.unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    async fn close_causes_subsequent_receive_to_report_disconnected() {
        let (mut a, mut b) = MockTransport::pair();
        a.close().await;
        drop(a);
        assert!(matches!(b.receive().await, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut a, _b) = MockTransport::pair();
        a.close().await;
        assert!(matches!(a.send(vec![1]).await, Err(Error::Disconnected)));
    }
}
