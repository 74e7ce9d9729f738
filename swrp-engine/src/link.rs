//! Wiring between an abstract [`Transport`] and the packet-level tasks that
//! sit on top of it.
//!
//! A single task owns the transport for its whole lifetime and multiplexes
//! outbound writes against inbound reads with `tokio::select!`, the way the
//! teacher's `client`/`server` binaries spawn one task to drive a `yamux`
//! connection while the caller only ever touches stream handles. Everything
//! above this module talks to the transport only through channels, so the
//! handshake code and the long-lived receive task can share one inbound
//! stream without fighting over a lock held across a blocking read.

use crate::error::{Error, Result};
use crate::transport::Transport;
use swrp_wire::Packet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The write half and lifetime handle of a driven transport.
pub struct Link {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    driver: JoinHandle<()>,
}

impl Link {
    /// Queues `packet`'s serialized bytes for sending. Fails with
    /// [`Error::Disconnected`] if the driver task has exited.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.outbound_tx
            .send(packet.serialize())
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Aborts the driver task, closing the underlying transport.
    pub fn shutdown(&self) {
        self.driver.abort();
    }
}

/// Accumulates inbound byte chunks and yields one [`Packet`] at a time,
/// resyncing past a single corrupt packet rather than desyncing the whole
/// stream (§4.8 partial-failure policy).
pub struct PacketReader {
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

impl PacketReader {
    /// Waits for and returns the next successfully parsed packet. A single
    /// malformed packet is reported as `Err(Error::Wire(_))`, having already
    /// been skipped internally — callers should log it and call again rather
    /// than treat it as fatal. Returns `Err(Error::Disconnected)` once the
    /// transport is gone and no more bytes are buffered.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(outcome) = self.try_parse_one() {
                return outcome;
            }
            match self.inbound_rx.recv().await {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => return Err(Error::Disconnected),
            }
        }
    }

    fn try_parse_one(&mut self) -> Option<Result<Packet>> {
        if self.buf.len() < swrp_wire::HEADER_SIZE {
            return None;
        }
        match Packet::parse(&self.buf) {
            Ok((packet, consumed)) => {
                self.buf.drain(..consumed);
                Some(Ok(packet))
            }
            Err(swrp_wire::Error::BufferTooShort { .. }) => None,
            Err(e) => {
                let payload_length = u32::from_le_bytes([
                    self.buf[12], self.buf[13], self.buf[14], self.buf[15],
                ]) as usize;
                let total_len = swrp_wire::HEADER_SIZE + payload_length + swrp_wire::CRC_SIZE;
                if total_len <= self.buf.len() {
                    self.buf.drain(..total_len);
                } else {
                    self.buf.clear();
                }
                Some(Err(Error::from(e)))
            }
        }
    }
}

/// Spawns the driver task for `transport` and returns the write handle and
/// read stream that everything else in a pipeline uses.
pub fn spawn<T: Transport + 'static>(mut transport: T) -> (Link, PacketReader) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(64);

    let driver = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                maybe_bytes = outbound_rx.recv() => {
                    match maybe_bytes {
                        Some(bytes) => {
                            if transport.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            transport.close().await;
                            break;
                        }
                    }
                }
                result = transport.receive() => {
                    match result {
                        Ok(bytes) => {
                            if inbound_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });

    (
        Link {
            outbound_tx,
            driver,
        },
        PacketReader { inbound_rx, buf: Vec::new() },
    )
}
