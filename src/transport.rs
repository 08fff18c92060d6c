//! Transport abstraction.
//!
//! The engine is transport-agnostic: anything that carries ordered text
//! and binary frames in both directions can back a session. A transport
//! is split into its read and write halves when a session adopts it, so
//! the read loop and the outbound writer can run independently.
//!
//! [`memory_pair`] provides an in-process duplex transport used by the
//! test suite and by embedders that drive a session without a network.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Envelope;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// A duplex carrier of ordered frames.
pub trait Transport: Send + 'static {
    /// Split into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

#[async_trait]
pub trait TransportReader: Send {
    /// Receive the next frame. Returns `Err(TransportError::Closed)` once
    /// the peer is gone.
    async fn recv(&mut self) -> Result<Frame, TransportError>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Signal an orderly close to the peer. Best-effort.
    async fn close(&mut self);
}

/// Create an in-process transport pair: the engine-facing half and a peer
/// handle playing the role of the remote client.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_session_tx, to_session_rx) = mpsc::unbounded_channel();
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();

    let transport = MemoryTransport {
        rx: to_session_rx,
        tx: to_peer_tx,
    };
    let peer = MemoryPeer {
        tx: Some(to_session_tx),
        rx: to_peer_rx,
    };
    (transport, peer)
}

/// Engine-facing half of an in-process transport pair.
pub struct MemoryTransport {
    rx: mpsc::UnboundedReceiver<Frame>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Transport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        (
            Box::new(MemoryReader { rx: self.rx }),
            Box::new(MemoryWriter { tx: self.tx }),
        )
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {}
}

/// Client-side handle of an in-process transport pair.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    pub fn send_frame(&self, frame: Frame) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(frame);
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send_frame(Frame::Text(text.into()));
    }

    /// Send an event envelope as the client would.
    pub fn send_event(&self, event: &str, data: serde_json::Value) {
        let env = Envelope::new(event, data);
        self.send_text(env.encode().expect("envelope encoding"));
    }

    pub fn send_binary(&self, bytes: impl Into<Bytes>) {
        self.send_frame(Frame::Binary(bytes.into()));
    }

    /// Receive the next frame, `None` once the session side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive the next frame and decode it as an envelope. `None` on
    /// disconnect or if the frame is binary.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        match self.recv().await? {
            Frame::Text(text) => Envelope::decode(&text).ok(),
            Frame::Binary(_) => None,
        }
    }

    /// Simulate the client going away.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_pair_carries_frames_in_order() {
        let (transport, mut peer) = memory_pair();
        let (mut reader, mut writer) = Box::new(transport).split();

        peer.send_event("NOTES:GET", json!(null));
        peer.send_binary(vec![1u8, 2, 3]);

        assert!(matches!(reader.recv().await.unwrap(), Frame::Text(_)));
        assert_eq!(
            reader.recv().await.unwrap(),
            Frame::Binary(Bytes::from(vec![1u8, 2, 3]))
        );

        writer
            .send(Frame::Text("{\"type\":\"NOTES:SET\",\"data\":{}}".into()))
            .await
            .unwrap();
        let env = peer.recv_envelope().await.unwrap();
        assert_eq!(env.event, "NOTES:SET");
    }

    #[tokio::test]
    async fn test_disconnect_closes_reader() {
        let (transport, mut peer) = memory_pair();
        let (mut reader, _writer) = Box::new(transport).split();

        peer.disconnect();
        assert!(matches!(
            reader.recv().await,
            Err(TransportError::Closed)
        ));
    }
}
