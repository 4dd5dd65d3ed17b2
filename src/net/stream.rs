//! Stream embedding: a virtual datagram connection over lite-ID packets
//!
//! A virtual packet connection presents datagram read/write to the reliable
//! stream transport (selective-repeat ACK/NAK, external to this crate).
//! Writes become Active frames on the peer send path; reads block on the
//! channel the lite router feeds. Termination is idempotent: the first
//! terminator records the reason, every later read surfaces it as EOF.

use super::lite::StreamEvent;
use super::message::{
    GetBlockBody, GetBlockFrame, TransferBody, TransferControl, TransferFrame,
};
use super::packet::PACKET_OVERHEAD;
use crate::types::{LiteId, PeerId};
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Upper bound for one embedded datagram: typical Ethernet path-MTU payload
/// minus packet and frame overhead.
pub const TRANSFER_MAX_EMBED_SIZE_LITE: usize = 1472 - PACKET_OVERHEAD - 18;

/// Embedded protocol flow-control window (packets in flight).
pub const STREAM_WINDOW_MAX: usize = 64;

/// Window floor negotiated by the embedded protocol's handshake.
pub const STREAM_WINDOW_MIN: usize = 32;

/// Termination reasons, surfaced via `Stream::reason` after EOF.
pub const STREAM_REASON_LOCAL_CLOSE: u16 = 1;
pub const STREAM_REASON_REMOTE_TERMINATE: u16 = 2;
pub const STREAM_REASON_EXPIRED: u16 = 3;
pub const STREAM_REASON_NOT_AVAILABLE: u16 = 404;
pub const STREAM_REASON_EMPTY: u16 = 410;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream terminated (reason {0})")]
    Terminated(u16),
    #[error("send path closed")]
    SendClosed,
}

/// Which command family frames this stream on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Transfer { transfer_type: u8 },
    GetBlock,
}

/// An outbound frame payload handed to the backend's per-stream send task.
#[derive(Debug)]
pub struct OutboundFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Bidirectional datagram endpoint bound to a (peer, lite ID) pair.
pub struct VirtualPacketConn {
    pub peer_id: PeerId,
    pub lite_id: LiteId,
    kind: FrameKind,
    out_tx: mpsc::Sender<OutboundFrame>,
    in_rx: Mutex<mpsc::Receiver<StreamEvent>>,
    reason: StdMutex<Option<u16>>,
}

impl VirtualPacketConn {
    pub fn new(
        kind: FrameKind,
        peer_id: PeerId,
        lite_id: LiteId,
        out_tx: mpsc::Sender<OutboundFrame>,
        in_rx: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            kind,
            peer_id,
            lite_id,
            out_tx,
            in_rx: Mutex::new(in_rx),
            reason: StdMutex::new(None),
        }
    }

    fn frame(&self, control: TransferControl, data: Vec<u8>) -> OutboundFrame {
        let payload = match self.kind {
            FrameKind::Transfer { transfer_type } => TransferFrame {
                control,
                transfer_type,
                lite_id: self.lite_id,
                body: match control {
                    TransferControl::Active => TransferBody::Data(data),
                    _ => TransferBody::None,
                },
            }
            .encode(),
            FrameKind::GetBlock => GetBlockFrame {
                control,
                lite_id: self.lite_id,
                body: match control {
                    TransferControl::Active => GetBlockBody::Data(data),
                    _ => GetBlockBody::None,
                },
            }
            .encode(),
        };
        OutboundFrame { kind: self.kind, payload }
    }

    /// Write one datagram. Oversized writes are split; the embedded
    /// protocol keeps its datagrams under the embed cap anyway.
    pub async fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        if let Some(reason) = self.current_reason() {
            return Err(StreamError::Terminated(reason));
        }
        for chunk in data.chunks(TRANSFER_MAX_EMBED_SIZE_LITE.max(1)) {
            let frame = self.frame(TransferControl::Active, chunk.to_vec());
            self.out_tx
                .send(frame)
                .await
                .map_err(|_| StreamError::SendClosed)?;
        }
        Ok(())
    }

    /// Read the next datagram, blocking until data or termination.
    pub async fn read(&self) -> Result<Vec<u8>, StreamError> {
        if let Some(reason) = self.current_reason() {
            return Err(StreamError::Terminated(reason));
        }
        let mut rx = self.in_rx.lock().await;
        loop {
            match rx.recv().await {
                Some(StreamEvent::Data(data)) => return Ok(data),
                Some(StreamEvent::Control(control)) => {
                    let reason = match control {
                        TransferControl::Terminate => STREAM_REASON_REMOTE_TERMINATE,
                        TransferControl::NotAvailable => STREAM_REASON_NOT_AVAILABLE,
                        TransferControl::Empty => STREAM_REASON_EMPTY,
                        // Handshake frames are not data; keep reading.
                        TransferControl::RequestStart | TransferControl::Active => continue,
                    };
                    self.record_reason(reason);
                    return Err(StreamError::Terminated(reason));
                }
                Some(StreamEvent::Expired) => {
                    self.record_reason(STREAM_REASON_EXPIRED);
                    return Err(StreamError::Terminated(STREAM_REASON_EXPIRED));
                }
                None => {
                    self.record_reason(STREAM_REASON_LOCAL_CLOSE);
                    let reason = self.current_reason().unwrap_or(STREAM_REASON_LOCAL_CLOSE);
                    return Err(StreamError::Terminated(reason));
                }
            }
        }
    }

    /// Send a control frame and record the local reason. Idempotent: only
    /// the first terminator wins.
    pub async fn terminate(&self, control: TransferControl) {
        let reason = match control {
            TransferControl::Terminate => STREAM_REASON_LOCAL_CLOSE,
            TransferControl::NotAvailable => STREAM_REASON_NOT_AVAILABLE,
            TransferControl::Empty => STREAM_REASON_EMPTY,
            _ => STREAM_REASON_LOCAL_CLOSE,
        };
        if !self.record_reason(reason) {
            return;
        }
        let frame = self.frame(control, Vec::new());
        let _ = self.out_tx.send(frame).await;
    }

    fn record_reason(&self, reason: u16) -> bool {
        let mut guard = self.reason.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason);
            true
        } else {
            false
        }
    }

    /// Termination reason once the stream ended.
    pub fn current_reason(&self) -> Option<u16> {
        *self.reason.lock().unwrap()
    }
}

// =============================================================================
// FILE TRANSFER FRAMING
// =============================================================================

/// 16-byte prelude preceding file bytes: total file size, then the size of
/// this transfer.
pub fn encode_file_prelude(total_file_size: u64, transfer_size: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&total_file_size.to_le_bytes());
    out[8..].copy_from_slice(&transfer_size.to_le_bytes());
    out
}

pub fn decode_file_prelude(data: &[u8]) -> Option<(u64, u64)> {
    if data.len() < 16 {
        return None;
    }
    let total = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);
    let transfer = u64::from_le_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]);
    Some((total, transfer))
}

// =============================================================================
// BLOCK STREAM FRAMING
// =============================================================================

/// Per-block status header inside a GetBlock stream.
pub const GET_BLOCK_STATUS_AVAILABLE: u8 = 0;
pub const GET_BLOCK_STATUS_NOT_AVAILABLE: u8 = 3;

/// One record of a block-download stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStreamRecord {
    Block { number: u64, data: Vec<u8> },
    /// The requested offset does not exist on the serving side.
    NotAvailable { offset: u64 },
}

impl BlockStreamRecord {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            BlockStreamRecord::Block { number, data } => {
                let mut out = Vec::with_capacity(13 + data.len());
                out.push(GET_BLOCK_STATUS_AVAILABLE);
                out.extend_from_slice(&number.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            BlockStreamRecord::NotAvailable { offset } => {
                let mut out = Vec::with_capacity(9);
                out.push(GET_BLOCK_STATUS_NOT_AVAILABLE);
                out.extend_from_slice(&offset.to_le_bytes());
                out
            }
        }
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let status = *data.first()?;
        match status {
            GET_BLOCK_STATUS_AVAILABLE => {
                if data.len() < 13 {
                    return None;
                }
                let number = u64::from_le_bytes([
                    data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
                ]);
                let size = u32::from_le_bytes([data[9], data[10], data[11], data[12]]) as usize;
                if data.len() < 13 + size {
                    return None;
                }
                Some(BlockStreamRecord::Block { number, data: data[13..13 + size].to_vec() })
            }
            GET_BLOCK_STATUS_NOT_AVAILABLE => {
                if data.len() < 9 {
                    return None;
                }
                let offset = u64::from_le_bytes([
                    data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
                ]);
                Some(BlockStreamRecord::NotAvailable { offset })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_pair() -> (VirtualPacketConn, mpsc::Receiver<OutboundFrame>, mpsc::Sender<StreamEvent>)
    {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let conn = VirtualPacketConn::new(
            FrameKind::Transfer { transfer_type: 0 },
            [1u8; 33],
            [2u8; 16],
            out_tx,
            in_rx,
        );
        (conn, out_rx, in_tx)
    }

    #[tokio::test]
    async fn write_emits_active_frames() {
        let (conn, mut out_rx, _in_tx) = conn_pair();
        conn.write(b"payload").await.unwrap();

        let frame = out_rx.recv().await.unwrap();
        let decoded = TransferFrame::decode(&frame.payload).unwrap();
        assert_eq!(decoded.control, TransferControl::Active);
        assert_eq!(decoded.lite_id, [2u8; 16]);
        assert_eq!(decoded.body, TransferBody::Data(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn oversized_write_is_split() {
        let (conn, mut out_rx, _in_tx) = conn_pair();
        let big = vec![7u8; TRANSFER_MAX_EMBED_SIZE_LITE + 10];
        conn.write(&big).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        let first = TransferFrame::decode(&first.payload).unwrap();
        let second = TransferFrame::decode(&second.payload).unwrap();
        match (first.body, second.body) {
            (TransferBody::Data(a), TransferBody::Data(b)) => {
                assert_eq!(a.len(), TRANSFER_MAX_EMBED_SIZE_LITE);
                assert_eq!(b.len(), 10);
            }
            other => panic!("unexpected bodies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_returns_data_then_termination() {
        let (conn, _out_rx, in_tx) = conn_pair();
        in_tx.send(StreamEvent::Data(vec![1, 2, 3])).await.unwrap();
        in_tx
            .send(StreamEvent::Control(TransferControl::Terminate))
            .await
            .unwrap();

        assert_eq!(conn.read().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            conn.read().await.unwrap_err(),
            StreamError::Terminated(STREAM_REASON_REMOTE_TERMINATE)
        );
        assert_eq!(conn.current_reason(), Some(STREAM_REASON_REMOTE_TERMINATE));
    }

    #[tokio::test]
    async fn expiry_surfaces_reason_3() {
        let (conn, _out_rx, in_tx) = conn_pair();
        in_tx.send(StreamEvent::Expired).await.unwrap();
        assert_eq!(
            conn.read().await.unwrap_err(),
            StreamError::Terminated(STREAM_REASON_EXPIRED)
        );
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (conn, mut out_rx, _in_tx) = conn_pair();
        conn.terminate(TransferControl::NotAvailable).await;
        conn.terminate(TransferControl::Terminate).await;

        assert_eq!(conn.current_reason(), Some(STREAM_REASON_NOT_AVAILABLE));
        // Only the first terminator hit the wire.
        let frame = out_rx.recv().await.unwrap();
        let decoded = TransferFrame::decode(&frame.payload).unwrap();
        assert_eq!(decoded.control, TransferControl::NotAvailable);
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn file_prelude_round_trip() {
        let prelude = encode_file_prelude(1_000_000, 4096);
        assert_eq!(decode_file_prelude(&prelude), Some((1_000_000, 4096)));
        assert_eq!(decode_file_prelude(&prelude[..10]), None);
    }

    #[test]
    fn block_stream_records_round_trip() {
        let rec = BlockStreamRecord::Block { number: 3, data: vec![9; 40] };
        assert_eq!(BlockStreamRecord::decode(&rec.encode()).unwrap(), rec);

        let rec = BlockStreamRecord::NotAvailable { offset: 5 };
        assert_eq!(BlockStreamRecord::decode(&rec.encode()).unwrap(), rec);

        assert!(BlockStreamRecord::decode(&[99, 0]).is_none());
    }
}
