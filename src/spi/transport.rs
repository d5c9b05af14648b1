//! Full-duplex transfer engine.
//!
//! Owns the staged outgoing payload, the last valid incoming payload, and
//! the resend bookkeeping. One [`Transport::perform_full_transfer`] call is
//! one buffer exchange; the caller reads the peer's packets back with
//! [`Transport::read_packet`] until it returns `None`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{
    padded, PacketHeader, SpiDevice, TransferHeader, FORMAT_INVALID,
};

/// What one exchange produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Peer sent the invalid sentinel; it had nothing new.
    Idle,
    /// A fresh, CRC-valid payload is ready to read.
    Data,
    /// Valid frame, but a sequence id we already processed (peer resend).
    Duplicate,
    /// Corrupt frame; the caller should request a resend of `sequence_id`.
    BadFrame { sequence_id: u16 },
}

pub struct Transport {
    device: Box<dyn SpiDevice>,
    buffer_size: usize,
    max_resends: u32,

    /// Packets staged for the next outgoing transfer.
    tx_payload: Vec<u8>,
    /// Payload of the previous transfer, kept for packet resends.
    last_tx_payload: Vec<u8>,
    next_packet_id: u16,
    sequence_id: u16,

    rx_payload: Vec<u8>,
    rx_cursor: usize,
    last_peer_sequence: Option<u16>,

    /// Bad frame currently being retried: (sequence id, failure count).
    bad_frame: Option<(u16, u32)>,
}

impl Transport {
    pub fn new(device: Box<dyn SpiDevice>, buffer_size: usize, max_resends: u32) -> Self {
        Self {
            device,
            buffer_size,
            max_resends,
            tx_payload: Vec::with_capacity(buffer_size),
            last_tx_payload: Vec::new(),
            next_packet_id: 0,
            sequence_id: 0,
            rx_payload: Vec::new(),
            rx_cursor: 0,
            last_peer_sequence: None,
            bad_frame: None,
        }
    }

    /// Room left for one more packet with a body of `body_len` bytes.
    pub fn can_write(&self, body_len: usize) -> bool {
        let used = TransferHeader::SIZE + self.tx_payload.len();
        used + PacketHeader::SIZE + padded(body_len) <= self.buffer_size
    }

    /// Stage a packet for the next transfer. Fails softly with
    /// [`Error::BufferFull`] so the caller can retry next tick.
    pub fn write_packet(&mut self, request: u16, body: &[u8]) -> Result<u16> {
        if !self.can_write(body.len()) {
            return Err(Error::BufferFull);
        }
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        let header = PacketHeader::new(request, id, body.len());
        let mut raw = [0u8; PacketHeader::SIZE];
        header.write(&mut raw);
        self.tx_payload.extend_from_slice(&raw);
        self.tx_payload.extend_from_slice(body);
        self.tx_payload
            .extend(std::iter::repeat(0).take(padded(body.len()) - body.len()));
        Ok(id)
    }

    /// Re-stage a packet from the previous transfer by its packet id.
    /// Unknown ids are logged and ignored; the peer gives up on its own.
    pub fn resend_packet(&mut self, id: u16) {
        let mut cursor = 0;
        let payload = std::mem::take(&mut self.last_tx_payload);
        while cursor + PacketHeader::SIZE <= payload.len() {
            let Ok(header) = PacketHeader::read(&payload[cursor..]) else {
                break;
            };
            let body_start = cursor + PacketHeader::SIZE;
            let body_end = body_start + header.length as usize;
            if body_end > payload.len() {
                break;
            }
            if header.id == id {
                let body = payload[body_start..body_end].to_vec();
                if let Err(e) = self.write_packet(header.request, &body) {
                    warn!(id, "cannot restage packet for resend: {e}");
                }
                self.last_tx_payload = payload;
                return;
            }
            cursor = body_end + (padded(header.length as usize) - header.length as usize);
        }
        self.last_tx_payload = payload;
        warn!(id, "peer requested resend of unknown packet id");
    }

    /// Exchange buffers once and classify the incoming frame.
    pub async fn perform_full_transfer(&mut self) -> Result<TransferOutcome> {
        let mut tx = vec![0u8; self.buffer_size];
        let header = TransferHeader::for_payload(self.sequence_id, &self.tx_payload);
        header.write(&mut tx[..TransferHeader::SIZE]);
        tx[TransferHeader::SIZE..TransferHeader::SIZE + self.tx_payload.len()]
            .copy_from_slice(&self.tx_payload);

        let mut rx = vec![0u8; self.buffer_size];
        self.device.exchange(&tx, &mut rx).await?;

        // Our frame is on the wire either way.
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.last_tx_payload = std::mem::take(&mut self.tx_payload);
        self.next_packet_id = 0;

        let peer = TransferHeader::read(&rx);
        if peer.format == FORMAT_INVALID {
            return Ok(TransferOutcome::Idle);
        }

        match self.validate_incoming(&peer, &rx) {
            Ok(()) => {
                self.bad_frame = None;
                if self.last_peer_sequence == Some(peer.sequence_id) {
                    debug!(sequence = peer.sequence_id, "duplicate transfer suppressed");
                    self.rx_payload.clear();
                    self.rx_cursor = 0;
                    return Ok(TransferOutcome::Duplicate);
                }
                self.last_peer_sequence = Some(peer.sequence_id);
                let end = TransferHeader::SIZE + peer.payload_len as usize;
                self.rx_payload = rx[TransferHeader::SIZE..end].to_vec();
                self.rx_cursor = 0;
                Ok(TransferOutcome::Data)
            }
            Err(e) if e.is_transient() => {
                self.rx_payload.clear();
                self.rx_cursor = 0;
                self.note_bad_frame(peer.sequence_id, &e)?;
                Ok(TransferOutcome::BadFrame {
                    sequence_id: peer.sequence_id,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn validate_incoming(&self, peer: &TransferHeader, rx: &[u8]) -> Result<()> {
        peer.validate(rx)?;
        let payload_len = peer.payload_len as usize;
        if TransferHeader::SIZE + payload_len > self.buffer_size {
            return Err(Error::MalformedPacket {
                request: 0,
                id: peer.sequence_id,
                reason: format!("payload length {payload_len} exceeds buffer"),
            });
        }
        peer.validate_payload(&rx[TransferHeader::SIZE..TransferHeader::SIZE + payload_len])
    }

    fn note_bad_frame(&mut self, sequence_id: u16, cause: &Error) -> Result<()> {
        let count = match self.bad_frame {
            Some((seq, count)) if seq == sequence_id => count + 1,
            _ => 1,
        };
        warn!(sequence = sequence_id, attempt = count, "corrupt transfer: {cause}");
        if count > self.max_resends {
            return Err(Error::ResendExhausted(sequence_id));
        }
        self.bad_frame = Some((sequence_id, count));
        Ok(())
    }

    /// Peel the next packet from the incoming payload.
    ///
    /// Returns `None` once the payload is exhausted. A structurally invalid
    /// packet dumps diagnostics and errors out; the caller abandons the rest
    /// of the frame and requests a full resend.
    pub fn read_packet(&mut self) -> Result<Option<(PacketHeader, Vec<u8>)>> {
        if self.rx_cursor + PacketHeader::SIZE > self.rx_payload.len() {
            return Ok(None);
        }
        let header = PacketHeader::read(&self.rx_payload[self.rx_cursor..])?;
        let body_start = self.rx_cursor + PacketHeader::SIZE;
        let body_end = body_start + header.length as usize;
        if body_end > self.rx_payload.len() {
            self.dump_malformed();
            return Err(Error::MalformedPacket {
                request: header.request,
                id: header.id,
                reason: format!(
                    "body of {} bytes overruns payload ({} available)",
                    header.length,
                    self.rx_payload.len() - body_start
                ),
            });
        }
        let body = self.rx_payload[body_start..body_end].to_vec();
        self.rx_cursor = body_start + padded(header.length as usize);
        Ok(Some((header, body)))
    }

    /// Log the unread remainder of the incoming payload for diagnostics.
    pub fn dump_malformed(&self) {
        let remainder = &self.rx_payload[self.rx_cursor.min(self.rx_payload.len())..];
        let hex: String = remainder
            .iter()
            .take(64)
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        warn!(
            offset = self.rx_cursor,
            len = remainder.len(),
            "malformed packet region: {hex}"
        );
    }

    pub fn has_staged_data(&self) -> bool {
        !self.tx_payload.is_empty()
    }

    /// Sequence id of the last frame the peer claimed, valid or not.
    pub fn last_peer_sequence(&self) -> Option<u16> {
        self.last_peer_sequence
    }

    /// Wait for the peer's data-ready edge, or `poll` elapsing.
    pub async fn wait_for_activity(&mut self, poll: Duration) -> Result<bool> {
        Ok(self.device.wait_data_ready(poll).await?)
    }

    /// Forget link state after a failure, ahead of a fresh handshake.
    pub fn reset(&mut self) {
        self.tx_payload.clear();
        self.last_tx_payload.clear();
        self.rx_payload.clear();
        self.rx_cursor = 0;
        self.next_packet_id = 0;
        self.last_peer_sequence = None;
        self.bad_frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::{CRC16, FORMAT_FIRMWARE, PROTOCOL_VERSION};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;

    /// Device that replays pre-built frames and records what the host sent.
    struct ScriptedDevice {
        frames: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl SpiDevice for ScriptedDevice {
        async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
            self.sent.push(tx.to_vec());
            match self.frames.pop_front() {
                Some(frame) => {
                    rx[..frame.len()].copy_from_slice(&frame);
                    rx[frame.len()..].fill(0);
                }
                None => {
                    rx.fill(0);
                    rx[0] = FORMAT_INVALID;
                }
            }
            Ok(())
        }

        async fn wait_data_ready(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.frames.is_empty())
        }
    }

    fn firmware_frame(sequence_id: u16, packets: &[(u16, u16, &[u8])]) -> Vec<u8> {
        let mut payload = Vec::new();
        for (request, id, body) in packets {
            let header = PacketHeader::new(*request, *id, body.len());
            let mut raw = [0u8; PacketHeader::SIZE];
            header.write(&mut raw);
            payload.extend_from_slice(&raw);
            payload.extend_from_slice(body);
            payload.extend(std::iter::repeat(0).take(padded(body.len()) - body.len()));
        }
        let mut header = TransferHeader::for_payload(sequence_id, &payload);
        header.format = FORMAT_FIRMWARE;
        header.protocol_version = PROTOCOL_VERSION;
        // format is covered by the header CRC, so recompute it.
        let mut covered = [0u8; 8];
        covered[0] = header.format;
        covered[2..4].copy_from_slice(&header.sequence_id.to_le_bytes());
        covered[4..6].copy_from_slice(&header.protocol_version.to_le_bytes());
        covered[6..8].copy_from_slice(&header.payload_len.to_le_bytes());
        header.header_crc = CRC16.checksum(&covered);

        let mut frame = vec![0u8; TransferHeader::SIZE + payload.len()];
        header.write(&mut frame[..TransferHeader::SIZE]);
        frame[TransferHeader::SIZE..].copy_from_slice(&payload);
        frame
    }

    fn transport_with(frames: Vec<Vec<u8>>) -> Transport {
        Transport::new(
            Box::new(ScriptedDevice {
                frames: frames.into(),
                sent: Vec::new(),
            }),
            256,
            3,
        )
    }

    #[tokio::test]
    async fn reads_packets_from_valid_frame() {
        let frame = firmware_frame(1, &[(4, 0, b"hello"), (1, 1, b"\x05\x00\x00\x00")]);
        let mut transport = transport_with(vec![frame]);

        assert_eq!(
            transport.perform_full_transfer().await.unwrap(),
            TransferOutcome::Data
        );
        let (header, body) = transport.read_packet().unwrap().unwrap();
        assert_eq!(header.request, 4);
        assert_eq!(body, b"hello");
        let (header, _) = transport.read_packet().unwrap().unwrap();
        assert_eq!(header.request, 1);
        assert!(transport.read_packet().unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_sequence_is_suppressed() {
        let frame = firmware_frame(9, &[(4, 0, b"x")]);
        let mut transport = transport_with(vec![frame.clone(), frame]);

        assert_eq!(
            transport.perform_full_transfer().await.unwrap(),
            TransferOutcome::Data
        );
        transport.read_packet().unwrap().unwrap();
        assert_eq!(
            transport.perform_full_transfer().await.unwrap(),
            TransferOutcome::Duplicate
        );
        assert!(transport.read_packet().unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_payload_is_reported_then_recovers() {
        let mut bad = firmware_frame(3, &[(4, 0, b"data")]);
        let len = bad.len();
        bad[len - 1] ^= 0xFF;
        let good = firmware_frame(4, &[(4, 1, b"data")]);
        let mut transport = transport_with(vec![bad, good]);

        assert_eq!(
            transport.perform_full_transfer().await.unwrap(),
            TransferOutcome::BadFrame { sequence_id: 3 }
        );
        assert_eq!(
            transport.perform_full_transfer().await.unwrap(),
            TransferOutcome::Data
        );
    }

    #[tokio::test]
    async fn resend_budget_is_bounded() {
        let mut bad = firmware_frame(3, &[(4, 0, b"data")]);
        let len = bad.len();
        bad[len - 1] ^= 0xFF;
        let mut transport = transport_with(vec![bad.clone(), bad.clone(), bad.clone(), bad]);

        for _ in 0..3 {
            assert!(matches!(
                transport.perform_full_transfer().await.unwrap(),
                TransferOutcome::BadFrame { sequence_id: 3 }
            ));
        }
        assert!(matches!(
            transport.perform_full_transfer().await,
            Err(Error::ResendExhausted(3))
        ));
    }

    #[tokio::test]
    async fn buffer_full_is_soft() {
        let mut transport = transport_with(vec![]);
        let body = vec![0u8; 200];
        transport.write_packet(2, &body).unwrap();
        assert!(matches!(
            transport.write_packet(2, &body),
            Err(Error::BufferFull)
        ));
    }

    #[tokio::test]
    async fn overlong_packet_body_is_malformed() {
        // Header claims 100 bytes but the payload only carries 4.
        let mut payload = Vec::new();
        let header = PacketHeader::new(4, 0, 100);
        let mut raw = [0u8; PacketHeader::SIZE];
        header.write(&mut raw);
        payload.extend_from_slice(&raw);
        payload.extend_from_slice(b"abcd");

        let mut frame_header = TransferHeader::for_payload(5, &payload);
        frame_header.format = FORMAT_FIRMWARE;
        let mut covered = [0u8; 8];
        covered[0] = frame_header.format;
        covered[2..4].copy_from_slice(&frame_header.sequence_id.to_le_bytes());
        covered[4..6].copy_from_slice(&frame_header.protocol_version.to_le_bytes());
        covered[6..8].copy_from_slice(&frame_header.payload_len.to_le_bytes());
        frame_header.header_crc = CRC16.checksum(&covered);
        let mut frame = vec![0u8; TransferHeader::SIZE + payload.len()];
        frame_header.write(&mut frame[..TransferHeader::SIZE]);
        frame[TransferHeader::SIZE..].copy_from_slice(&payload);

        let mut transport = transport_with(vec![frame]);
        assert_eq!(
            transport.perform_full_transfer().await.unwrap(),
            TransferOutcome::Data
        );
        assert!(transport.read_packet().is_err());
    }
}
