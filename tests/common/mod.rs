//! Shared test support: a scripted firmware peer behind the SPI device
//! seam, plus helpers to drive the transport pump by hand.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use printhost::codes::Channel;
use printhost::protocol::{firmware, host, Connection};
use printhost::scheduler::Scheduler;
use printhost::spi::{
    padded, PacketHeader, SpiDevice, TransferHeader, Transport, CRC16, FORMAT_FIRMWARE,
};

/// One host-side packet, decoded for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum HostPacket {
    Code { channel: Channel, text: String },
    MacroCompleted { channel: Channel, error: bool },
    GetState,
    GetObjectModel(u8),
    LockMovement(Channel),
    Evaluate { channel: Channel, expression: String },
    SetVariable { name: String, expression: String },
    ResendPacket(u16),
    Other(u16),
}

type CodeResponder = Box<dyn Fn(Channel, &str) -> String + Send>;

pub struct SimState {
    /// Every packet the host has sent, in order.
    pub sent: Vec<HostPacket>,
    /// Firmware frames waiting to go out, one `Vec` of packets per frame.
    pub outgoing: VecDeque<Vec<(u16, Vec<u8>)>>,
    pub sequence: u16,
    pub next_packet_id: u16,
    /// Reply text per executed code.
    pub responder: CodeResponder,
    /// Auto-answer `LockMovement` with `Locked`.
    pub grant_locks: bool,
}

#[derive(Clone)]
pub struct SimFirmware {
    state: Arc<Mutex<SimState>>,
}

impl SimFirmware {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                sent: Vec::new(),
                outgoing: VecDeque::new(),
                sequence: 1,
                next_packet_id: 0,
                responder: Box::new(|_, _| "ok".to_string()),
                grant_locks: true,
            })),
        }
    }

    pub fn with_responder(self, responder: CodeResponder) -> Self {
        self.state.lock().unwrap().responder = responder;
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Queue a firmware frame for the next exchange.
    pub fn push_frame(&self, packets: Vec<(u16, Vec<u8>)>) {
        self.state().outgoing.push_back(packets);
    }

    pub fn sent_codes(&self) -> Vec<(Channel, String)> {
        self.state()
            .sent
            .iter()
            .filter_map(|packet| match packet {
                HostPacket::Code { channel, text } => Some((*channel, text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn macro_completions(&self) -> Vec<(Channel, bool)> {
        self.state()
            .sent
            .iter()
            .filter_map(|packet| match packet {
                HostPacket::MacroCompleted { channel, error } => Some((*channel, *error)),
                _ => None,
            })
            .collect()
    }

    pub fn device(&self) -> Box<dyn SpiDevice> {
        Box::new(SimDevice {
            state: self.state.clone(),
        })
    }
}

impl Default for SimFirmware {
    fn default() -> Self {
        Self::new()
    }
}

struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl SpiDevice for SimDevice {
    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        // Emit the next queued frame (or a valid empty one) before looking
        // at the host's frame: a reply can never ride the same transfer.
        let packets = state.outgoing.pop_front().unwrap_or_default();
        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);
        let frame = build_firmware_frame(sequence, &packets);
        rx[..frame.len()].copy_from_slice(&frame);
        rx[frame.len()..].fill(0);

        parse_host_frame(&mut state, tx);
        Ok(())
    }

    async fn wait_data_ready(&mut self, _timeout: Duration) -> io::Result<bool> {
        tokio::task::yield_now().await;
        Ok(true)
    }
}

fn parse_host_frame(state: &mut SimState, tx: &[u8]) {
    let header = TransferHeader::read(tx);
    let payload_len = header.payload_len as usize;
    if TransferHeader::SIZE + payload_len > tx.len() {
        return;
    }
    let payload = &tx[TransferHeader::SIZE..TransferHeader::SIZE + payload_len];

    let mut cursor = 0;
    while cursor + PacketHeader::SIZE <= payload.len() {
        let Ok(packet) = PacketHeader::read(&payload[cursor..]) else {
            return;
        };
        let body_start = cursor + PacketHeader::SIZE;
        let body_end = body_start + packet.length as usize;
        let Some(body) = payload.get(body_start..body_end) else {
            return;
        };
        cursor = body_start + padded(packet.length as usize);
        handle_host_packet(state, packet.request, body);
    }
}

fn handle_host_packet(state: &mut SimState, request: u16, body: &[u8]) {
    let decoded = match request {
        host::CODE => {
            let channel = channel_at(body, 0);
            let length = u16::from_le_bytes([body[2], body[3]]) as usize;
            let text = String::from_utf8_lossy(&body[4..4 + length]).into_owned();
            let reply = (state.responder)(channel, &text);
            let flags = channel.bit() as u32;
            let mut reply_body = flags.to_le_bytes().to_vec();
            reply_body.extend_from_slice(reply.as_bytes());
            state
                .outgoing
                .push_back(vec![(firmware::CODE_REPLY, reply_body)]);
            HostPacket::Code { channel, text }
        }
        host::MACRO_COMPLETED => HostPacket::MacroCompleted {
            channel: channel_at(body, 0),
            error: body[1] != 0,
        },
        host::GET_STATE => HostPacket::GetState,
        host::GET_OBJECT_MODEL => HostPacket::GetObjectModel(body[0]),
        host::LOCK_MOVEMENT => {
            let channel = channel_at(body, 0);
            if state.grant_locks {
                state.outgoing.push_back(vec![(
                    firmware::LOCKED,
                    vec![channel.index() as u8, 0, 0, 0],
                )]);
            }
            HostPacket::LockMovement(channel)
        }
        host::EVALUATE_EXPRESSION => {
            let channel = channel_at(body, 0);
            let length = u16::from_le_bytes([body[2], body[3]]) as usize;
            let expression = String::from_utf8_lossy(&body[4..4 + length]).into_owned();
            HostPacket::Evaluate {
                channel,
                expression,
            }
        }
        host::SET_VARIABLE => {
            let name_len = u16::from_le_bytes([body[2], body[3]]) as usize;
            let expr_len = u16::from_le_bytes([body[4], body[5]]) as usize;
            let name = String::from_utf8_lossy(&body[8..8 + name_len]).into_owned();
            let expression =
                String::from_utf8_lossy(&body[8 + name_len..8 + name_len + expr_len]).into_owned();
            HostPacket::SetVariable { name, expression }
        }
        host::RESEND_PACKET => HostPacket::ResendPacket(u16::from_le_bytes([body[0], body[1]])),
        other => HostPacket::Other(other),
    };
    state.sent.push(decoded);
}

fn channel_at(body: &[u8], offset: usize) -> Channel {
    Channel::from_index(body[offset]).unwrap_or(Channel::Unknown)
}

/// Build a CRC-valid firmware frame carrying `packets`.
pub fn build_firmware_frame(sequence: u16, packets: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (index, (request, body)) in packets.iter().enumerate() {
        let header = PacketHeader::new(*request, index as u16, body.len());
        let mut raw = [0u8; PacketHeader::SIZE];
        header.write(&mut raw);
        payload.extend_from_slice(&raw);
        payload.extend_from_slice(body);
        payload.extend(std::iter::repeat(0).take(padded(body.len()) - body.len()));
    }

    let mut header = TransferHeader::for_payload(sequence, &payload);
    header.format = FORMAT_FIRMWARE;
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

/// Body of an `ExecuteMacro` firmware request.
pub fn execute_macro_body(channel: Channel, report_missing: bool, filename: &str) -> Vec<u8> {
    let mut body = vec![channel.index() as u8, report_missing as u8];
    body.extend_from_slice(&(filename.len() as u16).to_le_bytes());
    body.extend_from_slice(filename.as_bytes());
    body
}

/// Connection over a fresh transport talking to `sim`.
pub fn connect(sim: &SimFirmware) -> Connection {
    Connection::new(Transport::new(sim.device(), 8192, 3))
}

/// Drive the pump by hand: exchange, dispatch, tick, `n` times. A short
/// sleep between ticks lets the file-runner tasks make progress.
pub async fn run_ticks(scheduler: &Arc<Scheduler>, conn: &mut Connection, n: usize) {
    for _ in 0..n {
        let requests = conn.exchange().await.expect("exchange");
        for request in requests {
            scheduler.handle_request(request).await;
        }
        scheduler.tick(conn).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
