//! Protocol state machine over the SPI transport.
//!
//! A [`Connection`] wraps the framing layer and multiplexes requests in both
//! directions once the version handshake has completed. Host requests are
//! staged opportunistically into the next outgoing buffer; if one does not
//! fit, the write fails softly with `Error::BufferFull` and the caller
//! retries next tick.

mod requests;

pub use requests::{body, firmware, host, FirmwareRequest, PauseReason, ReplyFlags};

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codes::Channel;
use crate::error::{Error, Result};
use crate::spi::{Transport, TransferOutcome};

/// Number of object-model modules polled round-robin with `GetObjectModel`.
pub const MODULE_COUNT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Disconnected,
    Handshaking,
    Ready,
    Failed,
}

pub struct Connection {
    transport: Transport,
    state: ProtocolState,
    next_module: u8,
}

impl Connection {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            state: ProtocolState::Disconnected,
            next_module: 0,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Re-run the version handshake. The first CRC-valid frame from the
    /// peer proves the versions match (the framing layer rejects any other
    /// version as fatal).
    pub async fn handshake(&mut self, poll: Duration, attempts: u32) -> Result<()> {
        self.state = ProtocolState::Handshaking;
        self.transport.reset();

        for attempt in 0..attempts {
            match self.transport.perform_full_transfer().await {
                Ok(TransferOutcome::Data) | Ok(TransferOutcome::Duplicate) => {
                    // Drain whatever rode along on the handshake frame; the
                    // firmware has just (re)connected and resends state anyway.
                    while let Ok(Some((header, _))) = self.transport.read_packet() {
                        debug!(request = header.request, "discarding pre-handshake packet");
                    }
                    self.state = ProtocolState::Ready;
                    info!("firmware connection established");
                    return Ok(());
                }
                Ok(TransferOutcome::Idle) | Ok(TransferOutcome::BadFrame { .. }) => {
                    debug!(attempt, "no valid handshake frame yet");
                    self.transport.wait_for_activity(poll).await?;
                }
                Err(e @ Error::BadVersion { .. }) => {
                    self.state = ProtocolState::Failed;
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    self.transport.wait_for_activity(poll).await?;
                }
                Err(e) => {
                    self.state = ProtocolState::Failed;
                    return Err(e);
                }
            }
        }
        self.state = ProtocolState::Failed;
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no response from firmware during handshake",
        )))
    }

    /// One transfer: send staged requests, read and parse the peer's packets.
    ///
    /// Frame-level corruption stages a resend request and yields no packets;
    /// a malformed packet body of a known request is dumped and skipped;
    /// structural packet damage abandons the rest of the frame.
    pub async fn exchange(&mut self) -> Result<Vec<FirmwareRequest>> {
        if self.state != ProtocolState::Ready {
            return Err(Error::Ipc("firmware link is not ready".to_string()));
        }

        let outcome = match self.transport.perform_full_transfer().await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_transient() {
                    self.state = ProtocolState::Failed;
                }
                return Err(e);
            }
        };

        let mut parsed = Vec::new();
        match outcome {
            TransferOutcome::Idle | TransferOutcome::Duplicate => {}
            TransferOutcome::BadFrame { sequence_id } => {
                let _ = self
                    .transport
                    .write_packet(host::RESEND_PACKET, &body::resend_packet(sequence_id));
            }
            TransferOutcome::Data => loop {
                match self.transport.read_packet() {
                    Ok(Some((header, packet_body))) => {
                        match FirmwareRequest::parse(&header, &packet_body) {
                            Ok(Some(FirmwareRequest::ResendPacket { packet_id })) => {
                                self.transport.resend_packet(packet_id);
                            }
                            Ok(Some(request)) => parsed.push(request),
                            Ok(None) => {
                                warn!(
                                    request = header.request,
                                    id = header.id,
                                    "unknown firmware request, skipping"
                                );
                            }
                            Err(e) => {
                                warn!(
                                    request = header.request,
                                    id = header.id,
                                    "malformed packet body, skipping: {e}"
                                );
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Structurally broken frame; ask for it again.
                        warn!("abandoning frame: {e}");
                        if let Some(sequence_id) = self.last_peer_sequence() {
                            let _ = self
                                .transport
                                .write_packet(host::RESEND_PACKET, &body::resend_packet(sequence_id));
                        }
                        break;
                    }
                }
            },
        }
        Ok(parsed)
    }

    fn last_peer_sequence(&self) -> Option<u16> {
        // The transport clears its payload on errors; the resend target is
        // whatever sequence the peer last claimed, tracked there.
        self.transport.last_peer_sequence()
    }

    // ------------------------------------------------------------------
    // Host request writers
    // ------------------------------------------------------------------

    pub fn send_code(&mut self, channel: Channel, text: &str) -> Result<u16> {
        self.transport.write_packet(host::CODE, &body::code(channel, text))
    }

    pub fn send_macro_completed(&mut self, channel: Channel, error: bool) -> Result<u16> {
        self.transport
            .write_packet(host::MACRO_COMPLETED, &body::macro_completed(channel, error))
    }

    pub fn send_set_variable(
        &mut self,
        channel: Channel,
        create_new: bool,
        name: &str,
        expr: &str,
    ) -> Result<u16> {
        self.transport.write_packet(
            host::SET_VARIABLE,
            &body::set_variable(channel, create_new, name, expr),
        )
    }

    pub fn send_evaluate_expression(&mut self, channel: Channel, expr: &str) -> Result<u16> {
        self.transport.write_packet(
            host::EVALUATE_EXPRESSION,
            &body::evaluate_expression(channel, expr),
        )
    }

    pub fn send_lock_movement(&mut self, channel: Channel) -> Result<u16> {
        self.transport
            .write_packet(host::LOCK_MOVEMENT, &body::lock_movement(channel))
    }

    pub fn send_emergency_stop(&mut self) -> Result<u16> {
        self.transport.write_packet(host::EMERGENCY_STOP, &[])
    }

    pub fn send_reset(&mut self) -> Result<u16> {
        self.transport.write_packet(host::RESET, &[])
    }

    /// Stage the standing `GetState` poll and the next `GetObjectModel`
    /// module query at the end of the outgoing buffer. Best-effort: if the
    /// buffer is full this tick, the next tick polls instead.
    pub fn stage_standing_requests(&mut self) {
        if self.transport.write_packet(host::GET_STATE, &[]).is_ok()
            && self
                .transport
                .write_packet(
                    host::GET_OBJECT_MODEL,
                    &body::get_object_model(self.next_module),
                )
                .is_ok()
        {
            self.next_module = (self.next_module + 1) % MODULE_COUNT;
        }
    }

    pub fn has_staged_data(&self) -> bool {
        self.transport.has_staged_data()
    }

    pub async fn wait_for_activity(&mut self, poll: Duration) -> Result<bool> {
        self.transport.wait_for_activity(poll).await
    }
}
