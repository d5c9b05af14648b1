//! Request codes and payload layouts, both directions.
//!
//! Every body is little endian and padded to the packet alignment by the
//! transport. Parsing is a pure read of the packet body; malformed bodies
//! produce `Error::MalformedPacket` and never touch daemon state.

use bitflags::bitflags;

use crate::codes::Channel;
use crate::error::{Error, Result};
use crate::spi::PacketHeader;

// ============================================================================
// Request codes
// ============================================================================

/// Firmware → host request codes.
pub mod firmware {
    pub const RESEND_PACKET: u16 = 0;
    pub const REPORT_STATE: u16 = 1;
    pub const OBJECT_MODEL: u16 = 2;
    pub const CODE_REPLY: u16 = 3;
    pub const EXECUTE_MACRO: u16 = 4;
    pub const ABORT_FILE: u16 = 5;
    pub const STACK_EVENT: u16 = 6;
    pub const PRINT_PAUSED: u16 = 7;
    pub const HEIGHT_MAP: u16 = 8;
    pub const LOCKED: u16 = 9;
    pub const FILE_CHUNK: u16 = 10;
    pub const EVALUATION_RESULT: u16 = 11;
    pub const VARIABLE_RESULT: u16 = 12;
}

/// Host → firmware request codes.
pub mod host {
    pub const GET_STATE: u16 = 0;
    pub const GET_OBJECT_MODEL: u16 = 1;
    pub const CODE: u16 = 2;
    pub const MACRO_COMPLETED: u16 = 3;
    pub const SET_VARIABLE: u16 = 4;
    pub const EVALUATE_EXPRESSION: u16 = 5;
    pub const LOCK_MOVEMENT: u16 = 6;
    pub const RESEND_PACKET: u16 = 7;
    pub const EMERGENCY_STOP: u16 = 8;
    pub const RESET: u16 = 9;
}

bitflags! {
    /// Routing and severity flags on a `CodeReply`.
    ///
    /// The low 14 bits address channels (same layout as the busy mask).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplyFlags: u32 {
        const CHANNELS = 0x3FFF;
        const ERROR = 1 << 16;
        const WARNING = 1 << 17;
        /// More fragments of this reply follow.
        const PUSH = 1 << 30;
    }
}

impl ReplyFlags {
    pub fn channels(self) -> impl Iterator<Item = Channel> {
        let mask = (self.bits() & Self::CHANNELS.bits()) as u16;
        Channel::ALL
            .into_iter()
            .filter(move |channel| mask & channel.bit() != 0)
    }
}

/// Why the firmware paused the print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    User,
    Gcode,
    FilamentChange,
    Trigger,
    Heater,
    Driver,
    Stall,
    LowVoltage,
}

impl PauseReason {
    fn from_raw(raw: u8) -> PauseReason {
        match raw {
            1 => PauseReason::Gcode,
            2 => PauseReason::FilamentChange,
            3 => PauseReason::Trigger,
            4 => PauseReason::Heater,
            5 => PauseReason::Driver,
            6 => PauseReason::Stall,
            7 => PauseReason::LowVoltage,
            _ => PauseReason::User,
        }
    }
}

// ============================================================================
// Firmware-originated requests
// ============================================================================

/// A parsed firmware request, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareRequest {
    ResendPacket {
        packet_id: u16,
    },
    ReportState {
        busy_channels: u16,
    },
    ObjectModel {
        module: u8,
        json: Vec<u8>,
    },
    CodeReply {
        flags: ReplyFlags,
        text: String,
    },
    ExecuteMacro {
        channel: Channel,
        report_missing: bool,
        filename: String,
    },
    AbortFile {
        channel: Channel,
        abort_all: bool,
    },
    StackEvent {
        channel: Channel,
        depth: u8,
        flags: u16,
        feedrate: f32,
    },
    PrintPaused {
        file_position: u64,
        reason: PauseReason,
    },
    HeightMap {
        x_points: u16,
        y_points: u16,
        z_values: Vec<f32>,
    },
    Locked {
        channel: Channel,
    },
    FileChunk {
        offset: u32,
        max_length: u32,
        filename: String,
    },
    EvaluationResult {
        success: bool,
        result: String,
    },
    VariableResult {
        success: bool,
        result: String,
    },
}

impl FirmwareRequest {
    /// Parse a packet body. `Ok(None)` means the request code is unknown;
    /// the caller dumps it for diagnostics and moves on.
    pub fn parse(header: &PacketHeader, body: &[u8]) -> Result<Option<FirmwareRequest>> {
        let reader = Reader::new(header, body);
        let request = match header.request {
            firmware::RESEND_PACKET => FirmwareRequest::ResendPacket {
                packet_id: reader.u16(0)?,
            },
            firmware::REPORT_STATE => FirmwareRequest::ReportState {
                busy_channels: reader.u16(0)?,
            },
            firmware::OBJECT_MODEL => FirmwareRequest::ObjectModel {
                module: reader.u8(0)?,
                json: body.get(4..).unwrap_or_default().to_vec(),
            },
            firmware::CODE_REPLY => {
                let flags = ReplyFlags::from_bits_truncate(reader.u32(0)?);
                let text = reader.utf8(4, body.len().saturating_sub(4))?;
                FirmwareRequest::CodeReply { flags, text }
            }
            firmware::EXECUTE_MACRO => {
                let channel = reader.channel(0)?;
                let report_missing = reader.u8(1)? != 0;
                let length = reader.u16(2)? as usize;
                let filename = reader.utf8(4, length)?;
                FirmwareRequest::ExecuteMacro {
                    channel,
                    report_missing,
                    filename,
                }
            }
            firmware::ABORT_FILE => FirmwareRequest::AbortFile {
                channel: reader.channel(0)?,
                abort_all: reader.u8(1)? != 0,
            },
            firmware::STACK_EVENT => FirmwareRequest::StackEvent {
                channel: reader.channel(0)?,
                depth: reader.u8(1)?,
                flags: reader.u16(2)?,
                feedrate: reader.f32(4)?,
            },
            firmware::PRINT_PAUSED => FirmwareRequest::PrintPaused {
                file_position: reader.u32(0)? as u64,
                reason: PauseReason::from_raw(reader.u8(4)?),
            },
            firmware::HEIGHT_MAP => {
                let x_points = reader.u16(0)?;
                let y_points = reader.u16(2)?;
                let count = x_points as usize * y_points as usize;
                let mut z_values = Vec::with_capacity(count);
                for index in 0..count {
                    z_values.push(reader.f32(4 + index * 4)?);
                }
                FirmwareRequest::HeightMap {
                    x_points,
                    y_points,
                    z_values,
                }
            }
            firmware::LOCKED => FirmwareRequest::Locked {
                channel: reader.channel(0)?,
            },
            firmware::FILE_CHUNK => {
                let offset = reader.u32(0)?;
                let max_length = reader.u32(4)?;
                let length = reader.u16(8)? as usize;
                let filename = reader.utf8(12, length)?;
                FirmwareRequest::FileChunk {
                    offset,
                    max_length,
                    filename,
                }
            }
            firmware::EVALUATION_RESULT => FirmwareRequest::EvaluationResult {
                success: reader.u8(0)? != 0,
                result: reader.utf8(4, body.len().saturating_sub(4))?,
            },
            firmware::VARIABLE_RESULT => FirmwareRequest::VariableResult {
                success: reader.u8(0)? != 0,
                result: reader.utf8(4, body.len().saturating_sub(4))?,
            },
            _ => return Ok(None),
        };
        Ok(Some(request))
    }
}

/// Bounds-checked little-endian reads over a packet body.
struct Reader<'a> {
    request: u16,
    id: u16,
    body: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(header: &PacketHeader, body: &'a [u8]) -> Self {
        Self {
            request: header.request,
            id: header.id,
            body,
        }
    }

    fn malformed(&self, reason: String) -> Error {
        Error::MalformedPacket {
            request: self.request,
            id: self.id,
            reason,
        }
    }

    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        self.body.get(offset..offset + len).ok_or_else(|| {
            self.malformed(format!(
                "need {len} bytes at offset {offset}, body is {}",
                self.body.len()
            ))
        })
    }

    fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&self, offset: usize) -> Result<f32> {
        let b = self.bytes(offset, 4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn channel(&self, offset: usize) -> Result<Channel> {
        let raw = self.u8(offset)?;
        Channel::from_index(raw).ok_or(Error::InvalidChannel(raw))
    }

    fn utf8(&self, offset: usize, len: usize) -> Result<String> {
        let bytes = self.bytes(offset, len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| self.malformed(format!("invalid UTF-8 at offset {offset}")))
    }
}

// ============================================================================
// Host-originated request bodies
// ============================================================================

/// Body builders for host requests. The transport adds headers and padding.
pub mod body {
    use super::Channel;

    pub fn code(channel: Channel, text: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + text.len());
        body.push(channel.index() as u8);
        body.push(0);
        body.extend_from_slice(&(text.len() as u16).to_le_bytes());
        body.extend_from_slice(text.as_bytes());
        body
    }

    pub fn get_object_model(module: u8) -> Vec<u8> {
        vec![module, 0, 0, 0]
    }

    pub fn macro_completed(channel: Channel, error: bool) -> Vec<u8> {
        vec![channel.index() as u8, error as u8, 0, 0]
    }

    pub fn set_variable(channel: Channel, create_new: bool, name: &str, expr: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + name.len() + expr.len());
        body.push(channel.index() as u8);
        body.push(create_new as u8);
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&(expr.len() as u16).to_le_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(expr.as_bytes());
        body
    }

    pub fn evaluate_expression(channel: Channel, expr: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + expr.len());
        body.push(channel.index() as u8);
        body.push(0);
        body.extend_from_slice(&(expr.len() as u16).to_le_bytes());
        body.extend_from_slice(expr.as_bytes());
        body
    }

    pub fn lock_movement(channel: Channel) -> Vec<u8> {
        vec![channel.index() as u8, 0, 0, 0]
    }

    pub fn resend_packet(id: u16) -> Vec<u8> {
        let mut body = vec![0u8; 4];
        body[0..2].copy_from_slice(&id.to_le_bytes());
        body
    }
}
