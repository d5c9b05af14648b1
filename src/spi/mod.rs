//! SPI transport framing.
//!
//! One *transfer* is a single full-duplex exchange of two fixed-size
//! buffers. Each buffer starts with a [`TransferHeader`]; the payload is a
//! sequence of [`PacketHeader`]s with 4-byte aligned bodies packed
//! back-to-back. CRC-validated frames only are acted upon; a corrupt frame
//! triggers a bounded resend cycle before the link is declared failed.

mod device;
mod packet;
mod transfer;
mod transport;

pub use device::{NullDevice, SpiDevice};
pub use packet::PacketHeader;
pub use transfer::TransferHeader;
pub use transport::{Transport, TransferOutcome};

use crc::{Crc, CRC_16_IBM_3740};

/// Checksum used for both header and payload CRCs (CRC-16/CCITT-FALSE).
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Format byte of frames sent by this host.
pub const FORMAT_HOST: u8 = 0x5F;
/// Format byte of frames sent by the firmware.
pub const FORMAT_FIRMWARE: u8 = 0x60;
/// Sentinel the firmware sends when it has nothing new.
pub const FORMAT_INVALID: u8 = 0xC9;

/// Current SPI protocol version. Mismatches are fatal.
pub const PROTOCOL_VERSION: u16 = 5;

/// Pad a payload length to the 4-byte packet alignment.
pub const fn padded(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_four() {
        assert_eq!(padded(0), 0);
        assert_eq!(padded(1), 4);
        assert_eq!(padded(4), 4);
        assert_eq!(padded(5), 8);
    }
}
