//! SPI device seam.
//!
//! The physical driver is an external collaborator. The daemon only needs a
//! blocking full-duplex exchange on fixed-size buffers plus the peer's
//! "data ready" edge signal, so that is the whole trait.

use std::io;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait SpiDevice: Send {
    /// Exchange `tx` and `rx` in one duplex operation. Both slices have the
    /// configured transfer buffer size.
    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;

    /// Wait for the peer's data-ready edge. Returns `false` on timeout,
    /// which is the idle-poll case, not an error.
    async fn wait_data_ready(&mut self, timeout: Duration) -> io::Result<bool>;
}

/// Device used when no hardware is attached: every exchange answers with
/// the invalid-format sentinel and the data-ready line never rises.
pub struct NullDevice;

#[async_trait]
impl SpiDevice for NullDevice {
    async fn exchange(&mut self, _tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        rx.fill(0);
        rx[0] = super::FORMAT_INVALID;
        Ok(())
    }

    async fn wait_data_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        tokio::time::sleep(timeout).await;
        Ok(false)
    }
}
