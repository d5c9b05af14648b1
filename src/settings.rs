//! Daemon configuration.
//!
//! Settings come from an optional JSON file (`--config`), with CLI flags
//! overriding individual fields. Every field has a default so the daemon
//! starts with no configuration at all.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Parser)]
#[command(name = "printhostd", about = "SBC control daemon for SPI-attached motion firmware")]
pub struct Args {
    /// Path to a JSON settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the IPC socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Skip SPI and IPC bring-up; only run the host updater
    #[arg(long)]
    pub update_only: bool,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// IPC endpoint for local clients
    pub socket_path: PathBuf,
    /// Idle tick interval when neither side has data pending (ms)
    pub spi_poll_delay: u64,
    /// Host fact reconciliation interval (ms)
    pub host_update_interval: u64,
    /// Patch-batching window for subscribers (ms)
    pub socket_poll_interval: u64,
    /// Messages older than this are pruned from the model (s)
    pub max_message_age: u64,
    /// SPI transfer buffer size in bytes
    pub buffer_size: usize,
    /// Consecutive resends of one sequence id before the link is declared dead
    pub max_resends: u32,
    /// Macro stack depth limit per channel
    pub max_macro_depth: usize,
    /// Directory searched for job files
    pub gcodes_dir: PathBuf,
    /// Directory searched for macro files
    pub macros_dir: PathBuf,
    pub update_only: bool,

    // IAP timing constants, carried for the firmware-update protocol mode.
    pub iap_timeout: u64,
    pub iap_boot_delay: u64,
    pub iap_reboot_delay: u64,
    pub firmware_finished_delay: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/printhost.sock"),
            spi_poll_delay: 25,
            host_update_interval: 4000,
            socket_poll_interval: 2000,
            max_message_age: 60,
            buffer_size: 8192,
            max_resends: 3,
            max_macro_depth: 8,
            gcodes_dir: PathBuf::from("/opt/printhost/gcodes"),
            macros_dir: PathBuf::from("/opt/printhost/macros"),
            update_only: false,
            iap_timeout: 30_000,
            iap_boot_delay: 1500,
            iap_reboot_delay: 10_000,
            firmware_finished_delay: 500,
        }
    }
}

impl Settings {
    /// Load settings from the file named in `args` (if any) and apply CLI
    /// overrides on top.
    pub fn load(args: &Args) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };
        if let Some(socket) = &args.socket {
            settings.socket_path = socket.clone();
        }
        if args.update_only {
            settings.update_only = true;
        }
        Ok(settings)
    }

    pub fn spi_poll_delay(&self) -> Duration {
        Duration::from_millis(self.spi_poll_delay)
    }

    pub fn host_update_interval(&self) -> Duration {
        Duration::from_millis(self.host_update_interval)
    }

    pub fn socket_poll_interval(&self) -> Duration {
        Duration::from_millis(self.socket_poll_interval)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.buffer_size, 8192);
        assert_eq!(s.max_resends, 3);
        assert!(!s.update_only);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: Settings = serde_json::from_str(r#"{"bufferSize": 4096}"#).unwrap();
        assert_eq!(s.buffer_size, 4096);
        assert_eq!(s.spi_poll_delay, 25);
    }
}
