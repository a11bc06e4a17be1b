//! Device configuration: transport, control bytes and recovery tunables

use bci_core::{config_error, BciResult, FieldDecoding};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Control commands the driver sends to the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Stop the binary stream
    Stop,
    /// Soft reset; the board answers with its version banner
    Query,
    /// Start the binary stream
    Start,
}

/// Byte sent for each control command.
///
/// Firmware revisions disagree on the start byte (`b` vs `a`), so the whole
/// table is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlCommands {
    pub stop: u8,
    pub query: u8,
    pub start: u8,
}

impl ControlCommands {
    /// Table for firmware that starts streaming on `a`
    pub fn alternate_firmware() -> Self {
        ControlCommands { start: 0x61, ..Self::default() }
    }

    pub fn byte(&self, command: Command) -> u8 {
        match command {
            Command::Stop => self.stop,
            Command::Query => self.query,
            Command::Start => self.start,
        }
    }

    /// Reverse lookup used by the simulated board
    pub fn command(&self, byte: u8) -> Option<Command> {
        [Command::Stop, Command::Query, Command::Start]
            .into_iter()
            .find(|&command| self.byte(command) == byte)
    }
}

impl Default for ControlCommands {
    fn default() -> Self {
        ControlCommands { stop: 0x73, query: 0x76, start: 0x62 }
    }
}

/// Ready banner the board prints after a soft reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BannerConfig {
    /// Marker byte terminating the banner
    pub marker: u8,
    /// Consecutive markers that confirm the banner
    pub count: usize,
    /// How long to wait for the banner after the query command
    pub timeout_ms: u64,
}

impl Default for BannerConfig {
    fn default() -> Self {
        BannerConfig { marker: b'$', count: 3, timeout_ms: 5_000 }
    }
}

/// Device driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial port path; `None` selects the simulated board
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Bound on a single transport read before a heartbeat is emitted
    pub read_timeout_ms: u64,
    /// Bytes requested per transport read
    pub read_buffer_size: usize,
    /// Read events buffered between the read loop and the decoder
    pub event_queue: usize,
    /// Pending writes buffered in front of the command loop
    pub write_queue: usize,
    pub commands: ControlCommands,
    /// Pause after the stop command before querying the board.
    /// Revisions used anything from 10ms to 1000ms here.
    pub stop_settle_ms: u64,
    pub banner: BannerConfig,
    /// Spacing between synthesized gap-fill samples
    pub gap_fill_pacing_ms: u64,
    /// Good frames required before a frame counts as aligned and
    /// before gap/desync warnings are logged
    pub sync_threshold: u8,
    pub decoding: FieldDecoding,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            port: None,
            baud_rate: 115_200,
            read_timeout_ms: 100,
            read_buffer_size: 1024,
            event_queue: 1024,
            write_queue: 64,
            commands: ControlCommands::default(),
            stop_settle_ms: 400,
            banner: BannerConfig::default(),
            gap_fill_pacing_ms: 4,
            sync_threshold: 2,
            decoding: FieldDecoding::default(),
        }
    }
}

impl DeviceConfig {
    /// Configuration for tests and the simulated board: no pacing, short waits
    pub fn fast() -> Self {
        DeviceConfig {
            read_timeout_ms: 50,
            stop_settle_ms: 10,
            gap_fill_pacing_ms: 0,
            banner: BannerConfig { timeout_ms: 1_000, ..BannerConfig::default() },
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner.timeout_ms)
    }

    pub fn gap_fill_pacing(&self) -> Duration {
        Duration::from_millis(self.gap_fill_pacing_ms)
    }

    pub fn validate(&self) -> BciResult<()> {
        if self.read_timeout_ms == 0 {
            return Err(config_error!("read timeout must be positive"));
        }
        if self.read_buffer_size == 0 || self.event_queue == 0 || self.write_queue == 0 {
            return Err(config_error!("read buffer and queue sizes must be positive"));
        }
        if self.banner.count == 0 {
            return Err(config_error!("banner marker count must be positive"));
        }
        let bytes = [self.commands.stop, self.commands.query, self.commands.start];
        if bytes[0] == bytes[1] || bytes[1] == bytes[2] || bytes[0] == bytes[2] {
            return Err(config_error!("control command bytes must be distinct: {:?}", bytes));
        }
        Ok(())
    }
}
