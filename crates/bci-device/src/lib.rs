//! BCI-Device: Framed serial protocol driver
//!
//! Decodes the board's byte stream into samples, recovers from corruption and
//! dropped frames, and coordinates reads, writes and the reset handshake over
//! a single transport. Also provides a simulated board for running without
//! hardware.

pub mod config;
pub mod decoder;
pub mod decode_task;
pub mod coordinator;
pub mod board;
pub mod test_signal;

pub use config::{BannerConfig, Command, ControlCommands, DeviceConfig};
pub use decoder::{seq_diff, DecodeEvent, DecoderStats, FrameDecoder, ReadState};
pub use decode_task::DecoderControl;
pub use coordinator::{spawn_device, DeviceEvent, DeviceHandle, DeviceTasks};
pub use board::{spawn_simulated_board, BoardConfig};
pub use test_signal::{spawn_test_signal, TestSignal};
