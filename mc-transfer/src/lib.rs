//! # TRANSFER ENGINE
//!
//! Owns the SPI device exclusively and performs the full-duplex, framed,
//! CRC-checked packet exchange described by `mc_proto`. No other component
//! in this workspace touches the SPI handle directly.

pub mod bus;
pub mod engine;
pub mod lines;

pub use bus::SpiBus;
pub use engine::{spawn_cycle_thread, ExchangeFailure, ExchangeOutcome, LinkError, TransferConfig, TransferEngine};
pub use lines::LinkLines;
