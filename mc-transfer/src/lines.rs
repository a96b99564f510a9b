//! # HANDSHAKE LINES
//!
//! The two GPIO lines used by the handshake (§4.1) are abstracted behind a
//! trait so the engine can be exercised without real hardware, the same way
//! the teacher's [`primitive::Client`] is exercised over a loopback
//! `TcpStream` rather than a real serial port.
//!
//! [`primitive::Client`]: https://docs.rs/semi_e37 (teacher reference, not a real dependency)

use std::time::Duration;

/// Hardware handshake lines between the SBC and the firmware.
pub trait LinkLines: Send {
  /// Asserts the SBC-ready line.
  fn assert_sbc_ready(&mut self);

  /// Deasserts the SBC-ready line (used during resync).
  fn deassert_sbc_ready(&mut self);

  /// Blocks until the firmware-ready line is asserted or `timeout` elapses;
  /// returns whether it was seen in time.
  fn wait_firmware_ready(&mut self, timeout: Duration) -> bool;

  /// Toggles the transfer-direction line, used after a handshake timeout.
  fn toggle_transfer_direction(&mut self);

  /// Holds the SBC-ready line low for `duration`, the first step of resync.
  fn hold_sbc_ready_low(&mut self, duration: Duration);
}

/// An in-memory [`LinkLines`] double for tests: firmware-ready can be
/// scripted to assert immediately, never, or after N polls.
#[cfg(test)]
pub struct LoopbackLines {
  pub firmware_ready_after: u32,
  polls: u32,
  pub sbc_ready: bool,
  pub direction_toggles: u32,
  pub held_low_for: Vec<Duration>,
}

#[cfg(test)]
impl LoopbackLines {
  pub fn always_ready() -> Self {
    Self {
      firmware_ready_after: 0,
      polls: 0,
      sbc_ready: false,
      direction_toggles: 0,
      held_low_for: Vec::new(),
    }
  }

  pub fn never_ready() -> Self {
    Self {
      firmware_ready_after: u32::MAX,
      polls: 0,
      sbc_ready: false,
      direction_toggles: 0,
      held_low_for: Vec::new(),
    }
  }
}

#[cfg(test)]
impl LinkLines for LoopbackLines {
  fn assert_sbc_ready(&mut self) {
    self.sbc_ready = true;
  }

  fn deassert_sbc_ready(&mut self) {
    self.sbc_ready = false;
  }

  fn wait_firmware_ready(&mut self, _timeout: Duration) -> bool {
    self.polls += 1;
    self.polls > self.firmware_ready_after
  }

  fn toggle_transfer_direction(&mut self) {
    self.direction_toggles += 1;
  }

  fn hold_sbc_ready_low(&mut self, duration: Duration) {
    self.sbc_ready = false;
    self.held_low_for.push(duration);
  }
}
